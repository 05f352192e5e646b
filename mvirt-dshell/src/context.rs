//! State shared by every task of one application attempt.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::clients::{NodeAgentClient, ResourceManagerClient};
use crate::counters::JobCounters;
use crate::launcher::{LaunchSpec, ScriptStager};
use crate::records::ApplicationAttemptId;
use crate::registry::ContainerRegistry;
use crate::timeline::Timeline;

/// Shared handle passed to the negotiator, listener and every launcher.
pub struct JobContext {
    pub attempt: ApplicationAttemptId,
    pub counters: Arc<JobCounters>,
    pub registry: ContainerRegistry,
    pub launch: LaunchSpec,
    pub stager: Arc<dyn ScriptStager>,
    pub resource_manager: Arc<dyn ResourceManagerClient>,
    pub node_agent: Arc<dyn NodeAgentClient>,
    pub timeline: Timeline,
    pub launch_tasks: LaunchTasks,
}

/// Join handles of every launcher spawned so far.
#[derive(Default)]
pub struct LaunchTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LaunchTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join every recorded launcher, waiting at most `per_task` for each.
    ///
    /// A launcher that does not finish in time is left running. Returns the
    /// number of launchers abandoned that way.
    pub async fn join_all(&self, per_task: Duration) -> usize {
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut abandoned = 0;
        for handle in handles {
            match tokio::time::timeout(per_task, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Launcher task failed"),
                Err(_) => {
                    warn!("Launcher task did not finish in time, abandoning it");
                    abandoned += 1;
                }
            }
        }
        abandoned
    }
}
