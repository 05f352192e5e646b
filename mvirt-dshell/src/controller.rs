//! Drives one application attempt from registration to unregistration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::clients::{NodeAgentClient, ProgressFn, ResourceManagerClient};
use crate::config::MasterConfig;
use crate::context::{JobContext, LaunchTasks};
use crate::counters::{CounterSnapshot, JobCounters};
use crate::credentials::Credentials;
use crate::error::Result;
use crate::launcher::{LocalScriptStager, ScriptStager};
use crate::listener::NodeAgentListener;
use crate::negotiator::ResourceNegotiator;
use crate::records::{ContainerRequest, FinalApplicationStatus};
use crate::registry::ContainerRegistry;
use crate::timeline::Timeline;

/// Fallback re-check of the completion predicate while waiting.
pub const WAIT_RECHECK_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound on joining a single launcher during drain.
pub const LAUNCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub recheck_interval: Duration,
    pub launcher_join_timeout: Duration,
    pub timeline_flush_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            recheck_interval: WAIT_RECHECK_INTERVAL,
            launcher_join_timeout: LAUNCHER_JOIN_TIMEOUT,
            timeline_flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Verdict of the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: FinalApplicationStatus,
    pub message: Option<String>,
    pub counters: CounterSnapshot,
}

impl JobOutcome {
    /// Succeeded iff every container completed and none failed.
    pub fn from_counters(counters: CounterSnapshot) -> Self {
        if counters.failed == 0 && counters.completed == counters.total {
            JobOutcome {
                status: FinalApplicationStatus::Succeeded,
                message: None,
                counters,
            }
        } else {
            JobOutcome {
                status: FinalApplicationStatus::Failed,
                message: Some(format!("Diagnostics., {}", counters)),
                counters,
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == FinalApplicationStatus::Succeeded
    }
}

pub struct Controller {
    config: MasterConfig,
    credentials: Credentials,
    resource_manager: Arc<dyn ResourceManagerClient>,
    node_agent: Arc<dyn NodeAgentClient>,
    timeline: Timeline,
    stager: Arc<dyn ScriptStager>,
    options: ControllerOptions,
}

impl Controller {
    pub fn new(
        config: MasterConfig,
        resource_manager: Arc<dyn ResourceManagerClient>,
        node_agent: Arc<dyn NodeAgentClient>,
    ) -> Self {
        Self {
            config,
            credentials: Credentials::default(),
            resource_manager,
            node_agent,
            timeline: Timeline::new_noop(),
            stager: Arc::new(LocalScriptStager),
            options: ControllerOptions::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_stager(mut self, stager: Arc<dyn ScriptStager>) -> Self {
        self.stager = stager;
        self
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the attempt to completion.
    pub async fn run(self) -> Result<JobOutcome> {
        self.run_until(std::future::pending()).await
    }

    /// Run the attempt, ending the wait early when `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<JobOutcome>
    where
        F: Future<Output = ()>,
    {
        info!(attempt = %self.config.attempt_id, "Starting application master");

        let tokens = self.credentials.container_blob()?;
        let ctx = Arc::new(JobContext {
            attempt: self.config.attempt_id,
            counters: Arc::new(JobCounters::new(self.config.num_containers)),
            registry: ContainerRegistry::new(),
            launch: self.config.launch_spec(tokens),
            stager: self.stager,
            resource_manager: self.resource_manager,
            node_agent: self.node_agent,
            timeline: self.timeline,
            launch_tasks: LaunchTasks::new(),
        });
        ctx.timeline.attempt_started(&ctx.attempt);

        let (rm_tx, rm_rx) = mpsc::unbounded_channel();
        let (nm_tx, nm_rx) = mpsc::unbounded_channel();

        let progress: ProgressFn = {
            let counters = Arc::clone(&ctx.counters);
            Arc::new(move || counters.progress())
        };
        ctx.resource_manager.start(rm_tx, progress).await?;
        if let Err(e) = ctx.node_agent.start(nm_tx).await {
            ctx.resource_manager.stop().await;
            return Err(e.into());
        }
        let listener = tokio::spawn(NodeAgentListener::new(Arc::clone(&ctx)).run(nm_rx));

        let response = match ctx
            .resource_manager
            .register(&self.config.host, -1, "")
            .await
        {
            Ok(r) => r,
            Err(e) => {
                ctx.node_agent.stop().await;
                ctx.resource_manager.stop().await;
                listener.abort();
                return Err(e.into());
            }
        };

        let max = response.max_capability;
        info!(
            max_memory_mb = max.memory_mb,
            max_vcores = max.vcores,
            "Max capability of resources in this cluster"
        );
        let capability = self.config.capability.clamp_to(max);
        if capability != self.config.capability {
            info!(
                requested = %self.config.capability,
                granted = %capability,
                "Container capability exceeds cluster maximum, using max value"
            );
        }

        let inherited = response.containers_from_previous_attempts.len() as u32;
        info!(
            attempt = %ctx.attempt,
            count = inherited,
            "Received containers from previous attempts"
        );
        ctx.counters.add_allocated(inherited);

        let request = ContainerRequest {
            capability,
            priority: self.config.priority,
        };
        let negotiator =
            tokio::spawn(ResourceNegotiator::new(Arc::clone(&ctx), request).run(rm_rx));

        let needed = ctx.counters.total().saturating_sub(inherited);
        for _ in 0..needed {
            ctx.resource_manager.add_container_request(request);
        }
        // Inherited containers hold slots of their own; replacement sizing
        // must not ask for them again.
        ctx.counters.set_requested(needed + inherited);
        info!(count = needed, request = %request, "Requested containers");

        tokio::select! {
            _ = ctx.counters.wait_finished(self.options.recheck_interval) => {}
            _ = shutdown => {
                info!("Shutdown signal received");
                ctx.counters.mark_done();
            }
        }

        info!(
            registered = ctx.registry.len(),
            "Application completed, stopping running containers"
        );
        let abandoned = ctx
            .launch_tasks
            .join_all(self.options.launcher_join_timeout)
            .await;
        if abandoned > 0 {
            warn!(count = abandoned, "Abandoned unfinished launchers");
        }
        ctx.node_agent.stop().await;

        let outcome = JobOutcome::from_counters(ctx.counters.snapshot());
        info!(
            status = %outcome.status,
            counters = %outcome.counters,
            "Application completed, signalling finish to RM"
        );

        if let Err(e) = ctx
            .resource_manager
            .unregister(outcome.status, outcome.message.as_deref())
            .await
        {
            warn!(error = %e, "Failed to unregister application");
        }
        ctx.resource_manager.stop().await;

        ctx.timeline.attempt_ended(&ctx.attempt);
        ctx.timeline.flush(self.options.timeline_flush_timeout).await;

        negotiator.abort();
        listener.abort();

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(total: u32, completed: u32, failed: u32) -> CounterSnapshot {
        CounterSnapshot {
            total,
            requested: total,
            allocated: total,
            completed,
            failed,
        }
    }

    #[test]
    fn test_outcome_success() {
        let outcome = JobOutcome::from_counters(snapshot(3, 3, 0));
        assert!(outcome.succeeded());
        assert_eq!(outcome.message, None);
    }

    #[test]
    fn test_outcome_failure_message() {
        let outcome = JobOutcome::from_counters(snapshot(3, 3, 1));
        assert_eq!(outcome.status, FinalApplicationStatus::Failed);
        assert_eq!(
            outcome.message.as_deref(),
            Some("Diagnostics., total=3, completed=3, allocated=3, failed=1")
        );
    }

    #[test]
    fn test_outcome_incomplete_is_failure() {
        // Shutdown or client error before every container finished.
        let outcome = JobOutcome::from_counters(snapshot(4, 2, 0));
        assert!(!outcome.succeeded());
    }
}
