//! Test helpers for mvirt-dshell integration tests.
//!
//! `FakeCluster` plays both the resource manager and the node agents. Every
//! request is granted at once as a single-container batch; every started
//! container finishes with the next scripted outcome.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use mvirt_dshell::clients::{
    NmEvent, NodeAgentClient, ProgressFn, RegisterResponse, ResourceManagerClient, RmEvent,
};
use mvirt_dshell::config::{MasterConfig, NodeAgentAddress};
use mvirt_dshell::error::ClientError;
use mvirt_dshell::launcher::{LaunchContext, ScriptStager, TargetOs};
use mvirt_dshell::records::{
    exit_status, ApplicationAttemptId, Container, ContainerId, ContainerRequest, ContainerState,
    ContainerStatus, FinalApplicationStatus, NodeId, Priority, Resource,
};
use mvirt_dshell::ControllerOptions;

/// What a started container does.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// Starts and exits with this status.
    Exit(i32),
    /// The node agent refuses to start it.
    StartError,
    /// Starts and never finishes.
    Hang,
}

pub fn attempt() -> ApplicationAttemptId {
    ApplicationAttemptId {
        cluster_timestamp: 1700000000000,
        app_id: 1,
        attempt: 1,
    }
}

pub fn node() -> NodeId {
    NodeId {
        host: "node1".to_string(),
        port: 8041,
    }
}

pub fn container(sequence: u64) -> Container {
    Container {
        id: ContainerId::new(attempt(), sequence),
        node_id: node(),
        node_http_address: "node1:8042".to_string(),
        resource: Resource::new(128, 1),
        priority: Priority(0),
    }
}

/// Job configuration running `echo hello` in `total` containers.
pub fn config(total: u32) -> MasterConfig {
    MasterConfig {
        attempt_id: attempt(),
        submit_time: 1700000000000,
        node_agent: NodeAgentAddress {
            host: "node1".to_string(),
            port: 8041,
            http_port: 8042,
        },
        num_containers: total,
        capability: Resource::new(128, 1),
        priority: Priority(0),
        shell_command: "echo".to_string(),
        shell_args: "hello".to_string(),
        shell_env: HashMap::new(),
        files: Vec::new(),
        script: None,
        target_os: TargetOs::Unix,
        host: "localhost".to_string(),
        user: "tester".to_string(),
    }
}

pub fn fast_options() -> ControllerOptions {
    ControllerOptions {
        recheck_interval: Duration::from_millis(10),
        launcher_join_timeout: Duration::from_secs(1),
        timeline_flush_timeout: Duration::from_secs(1),
    }
}

#[derive(Default)]
struct FakeState {
    max_capability: Mutex<Option<Resource>>,
    inherited: Mutex<Vec<Container>>,
    outcomes: Mutex<VecDeque<Outcome>>,
    rm_events: Mutex<Option<mpsc::UnboundedSender<RmEvent>>>,
    nm_events: Mutex<Option<mpsc::UnboundedSender<NmEvent>>>,
    next_sequence: AtomicU64,
    requests: Mutex<Vec<ContainerRequest>>,
    started: Mutex<Vec<ContainerId>>,
    contexts: Mutex<Vec<LaunchContext>>,
    registration: Mutex<Option<(String, i32, String)>>,
    unregistered: Mutex<Option<(FinalApplicationStatus, Option<String>)>>,
    rm_stops: AtomicU32,
    nm_stops: AtomicU32,
}

impl FakeState {
    fn send_rm(&self, event: RmEvent) {
        if let Some(tx) = self.rm_events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn send_nm(&self, event: NmEvent) {
        if let Some(tx) = self.nm_events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.state.next_sequence.store(2, Ordering::SeqCst);
        cluster
    }

    /// Outcomes for started containers, in start order. Containers beyond the
    /// script exit 0.
    pub fn with_outcomes(self, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.state.outcomes.lock().unwrap().extend(outcomes);
        self
    }

    pub fn with_inherited(self, containers: Vec<Container>) -> Self {
        *self.state.inherited.lock().unwrap() = containers;
        self
    }

    pub fn with_max_capability(self, max: Resource) -> Self {
        *self.state.max_capability.lock().unwrap() = Some(max);
        self
    }

    pub fn resource_manager(&self) -> Arc<dyn ResourceManagerClient> {
        Arc::new(FakeResourceManager {
            state: Arc::clone(&self.state),
        })
    }

    pub fn node_agent(&self) -> Arc<dyn NodeAgentClient> {
        Arc::new(FakeNodeAgent {
            state: Arc::clone(&self.state),
        })
    }

    /// Deliver an event as if the resource manager sent it.
    pub fn inject(&self, event: RmEvent) {
        self.state.send_rm(event);
    }

    pub fn requests(&self) -> Vec<ContainerRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<ContainerId> {
        self.state.started.lock().unwrap().clone()
    }

    pub fn launch_contexts(&self) -> Vec<LaunchContext> {
        self.state.contexts.lock().unwrap().clone()
    }

    pub fn registration(&self) -> Option<(String, i32, String)> {
        self.state.registration.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Option<(FinalApplicationStatus, Option<String>)> {
        self.state.unregistered.lock().unwrap().clone()
    }

    pub fn rm_stops(&self) -> u32 {
        self.state.rm_stops.load(Ordering::SeqCst)
    }

    pub fn nm_stops(&self) -> u32 {
        self.state.nm_stops.load(Ordering::SeqCst)
    }

    /// Poll until `n` containers were handed to the node agent.
    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("containers not started in time");
    }
}

struct FakeResourceManager {
    state: Arc<FakeState>,
}

#[async_trait]
impl ResourceManagerClient for FakeResourceManager {
    async fn start(
        &self,
        events: mpsc::UnboundedSender<RmEvent>,
        _progress: ProgressFn,
    ) -> Result<(), ClientError> {
        *self.state.rm_events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn register(
        &self,
        host: &str,
        rpc_port: i32,
        tracking_url: &str,
    ) -> Result<RegisterResponse, ClientError> {
        *self.state.registration.lock().unwrap() =
            Some((host.to_string(), rpc_port, tracking_url.to_string()));
        Ok(RegisterResponse {
            max_capability: self
                .state
                .max_capability
                .lock()
                .unwrap()
                .unwrap_or(Resource::new(8192, 8)),
            containers_from_previous_attempts: self.state.inherited.lock().unwrap().clone(),
        })
    }

    fn add_container_request(&self, request: ContainerRequest) {
        self.state.requests.lock().unwrap().push(request);
        let sequence = self.state.next_sequence.fetch_add(1, Ordering::SeqCst);
        let granted = Container {
            resource: request.capability,
            priority: request.priority,
            ..container(sequence)
        };
        self.state.send_rm(RmEvent::ContainersAllocated(vec![granted]));
    }

    async fn unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<&str>,
    ) -> Result<(), ClientError> {
        *self.state.unregistered.lock().unwrap() = Some((status, message.map(str::to_string)));
        Ok(())
    }

    async fn stop(&self) {
        self.state.rm_stops.fetch_add(1, Ordering::SeqCst);
        self.state.rm_events.lock().unwrap().take();
    }
}

struct FakeNodeAgent {
    state: Arc<FakeState>,
}

#[async_trait]
impl NodeAgentClient for FakeNodeAgent {
    async fn start(&self, events: mpsc::UnboundedSender<NmEvent>) -> Result<(), ClientError> {
        *self.state.nm_events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn start_container(&self, container: &Container, context: LaunchContext) {
        let id = container.id;
        self.state.started.lock().unwrap().push(id);
        self.state.contexts.lock().unwrap().push(context);
        let outcome = self
            .state
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Exit(exit_status::SUCCESS));

        match outcome {
            Outcome::Exit(code) => {
                self.state.send_nm(NmEvent::Started {
                    container_id: id,
                    service_data: HashMap::new(),
                });
                self.state
                    .send_rm(RmEvent::ContainersCompleted(vec![ContainerStatus::completed(
                        id, code,
                    )]));
            }
            Outcome::StartError => self.state.send_nm(NmEvent::StartError {
                container_id: id,
                error: ClientError::StartFailed("no space left on device".to_string()),
            }),
            Outcome::Hang => self.state.send_nm(NmEvent::Started {
                container_id: id,
                service_data: HashMap::new(),
            }),
        }
    }

    async fn get_container_status(&self, container_id: &ContainerId, _node_id: &NodeId) {
        self.state.send_nm(NmEvent::StatusReceived {
            container_id: *container_id,
            status: ContainerStatus {
                container_id: *container_id,
                state: ContainerState::Running,
                exit_status: exit_status::INVALID,
                diagnostics: String::new(),
            },
        });
    }

    async fn stop(&self) {
        self.state.nm_stops.fetch_add(1, Ordering::SeqCst);
        self.state.nm_events.lock().unwrap().take();
    }
}

/// Script stager that fails on its `fail_on`-th call (1-based).
pub struct FlakyStager {
    calls: AtomicU32,
    fail_on: u32,
}

impl FlakyStager {
    pub fn failing_on(fail_on: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_on,
        }
    }
}

#[async_trait]
impl ScriptStager for FlakyStager {
    async fn finalize(&self, _from: &str, _to: &str) -> io::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        }
        Ok(())
    }
}
