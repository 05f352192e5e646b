//! In-process cluster for running the master stand-alone.
//!
//! The resource manager hands out a fixed number of slots on a single node and
//! reports completions on its heartbeat. The node agent runs each container as
//! a local shell process in its own work directory.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    NmEvent, NodeAgentClient, ProgressFn, RegisterResponse, ResourceManagerClient, RmEvent,
};
use crate::credentials::TOKEN_FILE_ENV;
use crate::error::ClientError;
use crate::launcher::{LaunchContext, LOG_DIR_EXPANSION_VAR};
use crate::manifest::LocalResource;
use crate::records::{
    exit_status, ApplicationAttemptId, Container, ContainerId, ContainerRequest, ContainerState,
    ContainerStatus, FinalApplicationStatus, NodeId, NodeReport, Resource,
};

/// Floor for the heartbeat period; `tokio::time::interval` rejects zero.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct LocalClusterConfig {
    /// Largest container the resource manager grants.
    pub max_capability: Resource,
    /// Containers that may run at the same time.
    pub slots: u32,
    pub heartbeat_interval: Duration,
    /// Allocated containers not started within this window give their slot
    /// back.
    pub allocation_expiry: Duration,
    /// Root of the container work and log directories. Must be absolute.
    pub work_dir: PathBuf,
    pub node: NodeId,
    pub node_http_port: u16,
}

#[derive(Default)]
struct Scheduler {
    pending: VecDeque<ContainerRequest>,
    running: u32,
    unstarted: HashMap<ContainerId, Instant>,
    finished: Vec<ContainerStatus>,
    final_status: Option<(FinalApplicationStatus, Option<String>)>,
}

#[derive(Default)]
struct Node {
    kill_switches: HashMap<ContainerId, oneshot::Sender<()>>,
    statuses: HashMap<ContainerId, ContainerStatus>,
    stopped: bool,
}

struct ClusterState {
    config: LocalClusterConfig,
    attempt: ApplicationAttemptId,
    next_sequence: AtomicU64,
    scheduler: Mutex<Scheduler>,
    node: Mutex<Node>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterState {
    fn node_http_address(&self) -> String {
        format!("{}:{}", self.config.node.host, self.config.node_http_port)
    }

    /// Grant queued requests while slots are free and collect finished
    /// containers since the last heartbeat.
    fn heartbeat(&self) -> (Vec<ContainerStatus>, Vec<Container>) {
        let mut scheduler = lock(&self.scheduler);
        let completed = std::mem::take(&mut scheduler.finished);

        let now = Instant::now();
        let expiry = self.config.allocation_expiry;
        let before = scheduler.unstarted.len();
        scheduler.unstarted.retain(|id, allocated_at| {
            let live = now.duration_since(*allocated_at) < expiry;
            if !live {
                warn!(container_id = %id, "Allocated container never started, releasing its slot");
            }
            live
        });
        let expired = (before - scheduler.unstarted.len()) as u32;
        scheduler.running = scheduler.running.saturating_sub(expired);

        let mut allocated = Vec::new();
        while scheduler.running < self.config.slots {
            let Some(request) = scheduler.pending.pop_front() else {
                break;
            };
            if !request.capability.fits_within(&self.config.max_capability) {
                warn!(request = %request, "Dropping request above the cluster maximum");
                continue;
            }
            scheduler.running += 1;
            // Sequence 1 is the master's own container.
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let id = ContainerId::new(self.attempt, sequence);
            scheduler.unstarted.insert(id, now);
            allocated.push(Container {
                id,
                node_id: self.config.node.clone(),
                node_http_address: self.node_http_address(),
                resource: request.capability,
                priority: request.priority,
            });
        }
        (completed, allocated)
    }

    /// Returns false if the allocation already expired.
    fn claim_allocation(&self, id: &ContainerId) -> bool {
        lock(&self.scheduler).unstarted.remove(id).is_some()
    }

    fn release_slot(&self, completion: Option<ContainerStatus>) {
        let mut scheduler = lock(&self.scheduler);
        scheduler.running = scheduler.running.saturating_sub(1);
        if let Some(status) = completion {
            scheduler.finished.push(status);
        }
    }
}

/// Handle on both halves of the local cluster.
pub struct LocalCluster {
    state: Arc<ClusterState>,
    resource_manager: Arc<LocalResourceManager>,
    node_agent: Arc<LocalNodeAgent>,
}

impl LocalCluster {
    pub fn new(config: LocalClusterConfig, attempt: ApplicationAttemptId) -> Self {
        let state = Arc::new(ClusterState {
            config,
            attempt,
            next_sequence: AtomicU64::new(2),
            scheduler: Mutex::new(Scheduler::default()),
            node: Mutex::new(Node::default()),
        });
        Self {
            resource_manager: Arc::new(LocalResourceManager {
                state: Arc::clone(&state),
                heartbeat: Mutex::new(None),
            }),
            node_agent: Arc::new(LocalNodeAgent {
                state: Arc::clone(&state),
                events: Mutex::new(None),
            }),
            state,
        }
    }

    pub fn resource_manager(&self) -> Arc<LocalResourceManager> {
        Arc::clone(&self.resource_manager)
    }

    pub fn node_agent(&self) -> Arc<LocalNodeAgent> {
        Arc::clone(&self.node_agent)
    }

    /// Status and message the master unregistered with, if it did.
    pub fn final_status(&self) -> Option<(FinalApplicationStatus, Option<String>)> {
        lock(&self.state.scheduler).final_status.clone()
    }
}

pub struct LocalResourceManager {
    state: Arc<ClusterState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ResourceManagerClient for LocalResourceManager {
    async fn start(
        &self,
        events: mpsc::UnboundedSender<RmEvent>,
        progress: ProgressFn,
    ) -> Result<(), ClientError> {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let report = NodeReport {
                node_id: state.config.node.clone(),
                http_address: state.node_http_address(),
                num_containers: state.config.slots,
                healthy: true,
            };
            if events.send(RmEvent::NodesUpdated(vec![report])).is_err() {
                return;
            }

            let period = state.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                debug!(progress = progress(), "Heartbeat");

                let (completed, allocated) = state.heartbeat();
                if !completed.is_empty()
                    && events.send(RmEvent::ContainersCompleted(completed)).is_err()
                {
                    break;
                }
                if !allocated.is_empty()
                    && events.send(RmEvent::ContainersAllocated(allocated)).is_err()
                {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.heartbeat).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn register(
        &self,
        host: &str,
        rpc_port: i32,
        tracking_url: &str,
    ) -> Result<RegisterResponse, ClientError> {
        if lock(&self.heartbeat).is_none() {
            return Err(ClientError::NotRunning);
        }
        info!(
            host = %host,
            rpc_port = rpc_port,
            tracking_url = %tracking_url,
            "Application master registered"
        );
        Ok(RegisterResponse {
            max_capability: self.state.config.max_capability,
            containers_from_previous_attempts: Vec::new(),
        })
    }

    fn add_container_request(&self, request: ContainerRequest) {
        lock(&self.state.scheduler).pending.push_back(request);
    }

    async fn unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<&str>,
    ) -> Result<(), ClientError> {
        info!(status = %status, message = message.unwrap_or(""), "Application master unregistered");
        lock(&self.state.scheduler).final_status = Some((status, message.map(str::to_string)));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = lock(&self.heartbeat).take() {
            handle.abort();
            debug!("Resource manager client stopped");
        }
    }
}

pub struct LocalNodeAgent {
    state: Arc<ClusterState>,
    events: Mutex<Option<mpsc::UnboundedSender<NmEvent>>>,
}

#[cfg(unix)]
fn shell(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(unix))]
fn shell(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    exit_status::INVALID
}

async fn localize(work_dir: &Path, key: &str, resource: &LocalResource) -> io::Result<()> {
    if !resource.location.is_local() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot localize {} from {}", key, resource.location),
        ));
    }
    link_resource(Path::new(&resource.location.file), &work_dir.join(key)).await
}

#[cfg(unix)]
async fn link_resource(source: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(source, link).await
}

#[cfg(not(unix))]
async fn link_resource(source: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::copy(source, link).await.map(|_| ())
}

/// Prepare the container directories and spawn its command.
async fn spawn_container(
    root: &Path,
    container: &Container,
    context: &LaunchContext,
) -> io::Result<Child> {
    let container_dir = root.join(container.id.to_string());
    let log_dir = container_dir.join("logs");
    let work_dir = container_dir.join("work");
    tokio::fs::create_dir_all(&log_dir).await?;
    tokio::fs::create_dir_all(&work_dir).await?;

    for (key, resource) in &context.local_resources {
        localize(&work_dir, key, resource).await?;
    }

    let tokens_path = container_dir.join("container_tokens");
    tokio::fs::write(&tokens_path, context.tokens.as_bytes()).await?;

    let line = context
        .commands
        .join(" ")
        .replace(LOG_DIR_EXPANSION_VAR, &log_dir.to_string_lossy());
    debug!(container_id = %container.id, command = %line, "Spawning container process");

    let mut cmd = shell(&line);
    cmd.current_dir(&work_dir)
        .envs(&context.environment)
        .env("CONTAINER_ID", container.id.to_string())
        .env("LOG_DIRS", &log_dir)
        .env(TOKEN_FILE_ENV, &tokens_path)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd.spawn()
}

async fn run_container(
    state: Arc<ClusterState>,
    events: mpsc::UnboundedSender<NmEvent>,
    container: Container,
    context: LaunchContext,
) {
    let id = container.id;
    if !state.claim_allocation(&id) {
        let _ = events.send(NmEvent::StartError {
            container_id: id,
            error: ClientError::StartFailed(format!("allocation of {} expired", id)),
        });
        return;
    }
    let mut child = match spawn_container(&state.config.work_dir, &container, &context).await {
        Ok(child) => child,
        Err(e) => {
            error!(container_id = %id, error = %e, "Container failed to start");
            state.release_slot(None);
            let _ = events.send(NmEvent::StartError {
                container_id: id,
                error: ClientError::StartFailed(e.to_string()),
            });
            return;
        }
    };
    info!(container_id = %id, pid = ?child.id(), "Container process started");

    let (kill_tx, kill_rx) = oneshot::channel();
    let accepted = {
        let mut node = lock(&state.node);
        if node.stopped {
            false
        } else {
            node.kill_switches.insert(id, kill_tx);
            node.statuses.insert(
                id,
                ContainerStatus {
                    container_id: id,
                    state: ContainerState::Running,
                    exit_status: exit_status::INVALID,
                    diagnostics: String::new(),
                },
            );
            true
        }
    };
    if !accepted {
        let _ = child.kill().await;
        state.release_slot(None);
        let _ = events.send(NmEvent::Stopped { container_id: id });
        return;
    }
    let _ = events.send(NmEvent::Started {
        container_id: id,
        service_data: HashMap::new(),
    });

    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to wait for container process");
                    exit_status::INVALID
                }
            };
            info!(container_id = %id, exit_status = code, "Container process exited");

            let completion = ContainerStatus::completed(id, code);
            {
                let mut node = lock(&state.node);
                node.kill_switches.remove(&id);
                node.statuses.insert(id, completion.clone());
            }
            state.release_slot(Some(completion));
        }
        _ = kill_rx => {
            info!(container_id = %id, "Killing container process");
            let event = match child.kill().await {
                Ok(()) => NmEvent::Stopped { container_id: id },
                Err(e) => NmEvent::StopError {
                    container_id: id,
                    error: ClientError::Remote(e.to_string()),
                },
            };
            state.release_slot(None);
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl NodeAgentClient for LocalNodeAgent {
    async fn start(&self, events: mpsc::UnboundedSender<NmEvent>) -> Result<(), ClientError> {
        lock(&self.state.node).stopped = false;
        *lock(&self.events) = Some(events);
        Ok(())
    }

    async fn start_container(&self, container: &Container, context: LaunchContext) {
        let Some(events) = lock(&self.events).clone() else {
            warn!(container_id = %container.id, "Node agent client not running");
            return;
        };
        tokio::spawn(run_container(
            Arc::clone(&self.state),
            events,
            container.clone(),
            context,
        ));
    }

    async fn get_container_status(&self, container_id: &ContainerId, node_id: &NodeId) {
        let Some(events) = lock(&self.events).clone() else {
            return;
        };
        let status = lock(&self.state.node).statuses.get(container_id).cloned();
        let event = match status {
            Some(status) => NmEvent::StatusReceived {
                container_id: *container_id,
                status,
            },
            None => NmEvent::StatusError {
                container_id: *container_id,
                error: ClientError::Remote(format!(
                    "container {} unknown on {}",
                    container_id, node_id
                )),
            },
        };
        let _ = events.send(event);
    }

    async fn stop(&self) {
        let switches: Vec<_> = {
            let mut node = lock(&self.state.node);
            node.stopped = true;
            node.kill_switches.drain().collect()
        };
        for (id, switch) in switches {
            debug!(container_id = %id, "Stopping container");
            let _ = switch.send(());
        }
        lock(&self.events).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::TokenBlob;
    use std::collections::BTreeMap;

    fn attempt() -> ApplicationAttemptId {
        ApplicationAttemptId {
            cluster_timestamp: 1700000000000,
            app_id: 1,
            attempt: 1,
        }
    }

    fn cluster(work_dir: &Path, slots: u32) -> LocalCluster {
        cluster_with_expiry(work_dir, slots, Duration::from_secs(600))
    }

    fn cluster_config(work_dir: &Path, slots: u32) -> LocalClusterConfig {
        LocalClusterConfig {
            max_capability: Resource::new(1024, 4),
            slots,
            heartbeat_interval: Duration::from_millis(20),
            allocation_expiry: Duration::from_secs(600),
            work_dir: work_dir.to_path_buf(),
            node: NodeId {
                host: "localhost".to_string(),
                port: 8041,
            },
            node_http_port: 8042,
        }
    }

    fn cluster_with_expiry(work_dir: &Path, slots: u32, allocation_expiry: Duration) -> LocalCluster {
        LocalCluster::new(
            LocalClusterConfig {
                allocation_expiry,
                ..cluster_config(work_dir, slots)
            },
            attempt(),
        )
    }

    fn request() -> ContainerRequest {
        ContainerRequest {
            capability: Resource::new(128, 1),
            priority: crate::records::Priority(0),
        }
    }

    fn context(command: &str) -> LaunchContext {
        LaunchContext {
            environment: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            local_resources: BTreeMap::new(),
            commands: vec![command.to_string()],
            tokens: TokenBlob::new(b"{\"tokens\":[]}".to_vec()),
        }
    }

    #[test]
    fn test_heartbeat_respects_slots() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path(), 2);
        for _ in 0..3 {
            cluster.resource_manager().add_container_request(request());
        }

        let (_, allocated) = cluster.state.heartbeat();
        assert_eq!(allocated.len(), 2);
        assert_eq!(allocated[0].id.sequence, 2);
        assert_eq!(allocated[1].id.sequence, 3);

        let (_, allocated) = cluster.state.heartbeat();
        assert!(allocated.is_empty());

        let done = ContainerStatus::completed(allocated_id(3), 0);
        cluster.state.release_slot(Some(done.clone()));
        let (completed, allocated) = cluster.state.heartbeat();
        assert_eq!(completed, vec![done]);
        assert_eq!(allocated.len(), 1);
    }

    fn allocated_id(sequence: u64) -> ContainerId {
        ContainerId::new(attempt(), sequence)
    }

    #[test]
    fn test_unstarted_allocation_expires() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster_with_expiry(dir.path(), 1, Duration::ZERO);
        for _ in 0..2 {
            cluster.resource_manager().add_container_request(request());
        }

        let (_, first) = cluster.state.heartbeat();
        assert_eq!(first.len(), 1);
        // Never started: the slot is reclaimed on the next heartbeat.
        let (completed, second) = cluster.state.heartbeat();
        assert!(completed.is_empty());
        assert_eq!(second.len(), 1);
        assert!(!cluster.state.claim_allocation(&first[0].id));
    }

    #[tokio::test]
    async fn test_register_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path(), 1);
        let rm = cluster.resource_manager();
        assert!(matches!(
            rm.register("host", -1, "").await,
            Err(ClientError::NotRunning)
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        rm.start(tx, Arc::new(|| 0.0)).await.unwrap();
        let response = rm.register("host", -1, "").await.unwrap();
        assert_eq!(response.max_capability, Resource::new(1024, 4));
        assert!(response.containers_from_previous_attempts.is_empty());
        rm.stop().await;
        rm.stop().await;
    }

    #[tokio::test]
    async fn test_zero_heartbeat_interval_still_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new(
            LocalClusterConfig {
                heartbeat_interval: Duration::ZERO,
                ..cluster_config(dir.path(), 1)
            },
            attempt(),
        );
        let rm = cluster.resource_manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        rm.start(tx, Arc::new(|| 0.0)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(RmEvent::NodesUpdated(_))));

        rm.add_container_request(request());
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no heartbeat");
        assert!(matches!(event, Some(RmEvent::ContainersAllocated(c)) if c.len() == 1));
        rm.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_runs_and_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path(), 1);
        let nm = cluster.node_agent();
        let (tx, mut rx) = mpsc::unbounded_channel();
        nm.start(tx).await.unwrap();

        cluster.resource_manager().add_container_request(request());
        let (_, allocated) = cluster.state.heartbeat();
        let container = allocated[0].clone();

        nm.start_container(
            &container,
            context("echo $GREETING 1><LOG_DIR>/stdout; exit 3"),
        )
        .await;

        match rx.recv().await.unwrap() {
            NmEvent::Started { container_id, .. } => assert_eq!(container_id, container.id),
            other => panic!("unexpected event {:?}", other),
        }

        let completed = loop {
            let (completed, _) = cluster.state.heartbeat();
            if !completed.is_empty() {
                break completed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(completed[0].container_id, container.id);
        assert_eq!(completed[0].exit_status, 3);

        let stdout = dir
            .path()
            .join(container.id.to_string())
            .join("logs")
            .join("stdout");
        assert_eq!(std::fs::read_to_string(stdout).unwrap().trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_running_containers() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path(), 1);
        let nm = cluster.node_agent();
        let (tx, mut rx) = mpsc::unbounded_channel();
        nm.start(tx).await.unwrap();

        cluster.resource_manager().add_container_request(request());
        let (_, allocated) = cluster.state.heartbeat();
        nm.start_container(&allocated[0], context("sleep 30")).await;
        assert!(matches!(rx.recv().await, Some(NmEvent::Started { .. })));

        nm.stop().await;
        assert!(matches!(rx.recv().await, Some(NmEvent::Stopped { .. })));

        // Killed containers are not reported as completions.
        let (completed, _) = cluster.state.heartbeat();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn test_remote_resource_is_a_start_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path(), 1);
        let nm = cluster.node_agent();
        let (tx, mut rx) = mpsc::unbounded_channel();
        nm.start(tx).await.unwrap();

        cluster.resource_manager().add_container_request(request());
        let (_, allocated) = cluster.state.heartbeat();

        let mut ctx = context("true");
        let remote = crate::manifest::DistributedFile {
            path: "hdfs://nn:8020/apps/app.jar".to_string(),
            size: 1,
            timestamp: 1,
            kind: crate::manifest::LocalResourceType::File,
        };
        ctx.local_resources
            .insert(remote.manifest_key(), remote.to_local_resource().unwrap());
        nm.start_container(&allocated[0], ctx).await;

        assert!(matches!(
            rx.recv().await,
            Some(NmEvent::StartError {
                error: ClientError::StartFailed(_),
                ..
            })
        ));
        // The slot is free again and no completion is reported.
        cluster.resource_manager().add_container_request(request());
        let (completed, allocated) = cluster.state.heartbeat();
        assert!(completed.is_empty());
        assert_eq!(allocated.len(), 1);
    }
}
