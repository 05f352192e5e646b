//! Clients for the cluster services the master talks to.
//!
//! - Resource manager: registration, container requests, completion reports
//! - Node agents: starting containers and querying their status
//!
//! Both clients report back through an event channel consumed by exactly one
//! handler task ([`crate::negotiator::ResourceNegotiator`] and
//! [`crate::listener::NodeAgentListener`]).

pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::launcher::LaunchContext;
use crate::records::{
    Container, ContainerId, ContainerRequest, ContainerStatus, FinalApplicationStatus, NodeId,
    NodeReport, Resource,
};

pub use local::{LocalCluster, LocalClusterConfig};

/// Progress callback the resource manager client polls on its heartbeat.
pub type ProgressFn = Arc<dyn Fn() -> f32 + Send + Sync>;

/// Events delivered by the resource manager client.
#[derive(Debug, Clone)]
pub enum RmEvent {
    ContainersAllocated(Vec<Container>),
    ContainersCompleted(Vec<ContainerStatus>),
    NodesUpdated(Vec<NodeReport>),
    ShutdownRequest,
    Error(ClientError),
}

/// Events delivered by the node agent client.
#[derive(Debug, Clone)]
pub enum NmEvent {
    Started {
        container_id: ContainerId,
        service_data: HashMap<String, Vec<u8>>,
    },
    StatusReceived {
        container_id: ContainerId,
        status: ContainerStatus,
    },
    StatusError {
        container_id: ContainerId,
        error: ClientError,
    },
    Stopped {
        container_id: ContainerId,
    },
    StartError {
        container_id: ContainerId,
        error: ClientError,
    },
    StopError {
        container_id: ContainerId,
        error: ClientError,
    },
}

/// Returned by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    /// Largest container the cluster will grant.
    pub max_capability: Resource,
    /// Containers still running from a previous attempt of this application.
    pub containers_from_previous_attempts: Vec<Container>,
}

/// Asynchronous client of the cluster resource manager.
#[async_trait]
pub trait ResourceManagerClient: Send + Sync {
    /// Begin heartbeating. Events go to `events`; `progress` is polled on
    /// every heartbeat.
    async fn start(
        &self,
        events: mpsc::UnboundedSender<RmEvent>,
        progress: ProgressFn,
    ) -> Result<(), ClientError>;

    /// Register the master.
    async fn register(
        &self,
        host: &str,
        rpc_port: i32,
        tracking_url: &str,
    ) -> Result<RegisterResponse, ClientError>;

    /// Queue one container request for the next heartbeat.
    fn add_container_request(&self, request: ContainerRequest);

    /// Report the final status.
    async fn unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<&str>,
    ) -> Result<(), ClientError>;

    /// Stop heartbeating. Idempotent.
    async fn stop(&self);
}

/// Asynchronous client of the node agents.
#[async_trait]
pub trait NodeAgentClient: Send + Sync {
    async fn start(&self, events: mpsc::UnboundedSender<NmEvent>) -> Result<(), ClientError>;

    /// Ask the container's node agent to start it. The outcome arrives as
    /// `Started` or `StartError`.
    async fn start_container(&self, container: &Container, context: LaunchContext);

    /// Ask for a status report. Answered with `StatusReceived` or `StatusError`.
    async fn get_container_status(&self, container_id: &ContainerId, node_id: &NodeId);

    /// Stop all containers this client started and shut it down. Idempotent.
    async fn stop(&self);
}
