//! Handles node agent events.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clients::NmEvent;
use crate::context::JobContext;
use crate::error::ClientError;
use crate::records::{ContainerId, ContainerStatus};

pub struct NodeAgentListener {
    ctx: Arc<JobContext>,
}

impl NodeAgentListener {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Consume events until the client drops its sender.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<NmEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("Node agent event stream closed");
    }

    pub async fn handle(&self, event: NmEvent) {
        match event {
            NmEvent::Started {
                container_id,
                service_data,
            } => self.on_container_started(&container_id, &service_data).await,
            NmEvent::StatusReceived {
                container_id,
                status,
            } => self.on_container_status_received(&container_id, &status),
            NmEvent::StatusError {
                container_id,
                error,
            } => self.on_get_container_status_error(&container_id, &error),
            NmEvent::Stopped { container_id } => self.on_container_stopped(&container_id),
            NmEvent::StartError {
                container_id,
                error,
            } => self.on_start_container_error(&container_id, &error),
            NmEvent::StopError {
                container_id,
                error,
            } => self.on_stop_container_error(&container_id, &error),
        }
    }

    pub async fn on_container_started(
        &self,
        container_id: &ContainerId,
        service_data: &HashMap<String, Vec<u8>>,
    ) {
        debug!(
            container_id = %container_id,
            services = service_data.len(),
            "Succeeded to start container"
        );
        let Some(container) = self.ctx.registry.get(container_id) else {
            debug!(container_id = %container_id, "Started container is not registered");
            return;
        };

        if !self.ctx.registry.mark_running(container_id) {
            debug!(
                container_id = %container_id,
                phase = ?self.ctx.registry.phase(container_id),
                "Container already finished before its start was reported"
            );
        }
        self.ctx
            .node_agent
            .get_container_status(&container.id, &container.node_id)
            .await;
        self.ctx.timeline.container_started(&container);
    }

    pub fn on_container_status_received(&self, container_id: &ContainerId, status: &ContainerStatus) {
        debug!(
            container_id = %container_id,
            state = status.state.as_str(),
            exit_status = status.exit_status,
            "Container status"
        );
    }

    pub fn on_get_container_status_error(&self, container_id: &ContainerId, e: &ClientError) {
        warn!(container_id = %container_id, error = %e, "Failed to query the status of container");
    }

    pub fn on_container_stopped(&self, container_id: &ContainerId) {
        debug!(container_id = %container_id, "Succeeded to stop container");
        self.ctx.registry.remove(container_id);
    }

    pub fn on_start_container_error(&self, container_id: &ContainerId, e: &ClientError) {
        error!(container_id = %container_id, error = %e, "Failed to start container");
        self.ctx.registry.remove(container_id);
        self.ctx.counters.record_failed_container();
    }

    pub fn on_stop_container_error(&self, container_id: &ContainerId, e: &ClientError) {
        info!(container_id = %container_id, error = %e, "Failed to stop container");
        self.ctx.registry.remove(container_id);
    }
}
