//! Handles resource manager events: launches allocated containers, classifies
//! completions and asks for replacements of lost containers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clients::RmEvent;
use crate::context::JobContext;
use crate::error::ClientError;
use crate::launcher::ContainerLauncher;
use crate::records::{Container, ContainerPhase, ContainerRequest, ContainerStatus, NodeReport};

pub struct ResourceNegotiator {
    ctx: Arc<JobContext>,
    request: ContainerRequest,
}

impl ResourceNegotiator {
    /// `request` is the template for every replacement request.
    pub fn new(ctx: Arc<JobContext>, request: ContainerRequest) -> Self {
        Self { ctx, request }
    }

    /// Consume events until the client drops its sender.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<RmEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("Resource manager event stream closed");
    }

    pub async fn handle(&self, event: RmEvent) {
        match event {
            RmEvent::ContainersAllocated(containers) => self.on_containers_allocated(containers),
            RmEvent::ContainersCompleted(statuses) => self.on_containers_completed(statuses),
            RmEvent::NodesUpdated(nodes) => self.on_nodes_updated(&nodes),
            RmEvent::ShutdownRequest => self.on_shutdown_request(),
            RmEvent::Error(e) => self.on_error(e).await,
        }
    }

    pub fn on_containers_allocated(&self, containers: Vec<Container>) {
        info!(
            count = containers.len(),
            "Got response from RM for container ask"
        );
        // Count the whole batch before any launcher can run.
        self.ctx.counters.add_allocated(containers.len() as u32);

        for container in containers {
            info!(
                container_id = %container.id,
                node = %container.node_id,
                node_http_address = %container.node_http_address,
                resource = %container.resource,
                "Launching shell command on a new container"
            );
            let launcher = ContainerLauncher::new(container, Arc::clone(&self.ctx));
            self.ctx.launch_tasks.push(tokio::spawn(launcher.run()));
        }
    }

    pub fn on_containers_completed(&self, statuses: Vec<ContainerStatus>) {
        let counters = &self.ctx.counters;
        info!(
            count = statuses.len(),
            "Got response from RM for container completions"
        );

        for status in &statuses {
            info!(
                container_id = %status.container_id,
                state = status.state.as_str(),
                exit_status = status.exit_status,
                diagnostics = %status.diagnostics,
                "Got container status"
            );

            // Queue the record before the counters can wake the controller.
            self.ctx.timeline.container_ended(status);

            let phase = ContainerPhase::from_exit_status(status.exit_status);
            match phase {
                ContainerPhase::CompletedSuccess => {
                    counters.record_success();
                    info!(container_id = %status.container_id, "Container completed successfully");
                }
                ContainerPhase::Lost => {
                    // Killed by the framework; ask for the slot again below.
                    counters.record_lost();
                    info!(container_id = %status.container_id, "Container was lost, requesting a replacement");
                }
                _ => {
                    counters.record_failed_container();
                    warn!(
                        container_id = %status.container_id,
                        exit_status = status.exit_status,
                        "Container failed"
                    );
                }
            }
            self.ctx.registry.set_phase(&status.container_id, phase);
        }

        let ask = counters.total() as i64 - counters.requested() as i64;
        if ask > 0 {
            for _ in 0..ask {
                self.ctx.resource_manager.add_container_request(self.request);
            }
            counters.add_requested(ask as u32);
            info!(count = ask, request = %self.request, "Requested replacement containers");
        }

        if counters.all_completed() {
            counters.mark_done();
        }
    }

    pub fn on_nodes_updated(&self, nodes: &[NodeReport]) {
        debug!(count = nodes.len(), "Nodes updated");
    }

    pub fn on_shutdown_request(&self) {
        info!("Resource manager requested shutdown");
        self.ctx.counters.mark_done();
    }

    pub async fn on_error(&self, e: ClientError) {
        error!(error = %e, "Resource manager client error, stopping negotiation");
        self.ctx.counters.mark_done();
        self.ctx.resource_manager.stop().await;
    }
}
