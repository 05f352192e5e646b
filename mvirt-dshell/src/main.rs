//! mvirt-dshell: distributed shell application master.
//!
//! Runs the job against an in-process local cluster:
//! - Parses the job configuration from arguments and environment
//! - Negotiates containers and launches the shell command in each
//! - Exits 0 on success, 2 when the job failed and 1 on errors

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_dshell::clients::{LocalCluster, LocalClusterConfig};
use mvirt_dshell::config::{dump_debug_info, JobArgs, MasterConfig};
use mvirt_dshell::credentials::Credentials;
use mvirt_dshell::records::{NodeId, Resource};
use mvirt_dshell::timeline::{JsonLinesPublisher, NoopPublisher, Timeline, TimelinePublisher};
use mvirt_dshell::Controller;

/// mvirt Distributed Shell application master
#[derive(Parser, Debug)]
#[command(name = "mvirt-dshell", version, about)]
struct Args {
    #[command(flatten)]
    job: JobArgs,

    /// Append timeline entities as JSON lines to this file
    #[arg(long)]
    timeline_file: Option<PathBuf>,

    /// Dump environment and working directory at startup
    #[arg(long)]
    debug: bool,

    /// Largest container memory in MB the local cluster grants
    #[arg(long, default_value = "8192")]
    cluster_max_memory: u64,

    /// Largest container vcores the local cluster grants
    #[arg(long, default_value = "8")]
    cluster_max_vcores: u32,

    /// Containers the local cluster runs at the same time
    #[arg(long, default_value = "4")]
    cluster_slots: u32,

    /// Resource manager heartbeat interval in milliseconds
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_interval_ms: u64,

    /// Seconds an allocated container may wait to be started
    #[arg(long, default_value = "600")]
    allocation_expiry_secs: u64,

    /// Root directory for container work and log directories
    #[arg(long, default_value = "dshell-work")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_dshell=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(true) => {
            info!("Application master completed successfully, exiting");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            info!("Application master failed, exiting");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("Error running application master: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;

    if args.debug {
        dump_debug_info(&env, &cwd).await;
    }

    let config = MasterConfig::load(&args.job, &env, &cwd).await?;
    let credentials = Credentials::from_env(&env).await?;

    let publisher: Arc<dyn TimelinePublisher> = match &args.timeline_file {
        Some(path) => {
            info!(path = %path.display(), "Publishing timeline entities");
            Arc::new(JsonLinesPublisher::new(path))
        }
        None => Arc::new(NoopPublisher),
    };
    let timeline = Timeline::new(publisher, config.user.clone());

    let work_dir = cwd.join(&args.work_dir);
    tokio::fs::create_dir_all(&work_dir)
        .await
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    let cluster = LocalCluster::new(
        LocalClusterConfig {
            max_capability: Resource::new(args.cluster_max_memory, args.cluster_max_vcores),
            slots: args.cluster_slots,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            allocation_expiry: Duration::from_secs(args.allocation_expiry_secs),
            work_dir,
            node: NodeId {
                host: config.node_agent.host.clone(),
                port: config.node_agent.port,
            },
            node_http_port: config.node_agent.http_port,
        },
        config.attempt_id,
    );

    let outcome = Controller::new(config, cluster.resource_manager(), cluster.node_agent())
        .with_credentials(credentials)
        .with_timeline(timeline)
        .run_until(shutdown_signal())
        .await?;

    if let Some(message) = &outcome.message {
        info!(message = %message, "Final diagnostics");
    }
    Ok(outcome.succeeded())
}

#[cfg(unix)]
async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            if ctrl_c.await.is_ok() {
                info!("Received SIGINT");
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received SIGINT");
    }
}
