//! Per-container launch: builds the launch context and hands it to the node
//! agent.
//!
//! One [`ContainerLauncher`] runs per allocated container, concurrently with
//! all other launchers. Any failure while building the context is terminal for
//! that container alone and is never retried.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::context::JobContext;
use crate::credentials::TokenBlob;
use crate::error::LaunchError;
use crate::manifest::{
    DistributedFile, LocalResource, LocalResourceType, LocalResourceVisibility, ResourceLocation,
};
use crate::records::Container;

/// Placeholder the node agent replaces with the container's log directory.
pub const LOG_DIR_EXPANSION_VAR: &str = "<LOG_DIR>";

/// Base name of the launch script inside the container.
pub const SCRIPT_BASENAME: &str = "ExecScript";

/// Operating system family of the cluster nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Unix,
    Windows,
}

impl TargetOs {
    /// The family this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            TargetOs::Windows
        } else {
            TargetOs::Unix
        }
    }

    pub fn script_suffix(&self) -> &'static str {
        match self {
            TargetOs::Unix => ".sh",
            TargetOs::Windows => ".bat",
        }
    }

    /// Manifest key of the launch script.
    pub fn script_key(&self) -> &'static str {
        match self {
            TargetOs::Unix => "ExecScript.sh",
            TargetOs::Windows => "ExecScript.bat",
        }
    }

    /// Executable that runs the launch script.
    pub fn shell_prefix(&self) -> &'static str {
        match self {
            TargetOs::Unix => "bash",
            TargetOs::Windows => "cmd /c",
        }
    }
}

/// Launch script distributed alongside the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellScript {
    pub path: String,
    pub size: i64,
    pub timestamp: i64,
}

/// Everything a node agent needs to start one container.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub environment: HashMap<String, String>,
    pub local_resources: BTreeMap<String, LocalResource>,
    pub commands: Vec<String>,
    pub tokens: TokenBlob,
}

/// Gives the launch script its OS-specific name before it is localized.
#[async_trait]
pub trait ScriptStager: Send + Sync {
    async fn finalize(&self, from: &str, to: &str) -> io::Result<()>;
}

/// Renames scripts on the local filesystem.
///
/// Every launcher finalizes the same script, so a rename that finds the
/// target already in place counts as done.
pub struct LocalScriptStager;

fn local_path(location: &str) -> io::Result<String> {
    let parsed = ResourceLocation::parse(location)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    if !parsed.is_local() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot rename non-local script {}", location),
        ));
    }
    Ok(parsed.file)
}

#[async_trait]
impl ScriptStager for LocalScriptStager {
    async fn finalize(&self, from: &str, to: &str) -> io::Result<()> {
        let from = local_path(from)?;
        let to = local_path(to)?;
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                info!(from = %from, to = %to, "Added suffix to launch script");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && Path::new(&to).exists() => {
                debug!(to = %to, "Launch script already finalized");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Job-wide description of what every container runs.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub shell_command: String,
    pub shell_args: String,
    pub shell_env: HashMap<String, String>,
    pub files: Vec<DistributedFile>,
    pub script: Option<ShellScript>,
    pub target_os: TargetOs,
    pub tokens: TokenBlob,
}

impl LaunchSpec {
    /// Assemble the single command line run in the container.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(5);
        if self.script.is_some() {
            parts.push(self.target_os.shell_prefix().to_string());
            parts.push(self.target_os.script_key().to_string());
        } else {
            parts.push(self.shell_command.clone());
        }
        if !self.shell_args.is_empty() {
            parts.push(self.shell_args.clone());
        }
        parts.push(format!("1>{}/stdout", LOG_DIR_EXPANSION_VAR));
        parts.push(format!("2>{}/stderr", LOG_DIR_EXPANSION_VAR));
        parts.join(" ")
    }

    /// Build the launch context for one container.
    pub async fn build_context(
        &self,
        stager: &dyn ScriptStager,
    ) -> Result<LaunchContext, LaunchError> {
        let mut local_resources = BTreeMap::new();

        if let Some(script) = &self.script {
            let renamed = format!("{}{}", script.path, self.target_os.script_suffix());
            stager
                .finalize(&script.path, &renamed)
                .await
                .map_err(|source| LaunchError::ScriptFinalize {
                    path: renamed.clone(),
                    source,
                })?;

            local_resources.insert(
                self.target_os.script_key().to_string(),
                LocalResource {
                    location: ResourceLocation::parse(&renamed)?,
                    size: script.size,
                    timestamp: script.timestamp,
                    kind: LocalResourceType::File,
                    visibility: LocalResourceVisibility::Application,
                },
            );
        }

        for file in &self.files {
            local_resources.insert(file.manifest_key(), file.to_local_resource()?);
        }

        Ok(LaunchContext {
            environment: self.shell_env.clone(),
            local_resources,
            commands: vec![self.command_line()],
            tokens: self.tokens.clone(),
        })
    }
}

/// Launches the job's command in one allocated container.
pub struct ContainerLauncher {
    container: Container,
    ctx: Arc<JobContext>,
}

impl ContainerLauncher {
    pub fn new(container: Container, ctx: Arc<JobContext>) -> Self {
        Self { container, ctx }
    }

    pub async fn run(self) {
        let id = self.container.id;
        info!(container_id = %id, "Setting up container launch context");

        let launch_context = match self
            .ctx
            .launch
            .build_context(self.ctx.stager.as_ref())
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(container_id = %id, error = %e, "Cannot launch container");
                self.ctx.counters.record_failed_container();
                return;
            }
        };

        if !self.ctx.registry.insert(self.container.clone()) {
            debug!(container_id = %id, "Container already registered");
        }
        self.ctx
            .node_agent
            .start_container(&self.container, launch_context)
            .await;
    }
}
