//! Job configuration assembled from command-line arguments, the process
//! environment and the files the client placed in the working directory.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::credentials::TokenBlob;
use crate::error::ConfigError;
use crate::launcher::{LaunchSpec, ShellScript, TargetOs};
use crate::manifest::{DistributedFile, LocalResourceType};
use crate::records::{ApplicationAttemptId, ContainerId, Priority, Resource};

pub const CONTAINER_ID_ENV: &str = "CONTAINER_ID";
pub const APP_SUBMIT_TIME_ENV: &str = "APP_SUBMIT_TIME_ENV";
pub const NM_HOST_ENV: &str = "NM_HOST";
pub const NM_PORT_ENV: &str = "NM_PORT";
pub const NM_HTTP_PORT_ENV: &str = "NM_HTTP_PORT";

pub const SCRIPT_LOCATION_ENV: &str = "DISTRIBUTEDSHELLSCRIPTLOCATION";
pub const SCRIPT_TIMESTAMP_ENV: &str = "DISTRIBUTEDSHELLSCRIPTTIMESTAMP";
pub const SCRIPT_LEN_ENV: &str = "DISTRIBUTEDSHELLSCRIPTLEN";

const JAR_PREFIX: &str = "DISTRIBUTEDJAR";
const ARCHIVE_PREFIX: &str = "DISTRIBUTEDARCHIVE";

/// File in the working directory holding the shell command.
pub const SHELL_COMMAND_FILE: &str = "shellCommands";
/// File in the working directory holding the shell arguments.
pub const SHELL_ARGS_FILE: &str = "shellArgs";

/// Job arguments of the master.
#[derive(clap::Args, Debug, Clone)]
pub struct JobArgs {
    /// Application attempt id, used only when CONTAINER_ID is not set
    #[arg(long)]
    pub app_attempt_id: Option<String>,

    /// Environment for the shell command (KEY=VALUE, repeatable)
    #[arg(long = "shell-env")]
    pub shell_env: Vec<String>,

    /// Memory in MB to request for each container
    #[arg(long, default_value = "10")]
    pub container_memory: u64,

    /// Virtual cores to request for each container
    #[arg(long, default_value = "1")]
    pub container_vcores: u32,

    /// Number of containers to run the shell command on
    #[arg(long, default_value = "1")]
    pub num_containers: u32,

    /// Priority of the container requests
    #[arg(long, default_value = "0")]
    pub priority: i32,

    /// Shell command, overrides the shellCommands file
    #[arg(long)]
    pub shell_command: Option<String>,

    /// Shell arguments, overrides the shellArgs file
    #[arg(long)]
    pub shell_args: Option<String>,
}

impl Default for JobArgs {
    fn default() -> Self {
        Self {
            app_attempt_id: None,
            shell_env: Vec::new(),
            container_memory: 10,
            container_vcores: 1,
            num_containers: 1,
            priority: 0,
            shell_command: None,
            shell_args: None,
        }
    }
}

/// Node agent hosting the master itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAgentAddress {
    pub host: String,
    pub port: u16,
    pub http_port: u16,
}

/// Fully validated job configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub attempt_id: ApplicationAttemptId,
    pub submit_time: i64,
    pub node_agent: NodeAgentAddress,
    pub num_containers: u32,
    pub capability: Resource,
    pub priority: Priority,
    pub shell_command: String,
    pub shell_args: String,
    pub shell_env: HashMap<String, String>,
    pub files: Vec<DistributedFile>,
    pub script: Option<ShellScript>,
    pub target_os: TargetOs,
    /// Host name the master registers with.
    pub host: String,
    /// User the timeline entities are filed under.
    pub user: String,
}

fn require<'a>(env: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    env.get(key)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn attempt_id(
    args: &JobArgs,
    env: &HashMap<String, String>,
) -> Result<ApplicationAttemptId, ConfigError> {
    if let Some(raw) = env.get(CONTAINER_ID_ENV) {
        let id: ContainerId = raw
            .parse()
            .map_err(|_| ConfigError::MalformedId(raw.clone()))?;
        return Ok(id.attempt);
    }
    match &args.app_attempt_id {
        Some(raw) => raw.parse().map_err(|_| ConfigError::MalformedId(raw.clone())),
        None => Err(ConfigError::MissingAttemptId),
    }
}

/// Parse `KEY=VALUE` pairs. A pair without `=` maps the key to an empty value.
pub fn parse_shell_env(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|pair| {
            let pair = pair.trim();
            match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            }
        })
        .collect()
}

/// Collect the distributed files of one kind, ordered by their key suffix.
fn distributed_files(
    env: &HashMap<String, String>,
    prefix: &str,
    kind: LocalResourceType,
) -> Result<Vec<DistributedFile>, ConfigError> {
    let location_prefix = format!("{}LOCATION", prefix);
    let mut suffixes: Vec<&str> = env
        .keys()
        .filter_map(|k| k.strip_prefix(&location_prefix))
        .collect();
    suffixes.sort_by_key(|s| (s.len(), *s));

    suffixes
        .into_iter()
        .map(|suffix| {
            let path = &env[&format!("{}{}", location_prefix, suffix)];
            let ts_key = format!("{}TIMESTAMP{}", prefix, suffix);
            let len_key = format!("{}LEN{}", prefix, suffix);
            Ok(DistributedFile {
                path: path.clone(),
                timestamp: parse_env(&ts_key, require(env, &ts_key)?)?,
                size: parse_env(&len_key, require(env, &len_key)?)?,
                kind,
            })
        })
        .collect()
}

fn shell_script(env: &HashMap<String, String>) -> Result<Option<ShellScript>, ConfigError> {
    let path = match env.get(SCRIPT_LOCATION_ENV) {
        Some(p) if !p.is_empty() => p.clone(),
        _ => return Ok(None),
    };
    let timestamp = match env.get(SCRIPT_TIMESTAMP_ENV) {
        Some(v) => parse_env(SCRIPT_TIMESTAMP_ENV, v)?,
        None => 0,
    };
    let len = match env.get(SCRIPT_LEN_ENV) {
        Some(v) => parse_env(SCRIPT_LEN_ENV, v)?,
        None => 0,
    };
    if timestamp <= 0 || len <= 0 {
        return Err(ConfigError::IllegalScript {
            path,
            len,
            timestamp,
        });
    }
    Ok(Some(ShellScript {
        path,
        size: len,
        timestamp,
    }))
}

async fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl MasterConfig {
    /// Validate arguments and environment. `work_dir` holds the
    /// `shellCommands` and `shellArgs` files, if the client shipped any.
    pub async fn load(
        args: &JobArgs,
        env: &HashMap<String, String>,
        work_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let attempt_id = attempt_id(args, env)?;

        let submit_time = parse_env(APP_SUBMIT_TIME_ENV, require(env, APP_SUBMIT_TIME_ENV)?)?;
        let node_agent = NodeAgentAddress {
            host: require(env, NM_HOST_ENV)?.to_string(),
            http_port: parse_env(NM_HTTP_PORT_ENV, require(env, NM_HTTP_PORT_ENV)?)?,
            port: parse_env(NM_PORT_ENV, require(env, NM_PORT_ENV)?)?,
        };

        info!(
            app_id = attempt_id.app_id,
            cluster_timestamp = attempt_id.cluster_timestamp,
            attempt = attempt_id.attempt,
            "Application master for app"
        );

        let shell_command = match &args.shell_command {
            Some(cmd) => Some(cmd.trim().to_string()),
            None => read_optional(&work_dir.join(SHELL_COMMAND_FILE)).await?,
        };
        let script = shell_script(env)?;
        if shell_command.is_none() && script.is_none() {
            return Err(ConfigError::NoCommand);
        }

        let shell_args = match &args.shell_args {
            Some(a) => a.trim().to_string(),
            None => read_optional(&work_dir.join(SHELL_ARGS_FILE))
                .await?
                .unwrap_or_default(),
        };

        let mut files = distributed_files(env, JAR_PREFIX, LocalResourceType::File)?;
        files.extend(distributed_files(env, ARCHIVE_PREFIX, LocalResourceType::Archive)?);

        if args.num_containers == 0 {
            return Err(ConfigError::NoContainers);
        }

        Ok(MasterConfig {
            attempt_id,
            submit_time,
            node_agent,
            num_containers: args.num_containers,
            capability: Resource::new(args.container_memory, args.container_vcores),
            priority: Priority(args.priority),
            shell_command: shell_command.unwrap_or_default(),
            shell_args,
            shell_env: parse_shell_env(&args.shell_env),
            files,
            script,
            target_os: TargetOs::current(),
            host: local_hostname(),
            user: env.get("USER").cloned().unwrap_or_default(),
        })
    }

    /// The launch description shared by every container of this job.
    pub fn launch_spec(&self, tokens: TokenBlob) -> LaunchSpec {
        LaunchSpec {
            shell_command: self.shell_command.clone(),
            shell_args: self.shell_args.clone(),
            shell_env: self.shell_env.clone(),
            files: self.files.clone(),
            script: self.script.clone(),
            target_os: self.target_os,
            tokens,
        }
    }
}

/// Log the environment and the working directory listing.
pub async fn dump_debug_info(env: &HashMap<String, String>, work_dir: &Path) {
    info!("Dump debug output");
    let mut keys: Vec<_> = env.keys().collect();
    keys.sort();
    for key in keys {
        info!(key = %key, value = %env[key], "System env");
    }

    match tokio::fs::read_dir(work_dir).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                info!(path = %entry.path().display(), "Working directory entry");
            }
        }
        Err(e) => info!(dir = %work_dir.display(), error = %e, "Cannot list working directory"),
    }
}
