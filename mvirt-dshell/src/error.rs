//! Error types for the distributed shell master.

use thiserror::Error;

/// Problems with the job configuration. Always fatal before negotiation starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("{0} not set in the environment")]
    MissingEnv(String),

    /// An environment variable or argument has an unusable value.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// Neither the attempt id nor a container id could be determined.
    #[error("application attempt id not set in the environment")]
    MissingAttemptId,

    /// The attempt or container id does not follow the cluster id format.
    #[error("malformed id: {0}")]
    MalformedId(String),

    /// Nothing to execute.
    #[error("no shell command or shell script specified to be executed")]
    NoCommand,

    /// The job asks for zero containers.
    #[error("cannot run distributed shell with no containers")]
    NoContainers,

    /// Script metadata is incomplete.
    #[error("illegal values in env for shell script path: path={path}, len={len}, timestamp={timestamp}")]
    IllegalScript {
        path: String,
        len: i64,
        timestamp: i64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while building a container's launch context.
///
/// Terminal for that one container, never retried.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A remote path is not a well-formed location.
    #[error("malformed resource location {path:?}: {reason}")]
    MalformedLocation { path: String, reason: String },

    /// Renaming the launch script to its OS-specific name failed.
    #[error("failed to finalize launch script {path}: {source}")]
    ScriptFinalize {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by the resource manager or node agent clients.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The client was used before `start` or after `stop`.
    #[error("client not running")]
    NotRunning,

    /// Registration was rejected.
    #[error("registration failed: {0}")]
    Registration(String),

    /// The remote side rejected the call.
    #[error("remote error: {0}")]
    Remote(String),

    /// A container could not be started.
    #[error("container start failed: {0}")]
    StartFailed(String),
}

/// Errors from a timeline publisher. Logged and discarded by callers.
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("timeline io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeline encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that abort the master before a verdict can be computed.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("credentials error: {0}")]
    Credentials(String),
}

/// Result type for master operations.
pub type Result<T> = std::result::Result<T, MasterError>;
