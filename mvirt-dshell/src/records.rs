//! Cluster records exchanged with the resource manager and node agents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Identity of one run of the job's master process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationAttemptId {
    pub cluster_timestamp: u64,
    pub app_id: u32,
    pub attempt: u32,
}

impl fmt::Display for ApplicationAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "appattempt_{}_{:04}_{:06}",
            self.cluster_timestamp, self.app_id, self.attempt
        )
    }
}

fn parse_num<T: FromStr>(id: &str, part: Option<&str>) -> Result<T, ConfigError> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| ConfigError::MalformedId(id.to_string()))
}

impl FromStr for ApplicationAttemptId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        if parts.next() != Some("appattempt") {
            return Err(ConfigError::MalformedId(s.to_string()));
        }
        let id = Self {
            cluster_timestamp: parse_num(s, parts.next())?,
            app_id: parse_num(s, parts.next())?,
            attempt: parse_num(s, parts.next())?,
        };
        if parts.next().is_some() {
            return Err(ConfigError::MalformedId(s.to_string()));
        }
        Ok(id)
    }
}

/// Container identity, unique across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    pub attempt: ApplicationAttemptId,
    /// Resource manager restart epoch, omitted from the text form when zero.
    pub epoch: u32,
    pub sequence: u64,
}

impl ContainerId {
    pub fn new(attempt: ApplicationAttemptId, sequence: u64) -> Self {
        Self {
            attempt,
            epoch: 0,
            sequence,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container_")?;
        if self.epoch > 0 {
            write!(f, "e{:02}_", self.epoch)?;
        }
        write!(
            f,
            "{}_{:04}_{:02}_{:06}",
            self.attempt.cluster_timestamp, self.attempt.app_id, self.attempt.attempt, self.sequence
        )
    }
}

impl FromStr for ContainerId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_').peekable();
        if parts.next() != Some("container") {
            return Err(ConfigError::MalformedId(s.to_string()));
        }
        let epoch = match parts.peek().copied() {
            Some(p) if p.starts_with('e') => {
                parts.next();
                parse_num(s, Some(&p[1..]))?
            }
            _ => 0,
        };
        let attempt = ApplicationAttemptId {
            cluster_timestamp: parse_num(s, parts.next())?,
            app_id: parse_num(s, parts.next())?,
            attempt: parse_num(s, parts.next())?,
        };
        let sequence = parse_num(s, parts.next())?;
        if parts.next().is_some() {
            return Err(ConfigError::MalformedId(s.to_string()));
        }
        Ok(Self {
            attempt,
            epoch,
            sequence,
        })
    }
}

/// Address of a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Memory and CPU capability of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }

    /// Limit each dimension to the cluster maximum.
    pub fn clamp_to(self, max: Resource) -> Resource {
        Resource {
            memory_mb: self.memory_mb.min(max.memory_mb),
            vcores: self.vcores.min(max.vcores),
        }
    }

    pub fn fits_within(&self, other: &Resource) -> bool {
        self.memory_mb <= other.memory_mb && self.vcores <= other.vcores
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<memory:{}, vCores:{}>", self.memory_mb, self.vcores)
    }
}

/// Request priority. Lower values are served first by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Priority(pub i32);

/// Ask for one container of a fixed capability on any host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerRequest {
    pub capability: Resource,
    pub priority: Priority,
}

impl fmt::Display for ContainerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Capability[{}]Priority[{}]",
            self.capability, self.priority.0
        )
    }
}

/// A container granted by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: ContainerId,
    pub node_id: NodeId,
    pub node_http_address: String,
    pub resource: Resource,
    pub priority: Priority,
}

/// Lifecycle phase of a container as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerPhase {
    Launching,
    Running,
    CompletedSuccess,
    CompletedFailed,
    /// Killed or preempted by the framework; the slot is requested again.
    Lost,
}

impl ContainerPhase {
    /// Classify a completed container by its exit status.
    pub fn from_exit_status(code: i32) -> Self {
        match code {
            exit_status::SUCCESS => ContainerPhase::CompletedSuccess,
            exit_status::ABORTED | exit_status::PREEMPTED => ContainerPhase::Lost,
            _ => ContainerPhase::CompletedFailed,
        }
    }

    /// The container will not run again; a lost one is replaced by a new id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerPhase::CompletedSuccess
                | ContainerPhase::CompletedFailed
                | ContainerPhase::Lost
        )
    }
}

/// Well-known container exit statuses set by the framework.
pub mod exit_status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID: i32 = -1000;
    /// Released or killed by the framework, not by the work itself.
    pub const ABORTED: i32 = -100;
    pub const DISKS_FAILED: i32 = -101;
    /// Preempted to make room for another application.
    pub const PREEMPTED: i32 = -102;
}

/// State reported by the node agent or resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    New,
    Running,
    Complete,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::New => "NEW",
            ContainerState::Running => "RUNNING",
            ContainerState::Complete => "COMPLETE",
        }
    }
}

/// Status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_status: i32,
    pub diagnostics: String,
}

impl ContainerStatus {
    pub fn completed(container_id: ContainerId, exit_status: i32) -> Self {
        Self {
            container_id,
            state: ContainerState::Complete,
            exit_status,
            diagnostics: String::new(),
        }
    }
}

/// Health report about a cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub http_address: String,
    pub num_containers: u32,
    pub healthy: bool,
}

/// Final status reported when unregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalApplicationStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for FinalApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalApplicationStatus::Succeeded => write!(f, "SUCCEEDED"),
            FinalApplicationStatus::Failed => write!(f, "FAILED"),
        }
    }
}
