//! Best-effort timeline records for the attempt and its containers.
//!
//! Every record is traced locally and then handed to a [`TimelinePublisher`]
//! on a spawned task. Publish errors are logged and dropped; they never affect
//! counters or the verdict.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::TimelineError;
use crate::records::{ApplicationAttemptId, Container, ContainerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    DsAppAttempt,
    DsContainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DsAppAttemptStart,
    DsAppAttemptEnd,
    DsContainerStart,
    DsContainerEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub primary_filters: BTreeMap<String, String>,
    pub events: Vec<TimelineEvent>,
}

/// Destination for timeline entities.
#[async_trait]
pub trait TimelinePublisher: Send + Sync {
    async fn put_entity(&self, entity: &TimelineEntity) -> Result<(), TimelineError>;
}

/// Discards everything.
pub struct NoopPublisher;

#[async_trait]
impl TimelinePublisher for NoopPublisher {
    async fn put_entity(&self, _entity: &TimelineEntity) -> Result<(), TimelineError> {
        Ok(())
    }
}

/// Appends one JSON document per entity to a file.
pub struct JsonLinesPublisher {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl TimelinePublisher for JsonLinesPublisher {
    async fn put_entity(&self, entity: &TimelineEntity) -> Result<(), TimelineError> {
        let mut line = serde_json::to_vec(entity)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Timeline recorder of one application attempt.
pub struct Timeline {
    publisher: Arc<dyn TimelinePublisher>,
    user: String,
    in_flight: Mutex<JoinSet<()>>,
}

impl Timeline {
    pub fn new(publisher: Arc<dyn TimelinePublisher>, user: impl Into<String>) -> Self {
        Self {
            publisher,
            user: user.into(),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn new_noop() -> Self {
        Self::new(Arc::new(NoopPublisher), "")
    }

    fn publish_async(&self, entity: TimelineEntity) {
        debug!(
            target: "timeline",
            entity_id = %entity.entity_id,
            entity_type = ?entity.entity_type,
            events = ?entity.events.iter().map(|e| e.event_type).collect::<Vec<_>>(),
            "Publishing timeline entity"
        );

        let publisher = Arc::clone(&self.publisher);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            if let Err(e) = publisher.put_entity(&entity).await {
                warn!(
                    entity_id = %entity.entity_id,
                    error = %e,
                    "Failed to publish timeline entity"
                );
            }
        });
    }

    /// Wait up to `timeout` for outstanding publishes.
    pub async fn flush(&self, timeout: Duration) {
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *in_flight)
        };
        let drained = tokio::time::timeout(timeout, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = pending.len(), "Timeline flush timed out");
            pending.detach_all();
        }
    }

    fn attempt_entity(&self, attempt: &ApplicationAttemptId, event: EventType) -> TimelineEntity {
        TimelineEntity {
            entity_id: attempt.to_string(),
            entity_type: EntityType::DsAppAttempt,
            start_time: None,
            primary_filters: BTreeMap::from([("user".to_string(), self.user.clone())]),
            events: vec![TimelineEvent {
                event_type: event,
                timestamp: Utc::now(),
                info: BTreeMap::new(),
            }],
        }
    }

    pub fn attempt_started(&self, attempt: &ApplicationAttemptId) {
        self.publish_async(self.attempt_entity(attempt, EventType::DsAppAttemptStart));
    }

    pub fn attempt_ended(&self, attempt: &ApplicationAttemptId) {
        self.publish_async(self.attempt_entity(attempt, EventType::DsAppAttemptEnd));
    }

    pub fn container_started(&self, container: &Container) {
        let now = Utc::now();
        let info = BTreeMap::from([
            (
                "Node".to_string(),
                Value::String(container.node_id.to_string()),
            ),
            (
                "Resources".to_string(),
                Value::String(container.resource.to_string()),
            ),
        ]);
        self.publish_async(TimelineEntity {
            entity_id: container.id.to_string(),
            entity_type: EntityType::DsContainer,
            start_time: Some(now),
            primary_filters: BTreeMap::from([("user".to_string(), self.user.clone())]),
            events: vec![TimelineEvent {
                event_type: EventType::DsContainerStart,
                timestamp: now,
                info,
            }],
        });
    }

    pub fn container_ended(&self, status: &ContainerStatus) {
        let info = BTreeMap::from([
            (
                "State".to_string(),
                Value::String(status.state.as_str().to_string()),
            ),
            ("Exit Status".to_string(), Value::from(status.exit_status)),
        ]);
        self.publish_async(TimelineEntity {
            entity_id: status.container_id.to_string(),
            entity_type: EntityType::DsContainer,
            start_time: None,
            primary_filters: BTreeMap::from([("user".to_string(), self.user.clone())]),
            events: vec![TimelineEvent {
                event_type: EventType::DsContainerEnd,
                timestamp: Utc::now(),
                info,
            }],
        });
    }
}
