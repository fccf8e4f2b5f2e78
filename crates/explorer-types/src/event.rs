//! Queued event types.
//!
//! A `QueuedEvent` is one unit of ingestion work. Producers submit a
//! `NewEvent`; the queue backend assigns a `QueueToken`, a creation time and
//! tracks the attempt count. The materializer fills in `predictable_id` and
//! the `overrides` namespace before the event reaches the search index.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ExplorerError;

/// Sentinel id of the folder forest root. No relational row exists for it.
pub const ROOT_FOLDER_ID: i64 = 0;

/// Resource type carried by folder events.
pub const FOLDER_TYPE: &str = "folder";

/// What an event asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestAction {
    /// Create or update the resource and its index document
    Upsert,
    /// Remove the resource and its index document
    Delete,
    /// Update the audience sub-document only
    Audience,
}

impl IngestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestAction::Upsert => "upsert",
            IngestAction::Delete => "delete",
            IngestAction::Audience => "audience",
        }
    }
}

impl FromStr for IngestAction {
    type Err = ExplorerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(IngestAction::Upsert),
            "delete" => Ok(IngestAction::Delete),
            "audience" => Ok(IngestAction::Audience),
            other => Err(ExplorerError::InvalidInput(format!(
                "unknown action: {}",
                other
            ))),
        }
    }
}

/// Delivery priority. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Derive the priority of an event.
    ///
    /// Search-triggered flows jump the queue; audience updates are the
    /// least urgent since they never change document content.
    pub fn derive(action: IngestAction, for_search: bool) -> Self {
        if for_search {
            return Priority::High;
        }
        match action {
            IngestAction::Upsert | IngestAction::Delete => Priority::Medium,
            IngestAction::Audience => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Numeric rank used by the relational queue (`ORDER BY priority DESC`).
    pub fn rank(&self) -> i64 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            r if r >= 2 => Priority::High,
            1 => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

impl FromStr for Priority {
    type Err = ExplorerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(ExplorerError::InvalidInput(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Backend-specific position of a queued event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueToken {
    /// Entry in a durable stream
    Stream { stream: String, seq: u64 },
    /// Row id in the relational queue table
    Row(i64),
    /// Synthesized inside a cycle; never reported back to a queue
    #[default]
    Derived,
}

impl QueueToken {
    pub fn is_derived(&self) -> bool {
        matches!(self, QueueToken::Derived)
    }
}

/// Composite identity `resourceId:application:resourceType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUniqueId {
    pub resource_id: String,
    pub application: String,
    pub resource_type: String,
}

impl ResourceUniqueId {
    pub fn new(
        resource_id: impl Into<String>,
        application: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            application: application.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl fmt::Display for ResourceUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_id, self.application, self.resource_type
        )
    }
}

impl FromStr for ResourceUniqueId {
    type Err = ExplorerError;

    /// Parse from the right so resource ids may themselves contain ':'.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let resource_type = parts.next().filter(|p| !p.is_empty());
        let application = parts.next().filter(|p| !p.is_empty());
        let resource_id = parts.next().filter(|p| !p.is_empty());
        match (resource_id, application, resource_type) {
            (Some(id), Some(app), Some(ty)) => Ok(Self::new(id, app, ty)),
            _ => Err(ExplorerError::InvalidInput(format!(
                "invalid resource unique id: {}",
                s
            ))),
        }
    }
}

/// Event as submitted by a producer.
///
/// Priority is never supplied directly; it is derived from `action` and
/// `for_search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub resource_id: String,
    pub application: String,
    pub resource_type: String,
    pub action: IngestAction,
    pub version: i64,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub for_search: bool,
}

impl NewEvent {
    pub fn new(
        resource_id: impl Into<String>,
        application: impl Into<String>,
        resource_type: impl Into<String>,
        action: IngestAction,
        version: i64,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            application: application.into(),
            resource_type: resource_type.into(),
            action,
            version,
            payload: Map::new(),
            for_search: false,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn for_search(mut self, for_search: bool) -> Self {
        self.for_search = for_search;
        self
    }

    pub fn priority(&self) -> Priority {
        Priority::derive(self.action, self.for_search)
    }
}

/// One unit of queued ingestion work.
///
/// The queue token is not serialized: it is assigned by the backend on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub resource_id: String,
    pub application: String,
    pub resource_type: String,
    pub action: IngestAction,
    pub priority: Priority,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(skip)]
    pub queue_token: QueueToken,
    #[serde(default)]
    pub attempt_count: u32,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictable_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Fields computed from relational state (`override` namespace)
    #[serde(default, rename = "override", skip_serializing_if = "Map::is_empty")]
    pub overrides: Map<String, Value>,
    /// Set by a reader when the stored event cannot be ingested as read; the
    /// event is reported failed without being processed
    #[serde(skip)]
    pub rejected: Option<String>,
}

impl QueuedEvent {
    /// Build a queued event from a producer event.
    pub fn from_new(event: NewEvent, queue_token: QueueToken, created_at: DateTime<Utc>) -> Self {
        let priority = event.priority();
        Self {
            resource_id: event.resource_id,
            application: event.application,
            resource_type: event.resource_type,
            action: event.action,
            priority,
            payload: event.payload,
            queue_token,
            attempt_count: 0,
            version: event.version,
            predictable_id: None,
            created_at,
            error: None,
            error_detail: None,
            overrides: Map::new(),
            rejected: None,
        }
    }

    pub fn unique_id(&self) -> ResourceUniqueId {
        ResourceUniqueId::new(
            self.resource_id.clone(),
            self.application.clone(),
            self.resource_type.clone(),
        )
    }

    pub fn is_folder(&self) -> bool {
        self.resource_type == FOLDER_TYPE
    }

    /// Mark the event failed with a reason.
    pub fn fail(&mut self, error: impl Into<String>, detail: Option<String>) {
        self.error = Some(error.into());
        self.error_detail = detail;
    }

    pub fn set_override(&mut self, key: impl Into<String>, value: Value) {
        self.overrides.insert(key.into(), value);
    }

    /// String field of the payload, if present and non-null.
    pub fn payload_str(&self, key: &str) -> Option<String> {
        match self.payload.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn payload_bool(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
