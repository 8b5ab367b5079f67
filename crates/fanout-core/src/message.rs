//! Message types for the change-stream fan-out engine
//!
//! Defines the change event delivered to listeners and the two durable
//! records (cluster config and worker checkpoint) kept by a `ConfigStore`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Name of the store's native identity field
pub const NATIVE_ID_FIELD: &str = "_id";

/// Change operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// New document inserted
    Insert,
    /// Existing document partially updated
    Update,
    /// Document deleted
    Delete,
    /// Existing document replaced as a whole
    Replace,
    /// Anything else the feed reports (drop, rename, invalidate, ...)
    Other,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, feed-defined position in the change feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResumeToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ResumeToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Description of the fields touched by an update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    /// Fields set by the update with their new values
    #[serde(default)]
    pub updated_fields: Map<String, Value>,

    /// Fields removed by the update
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    pub fn new(updated_fields: Map<String, Value>, removed_fields: Vec<String>) -> Self {
        Self {
            updated_fields,
            removed_fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }
}

/// A single change observed on the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// The operation type
    pub operation_type: OperationType,

    /// Collection the change happened in
    pub namespace: String,

    /// Identifying key of the changed document (always present)
    pub document_key: Value,

    /// Post-image, when the feed is configured to attach it (None for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,

    /// Pre-image, when the feed is configured to attach it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document_before_change: Option<Value>,

    /// Changed fields (updates only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    /// Feed position right after this event
    pub resume_token: ResumeToken,

    /// Time the change was recorded by the feed
    pub wall_time: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create a new insert event
    pub fn insert(
        namespace: impl Into<String>,
        document_key: Value,
        full_document: Value,
        resume_token: ResumeToken,
    ) -> Self {
        Self {
            operation_type: OperationType::Insert,
            namespace: namespace.into(),
            document_key,
            full_document: Some(full_document),
            full_document_before_change: None,
            update_description: None,
            resume_token,
            wall_time: Utc::now(),
        }
    }

    /// Create a new update event
    pub fn update(
        namespace: impl Into<String>,
        document_key: Value,
        update_description: UpdateDescription,
        resume_token: ResumeToken,
    ) -> Self {
        Self {
            operation_type: OperationType::Update,
            namespace: namespace.into(),
            document_key,
            full_document: None,
            full_document_before_change: None,
            update_description: Some(update_description),
            resume_token,
            wall_time: Utc::now(),
        }
    }

    /// Create a new delete event
    pub fn delete(
        namespace: impl Into<String>,
        document_key: Value,
        resume_token: ResumeToken,
    ) -> Self {
        Self {
            operation_type: OperationType::Delete,
            namespace: namespace.into(),
            document_key,
            full_document: None,
            full_document_before_change: None,
            update_description: None,
            resume_token,
            wall_time: Utc::now(),
        }
    }

    /// Value of `key_name`, looked up in the post-image first, then in the document key
    pub fn key_value(&self, key_name: &str) -> Option<&Value> {
        self.full_document
            .as_ref()
            .and_then(|doc| lookup_path(doc, key_name))
            .or_else(|| lookup_path(&self.document_key, key_name))
    }

    /// Printable native id of the changed document, "?" when unknown
    pub fn document_id(&self) -> String {
        match self.key_value(NATIVE_ID_FIELD) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "?".to_string(),
        }
    }
}

/// Resolve a dotted path (`"a.b.0"`) inside a JSON value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

// ============================================================================
// Durable records
// ============================================================================

/// Feed-wide partitioning record, one per collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: Uuid,
    /// Collection (feed) name, unique across records
    pub collection: String,
    pub partitions: u32,
}

impl ClusterConfig {
    pub fn new(collection: impl Into<String>, partitions: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            collection: collection.into(),
            partitions,
        }
    }
}

/// Per-partition checkpoint, unique by (collection, partition)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCheckpoint {
    pub id: Uuid,
    pub collection: String,
    pub partition: u32,
    /// None until the worker persists its first position
    #[serde(default)]
    pub resume_token: Option<ResumeToken>,
}

impl WorkerCheckpoint {
    pub fn new(collection: impl Into<String>, partition: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            collection: collection.into(),
            partition,
            resume_token: None,
        }
    }
}
