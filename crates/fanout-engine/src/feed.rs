//! In-memory change feed
//!
//! Simulates a document collection together with its ordered operation log.
//! Cursors tail the log, evaluate the subscription predicate against each
//! entry and expose a post-batch resume token that advances even when no
//! entry matched. An optional retention limit drops old entries; resuming
//! from a token whose successors are gone is rejected the way a real feed
//! rejects an aged-out token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fanout_core::config::{FullDocumentBeforeChangeMode, FullDocumentMode};
use fanout_core::prelude::*;
use fanout_core::{lookup_path, UpdateDescription, WatchOptions, NATIVE_ID_FIELD};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Encode a log sequence number as a resume token
fn token_for(seq: u64) -> ResumeToken {
    ResumeToken::new(format!("{:016x}", seq))
}

fn parse_token(token: &ResumeToken) -> Option<u64> {
    u64::from_str_radix(token.as_str(), 16).ok()
}

/// Canonical map key of a document id
fn id_key(id: &Value) -> String {
    id.to_string()
}

#[derive(Debug, Clone)]
struct OplogEntry {
    seq: u64,
    operation: OperationType,
    document_key: Value,
    post_image: Option<Value>,
    pre_image: Option<Value>,
    update_description: Option<UpdateDescription>,
    wall_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FeedState {
    documents: BTreeMap<String, Value>,
    oplog: VecDeque<OplogEntry>,
    /// Sequence of the newest entry, 0 before the first write
    head: u64,
    /// Highest sequence dropped by retention
    truncated_through: u64,
    retention: Option<usize>,
}

impl FeedState {
    /// Entry right after `position`, if retained
    fn entry_after(&self, position: u64) -> Option<&OplogEntry> {
        let front = self.oplog.front()?;
        let index = (position + 1).checked_sub(front.seq)?;
        self.oplog.get(index as usize)
    }

    fn append(&mut self, mut entry: OplogEntry) -> u64 {
        self.head += 1;
        entry.seq = self.head;
        self.oplog.push_back(entry);
        if let Some(limit) = self.retention {
            self.enforce_retention(limit);
        }
        self.head
    }

    fn enforce_retention(&mut self, limit: usize) {
        while self.oplog.len() > limit {
            if let Some(dropped) = self.oplog.pop_front() {
                self.truncated_through = dropped.seq;
            }
        }
    }
}

struct Shared {
    state: RwLock<FeedState>,
    notify: Notify,
    failing_polls: AtomicUsize,
    failing_opens: AtomicUsize,
}

/// In-process change feed over a single collection
#[derive(Clone)]
pub struct MemoryChangeFeed {
    namespace: String,
    shard_key: Arc<Vec<String>>,
    shared: Arc<Shared>,
}

impl MemoryChangeFeed {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            shard_key: Arc::new(Vec::new()),
            shared: Arc::new(Shared {
                state: RwLock::new(FeedState::default()),
                notify: Notify::new(),
                failing_polls: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
            }),
        }
    }

    /// Builder: fields copied into every document key next to `_id`
    pub fn with_shard_key(mut self, fields: Vec<String>) -> Self {
        self.shard_key = Arc::new(fields);
        self
    }

    /// Limit the oplog to `entries`, dropping older ones right away
    pub async fn set_retention(&self, entries: Option<usize>) {
        let mut state = self.shared.state.write().await;
        state.retention = entries;
        if let Some(limit) = entries {
            state.enforce_retention(limit);
        }
    }

    /// Drop the whole retained history, as if it had aged out
    pub async fn truncate_history(&self) {
        let mut state = self.shared.state.write().await;
        state.truncated_through = state.head;
        state.oplog.clear();
        debug!(namespace = %self.namespace, through = state.head, "Truncated change history");
    }

    /// Make the next `count` cursor polls fail
    pub fn fail_next_polls(&self, count: usize) {
        self.shared.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` cursor opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Token of the newest entry
    pub async fn head_token(&self) -> ResumeToken {
        token_for(self.shared.state.read().await.head)
    }

    pub async fn document(&self, id: &Value) -> Option<Value> {
        self.shared.state.read().await.documents.get(&id_key(id)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.shared.state.read().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn document_key(&self, id: &Value, document: &Value) -> Value {
        let mut key = Map::new();
        for field in self.shard_key.iter() {
            if let Some(value) = lookup_path(document, field) {
                key.insert(field.clone(), value.clone());
            }
        }
        key.insert(NATIVE_ID_FIELD.to_string(), id.clone());
        Value::Object(key)
    }

    async fn commit(&self, entry: OplogEntry) -> u64 {
        let seq = self.shared.state.write().await.append(entry);
        self.shared.notify.notify_waiters();
        seq
    }

    // ------------------------------------------------------------------------
    // Collection operations
    // ------------------------------------------------------------------------

    /// Insert a document, generating `_id` when missing; returns the id
    pub async fn insert(&self, document: Value) -> Result<Value> {
        let Value::Object(mut fields) = document else {
            return Err(FanoutError::feed("Only objects can be inserted"));
        };
        let id = fields
            .entry(NATIVE_ID_FIELD.to_string())
            .or_insert_with(|| Value::String(Uuid::now_v7().to_string()))
            .clone();
        let document = Value::Object(fields);

        let entry = {
            let mut state = self.shared.state.write().await;
            let key = id_key(&id);
            if state.documents.contains_key(&key) {
                return Err(FanoutError::feed(format!("Duplicate key {}", id)));
            }
            state.documents.insert(key, document.clone());
            let entry = OplogEntry {
                seq: 0,
                operation: OperationType::Insert,
                document_key: self.document_key(&id, &document),
                post_image: Some(document),
                pre_image: None,
                update_description: None,
                wall_time: Utc::now(),
            };
            state.append(entry)
        };
        self.shared.notify.notify_waiters();
        trace!(namespace = %self.namespace, seq = entry, "Inserted document");
        Ok(id)
    }

    /// Set and unset top-level fields; false when the document does not exist
    pub async fn update(&self, id: &Value, set: Map<String, Value>, unset: Vec<String>) -> Result<bool> {
        {
            let mut state = self.shared.state.write().await;
            let Some(current) = state.documents.get(&id_key(id)).cloned() else {
                return Ok(false);
            };
            let mut next = match current.clone() {
                Value::Object(fields) => fields,
                _ => Map::new(),
            };
            for (field, value) in &set {
                if field == NATIVE_ID_FIELD {
                    return Err(FanoutError::feed("The _id field is immutable"));
                }
                next.insert(field.clone(), value.clone());
            }
            for field in &unset {
                next.remove(field);
            }
            let next = Value::Object(next);
            state.documents.insert(id_key(id), next.clone());

            let entry = OplogEntry {
                seq: 0,
                operation: OperationType::Update,
                document_key: self.document_key(id, &current),
                post_image: Some(next),
                pre_image: Some(current),
                update_description: Some(UpdateDescription::new(set, unset)),
                wall_time: Utc::now(),
            };
            state.append(entry);
        }
        self.shared.notify.notify_waiters();
        Ok(true)
    }

    /// Replace a document as a whole; false when it does not exist
    pub async fn replace(&self, id: &Value, document: Value) -> Result<bool> {
        let Value::Object(mut fields) = document else {
            return Err(FanoutError::feed("Only objects can replace a document"));
        };
        fields.insert(NATIVE_ID_FIELD.to_string(), id.clone());
        let document = Value::Object(fields);

        {
            let mut state = self.shared.state.write().await;
            let Some(previous) = state.documents.insert(id_key(id), document.clone()) else {
                state.documents.remove(&id_key(id));
                return Ok(false);
            };
            let entry = OplogEntry {
                seq: 0,
                operation: OperationType::Replace,
                document_key: self.document_key(id, &previous),
                post_image: Some(document),
                pre_image: Some(previous),
                update_description: None,
                wall_time: Utc::now(),
            };
            state.append(entry);
        }
        self.shared.notify.notify_waiters();
        Ok(true)
    }

    /// Delete a document; false when it does not exist
    pub async fn delete(&self, id: &Value) -> Result<bool> {
        {
            let mut state = self.shared.state.write().await;
            let Some(previous) = state.documents.remove(&id_key(id)) else {
                return Ok(false);
            };
            let entry = OplogEntry {
                seq: 0,
                operation: OperationType::Delete,
                document_key: self.document_key(id, &previous),
                post_image: None,
                pre_image: Some(previous),
                update_description: None,
                wall_time: Utc::now(),
            };
            state.append(entry);
        }
        self.shared.notify.notify_waiters();
        Ok(true)
    }

    /// Record a non-document operation (drop, rename, ...)
    pub async fn record_other(&self, document_key: Value) -> u64 {
        self.commit(OplogEntry {
            seq: 0,
            operation: OperationType::Other,
            document_key,
            post_image: None,
            pre_image: None,
            update_description: None,
            wall_time: Utc::now(),
        })
        .await
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn open_cursor(&self, options: &WatchOptions) -> Result<Box<dyn ChangeCursor>> {
        if take_one(&self.shared.failing_opens) {
            return Err(FanoutError::feed("injected open failure"));
        }

        let state = self.shared.state.read().await;
        let position = match &options.resume_after {
            None => state.head,
            Some(token) => {
                let seq = parse_token(token).ok_or_else(|| {
                    FanoutError::resume_token_rejected(token.as_str(), "not a token of this feed")
                })?;
                if seq > state.head {
                    return Err(FanoutError::resume_token_rejected(
                        token.as_str(),
                        "token is ahead of the feed",
                    ));
                }
                if seq < state.truncated_through {
                    return Err(FanoutError::resume_token_rejected(
                        token.as_str(),
                        "resume point is no longer in the retained history",
                    ));
                }
                seq
            }
        };

        debug!(
            namespace = %self.namespace,
            filter = %options.filter,
            position,
            "Opened change cursor"
        );

        Ok(Box::new(MemoryCursor {
            namespace: self.namespace.clone(),
            shared: Arc::clone(&self.shared),
            options: options.clone(),
            position,
        }))
    }

    fn name(&self) -> &'static str {
        "memory_change_feed"
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// Cursor
// ============================================================================

struct MemoryCursor {
    namespace: String,
    shared: Arc<Shared>,
    options: WatchOptions,
    /// Sequence of the last scanned entry
    position: u64,
}

impl MemoryCursor {
    fn build_event(&self, entry: &OplogEntry, state: &FeedState) -> ChangeEvent {
        let full_document = match (self.options.full_document, entry.operation) {
            (_, OperationType::Insert | OperationType::Replace) => entry.post_image.clone(),
            (FullDocumentMode::Default, _) => None,
            (FullDocumentMode::UpdateLookup, OperationType::Update) => entry
                .document_key
                .get(NATIVE_ID_FIELD)
                .and_then(|id| state.documents.get(&id_key(id)))
                .cloned(),
            (FullDocumentMode::WhenAvailable | FullDocumentMode::Required, OperationType::Update) => {
                entry.post_image.clone()
            }
            _ => None,
        };

        let full_document_before_change = match self.options.full_document_before_change {
            FullDocumentBeforeChangeMode::Off => None,
            FullDocumentBeforeChangeMode::WhenAvailable | FullDocumentBeforeChangeMode::Required => {
                entry.pre_image.clone()
            }
        };

        ChangeEvent {
            operation_type: entry.operation,
            namespace: self.namespace.clone(),
            document_key: entry.document_key.clone(),
            full_document,
            full_document_before_change,
            update_description: entry.update_description.clone(),
            resume_token: token_for(entry.seq),
            wall_time: entry.wall_time,
        }
    }

    /// Next matching event at or before the current head
    async fn scan(&mut self) -> Result<Option<ChangeEvent>> {
        let shared = Arc::clone(&self.shared);
        let state = shared.state.read().await;
        if self.position < state.truncated_through {
            return Err(FanoutError::feed(
                "cursor position fell out of the retained history",
            ));
        }
        while let Some(entry) = state.entry_after(self.position) {
            let event = self.build_event(entry, &state);
            self.position = entry.seq;
            if self.options.filter.matches(&event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ChangeCursor for MemoryCursor {
    async fn try_next(&mut self) -> Result<Option<ChangeEvent>> {
        if take_one(&self.shared.failing_polls) {
            return Err(FanoutError::feed("injected poll failure"));
        }

        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + self.options.max_await;
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.scan().await? {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        Some(token_for(self.position))
    }
}
