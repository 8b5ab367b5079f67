//! Strategy traits for the change-stream fan-out engine
//!
//! The engine only touches its surroundings through these traits, so the
//! transport, the durable store and the consumers can be swapped freely.
//!
//! ## Strategy Hierarchy
//!
//! ```text
//! Lifecycle (start/stop)
//!     └── ChangeStreamManager
//!
//! ChangeFeed ──opens──► ChangeCursor   (transport, pulled by workers)
//! ConfigStore                          (cluster config + checkpoints)
//! ChangeListener                       (consumers, fanned out to)
//! ```

use crate::config::{FullDocumentBeforeChangeMode, FullDocumentMode};
use crate::error::Result;
use crate::filter::Expr;
use crate::message::{ChangeEvent, ClusterConfig, ResumeToken, WorkerCheckpoint};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Returns once the component is ready to process changes.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    ///
    /// May be called even if start() failed.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

// ============================================================================
// Feed Strategies
// ============================================================================

/// Subscription parameters for one cursor
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    /// Server-side predicate; only matching events are returned
    pub filter: Expr,
    /// Post-image inclusion
    pub full_document: FullDocumentMode,
    /// Pre-image inclusion
    pub full_document_before_change: FullDocumentBeforeChangeMode,
    /// Upper bound a single `try_next` may wait for new events
    pub max_await: Duration,
    /// Resume right after this position instead of starting from now
    pub resume_after: Option<ResumeToken>,
}

impl WatchOptions {
    pub fn new(filter: Expr) -> Self {
        Self {
            filter,
            full_document: FullDocumentMode::default(),
            full_document_before_change: FullDocumentBeforeChangeMode::default(),
            max_await: Duration::from_millis(1000),
            resume_after: None,
        }
    }

    /// Builder: set resume position
    pub fn resume_after(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_after = token;
        self
    }

    /// Builder: set max wait
    pub fn with_max_await(mut self, max_await: Duration) -> Self {
        self.max_await = max_await;
        self
    }
}

/// Change feed strategy - the transport workers tail
///
/// Implementations:
/// - `MemoryChangeFeed`: in-process collection with an ordered oplog
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a filtered tailing cursor
    ///
    /// Fails with `FanoutError::ResumeTokenRejected` when
    /// `options.resume_after` is no longer covered by retained history.
    async fn open_cursor(&self, options: &WatchOptions) -> Result<Box<dyn ChangeCursor>>;

    /// Feed name for logs
    fn name(&self) -> &'static str;
}

/// Tailing cursor over a change feed
#[async_trait]
pub trait ChangeCursor: Send {
    /// Next matching event, or `None` after waiting at most `max_await`
    async fn try_next(&mut self) -> Result<Option<ChangeEvent>>;

    /// Current position, also advanced by polls that returned nothing
    fn resume_token(&self) -> Option<ResumeToken>;
}

// ============================================================================
// Store Strategies
// ============================================================================

/// Durable store for cluster configs and worker checkpoints
///
/// Implementations:
/// - `MemoryConfigStore`: process-local, for tests
/// - `FileConfigStore`: JSON file written atomically
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Cluster config of a collection, if one was committed
    async fn find_cluster_config(&self, collection: &str) -> Result<Option<ClusterConfig>>;

    /// Existing cluster config, or a new one with `partitions`
    async fn get_or_init_cluster_config(
        &self,
        collection: &str,
        partitions: u32,
    ) -> Result<ClusterConfig>;

    /// Existing checkpoint of a partition, or a new one without a resume token
    async fn get_or_init_checkpoint(
        &self,
        collection: &str,
        partition: u32,
    ) -> Result<WorkerCheckpoint>;

    /// Replace the resume token of a checkpoint
    async fn update_resume_token(&self, checkpoint_id: Uuid, token: &ResumeToken) -> Result<()>;

    /// Store name for logs
    fn name(&self) -> &'static str;
}

// ============================================================================
// Listener Strategy
// ============================================================================

/// Consumer of change events
///
/// Handlers run on the partition's worker task, one event at a time, in feed
/// order. A handler that panics aborts delivery of that event to listeners
/// after it, so implementations should guard their own failures.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn handle(&self, event: &ChangeEvent);

    /// Listener name for logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
