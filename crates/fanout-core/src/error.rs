//! Error types for the change-stream fan-out engine
//!
//! One `thiserror` enum for the whole fan-out; sources are kept for store and feed failures.

use std::fmt;
use thiserror::Error;

/// Result type alias for fan-out operations
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Primary error type for all fan-out operations
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Config/checkpoint store errors
    #[error("Store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Change feed transport errors (opening or polling a cursor)
    #[error("Feed error: {message}")]
    Feed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The feed no longer retains history for a stored resume token
    #[error("Resume token {token} rejected: {message}")]
    ResumeTokenRejected { token: String, message: String },

    /// Stored partition count differs from the requested one
    #[error(
        "Found previous config for collection {feed} with different number of partitions! \
         In existing config: {existing}, in requested config: {requested}"
    )]
    ConfigMismatch {
        feed: String,
        existing: u32,
        requested: u32,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A worker failed while the manager was starting
    #[error("Start failed: {source}")]
    StartFailure {
        #[source]
        source: Box<FanoutError>,
    },

    /// Operation invoked in a state that does not allow it
    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error with source
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a feed error
    pub fn feed(message: impl Into<String>) -> Self {
        Self::Feed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a resume token rejection
    pub fn resume_token_rejected(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResumeTokenRejected {
            token: token.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// Wrap a worker failure raised during manager start
    pub fn start_failure(cause: FanoutError) -> Self {
        Self::StartFailure {
            source: Box::new(cause),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if a worker can keep streaming after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. }
                | Self::Feed { .. }
                | Self::ResumeTokenRejected { .. }
                | Self::Timeout { .. }
                | Self::Serialization { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::Feed { .. } => "feed",
            Self::ResumeTokenRejected { .. } => "resume_token_rejected",
            Self::ConfigMismatch { .. } => "config_mismatch",
            Self::Configuration { .. } => "configuration",
            Self::StartFailure { .. } => "start_failure",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Timeout { .. } => "timeout",
            Self::Serialization { .. } => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for FanoutError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub collection: Option<String>,
    pub partition: Option<u32>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            collection: None,
            partition: None,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref collection) = self.collection {
            write!(f, " collection={}", collection)?;
        }
        if let Some(partition) = self.partition {
            write!(f, " partition={}", partition)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                collection = ?ctx.collection,
                partition = ?ctx.partition,
                "Operation failed"
            );
            e
        })
    }
}
