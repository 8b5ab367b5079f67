//! Configuration types for the change-stream fan-out engine
//!
//! Defaults, then an optional file, then `CDC_FANOUT__*` environment variables.

use crate::error::{FanoutError, Result};
use crate::filter::Expr;
use crate::message::NATIVE_ID_FIELD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Post-image inclusion requested from the feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullDocumentMode {
    /// Post-image only where the operation naturally has one (insert, replace)
    Default,
    /// Also look up the current document for updates
    #[default]
    UpdateLookup,
    /// Attach a stored post-image when one is available
    WhenAvailable,
    /// Attach a stored post-image, failing the event if there is none
    Required,
}

/// Pre-image inclusion requested from the feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullDocumentBeforeChangeMode {
    #[default]
    Off,
    WhenAvailable,
    Required,
}

/// Root configuration of one fan-out manager
///
/// Immutable once handed to a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Connection string of the document store
    #[serde(default = "default_connection_uri")]
    pub connection_uri: String,

    /// Database holding the watched and the config collections
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Watched collection; also the feed name of the cluster config
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Field documents are routed on
    #[serde(default = "default_key_name")]
    pub key_name: String,

    /// Number of partitions (fixed once committed)
    #[serde(default = "default_number_of_partitions")]
    pub number_of_partitions: u32,

    /// Collection holding worker checkpoints
    #[serde(default = "default_worker_config_collection")]
    pub worker_config_collection_name: String,

    /// Collection holding cluster configs
    #[serde(default = "default_cluster_config_collection")]
    pub cluster_config_collection_name: String,

    #[serde(default)]
    pub full_document: FullDocumentMode,

    #[serde(default)]
    pub full_document_before_change: FullDocumentBeforeChangeMode,

    /// Upper bound of one cursor poll
    #[serde(with = "humantime_serde", default = "default_max_await")]
    pub max_await: Duration,

    /// How long `start` waits for each worker to open its cursor
    #[serde(with = "humantime_serde", default = "default_lifecycle_timeout")]
    pub init_timeout: Duration,

    /// How long `stop` waits for each worker to finish
    #[serde(with = "humantime_serde", default = "default_lifecycle_timeout")]
    pub shutdown_timeout: Duration,

    /// Turn an initialization timeout into a start failure
    #[serde(default)]
    pub fail_on_init_timeout: bool,

    /// Extra predicate ANDed with every partition predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_filter: Option<Expr>,

    /// Checkpoint store configuration
    #[serde(default)]
    pub checkpoint_store: CheckpointStoreConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_connection_uri() -> String {
    "memory://local".to_string()
}

fn default_database_name() -> String {
    "cdc".to_string()
}

fn default_collection_name() -> String {
    "events".to_string()
}

fn default_key_name() -> String {
    NATIVE_ID_FIELD.to_string()
}

fn default_number_of_partitions() -> u32 {
    1
}

fn default_worker_config_collection() -> String {
    "changeStreamWorkerConfig".to_string()
}

fn default_cluster_config_collection() -> String {
    "changeStreamClusterConfig".to_string()
}

fn default_max_await() -> Duration {
    Duration::from_millis(1000)
}

fn default_lifecycle_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            connection_uri: default_connection_uri(),
            database_name: default_database_name(),
            collection_name: default_collection_name(),
            key_name: default_key_name(),
            number_of_partitions: default_number_of_partitions(),
            worker_config_collection_name: default_worker_config_collection(),
            cluster_config_collection_name: default_cluster_config_collection(),
            full_document: FullDocumentMode::default(),
            full_document_before_change: FullDocumentBeforeChangeMode::default(),
            max_await: default_max_await(),
            init_timeout: default_lifecycle_timeout(),
            shutdown_timeout: default_lifecycle_timeout(),
            fail_on_init_timeout: false,
            match_filter: None,
            checkpoint_store: CheckpointStoreConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointStoreConfig {
    /// Storage type: "memory" or "file"
    #[serde(default = "default_storage_type")]
    pub storage_type: String,

    /// Path for the file-based store
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_storage_type() -> String {
    "memory".to_string()
}

fn default_store_path() -> String {
    "/var/lib/cdc-fanout/config.json".to_string()
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            path: default_store_path(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl FanoutConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix CDC_FANOUT__
        builder = builder.add_source(
            config::Environment::with_prefix("CDC_FANOUT")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject configurations no manager can run with
    pub fn validate(&self) -> Result<()> {
        if self.number_of_partitions < 1 {
            return Err(FanoutError::config(
                "Cannot initialize with less than 1 partition!",
            ));
        }
        for (name, value) in [
            ("database_name", &self.database_name),
            ("collection_name", &self.collection_name),
            ("key_name", &self.key_name),
            ("worker_config_collection_name", &self.worker_config_collection_name),
            ("cluster_config_collection_name", &self.cluster_config_collection_name),
        ] {
            if value.trim().is_empty() {
                return Err(FanoutError::config(format!("{} must not be empty", name)));
            }
        }
        if self.max_await.is_zero() {
            return Err(FanoutError::config("max_await must be greater than zero"));
        }
        Ok(())
    }

    /// Builder-free shorthand used by embedders and tests
    pub fn for_collection(collection_name: impl Into<String>, number_of_partitions: u32) -> Self {
        Self {
            collection_name: collection_name.into(),
            number_of_partitions,
            ..Default::default()
        }
    }
}
