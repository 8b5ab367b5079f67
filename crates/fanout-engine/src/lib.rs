//! # Fanout Engine
//!
//! Splits a collection's change feed into N partitions, each tailed by its
//! own worker task that checkpoints its position and fans changes out to
//! registered listeners.
//!
//! ## Components
//!
//! - `ChangeStreamManager`: validates the partition count, starts and stops
//!   the workers, routes listener registration
//! - `ChangeStreamWorker`: per-partition tail loop
//! - `MemoryChangeFeed`: in-process feed with resume tokens and retention
//! - `MemoryConfigStore` / `FileConfigStore`: cluster config and checkpoints
//! - `CollectingListener` / `ChannelListener`: reusable listeners
//!
//! ## Usage
//!
//! ```rust,ignore
//! let feed = Arc::new(MemoryChangeFeed::new("orders"));
//! let store = Arc::new(MemoryConfigStore::new());
//! let config = FanoutConfig::for_collection("orders", 3);
//!
//! let manager = ChangeStreamManager::new(config, feed, store).await?;
//! manager.register_listener_to_all_partitions(Arc::new(CollectingListener::new("all")));
//! manager.start().await?;
//! ```

pub mod backoff;
pub mod context;
pub mod feed;
pub mod listener;
pub mod manager;
pub mod store;
pub mod worker;

pub use backoff::ErrorBackoff;
pub use feed::MemoryChangeFeed;
pub use listener::{ChannelListener, CollectingListener, ListenerSet, ListenerSnapshot};
pub use manager::ChangeStreamManager;
pub use store::{store_from_config, FileConfigStore, MemoryConfigStore};
pub use worker::{ChangeStreamWorker, WorkerState};
