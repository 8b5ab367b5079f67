//! # Fanout Core
//!
//! Core types, routing and collaborator traits for the change-stream fan-out
//! engine.
//!
//! A single collection feed is split into N partitions by hashing one key
//! field. Each partition is tailed by its own worker, which checkpoints its
//! position and fans events out to registered listeners.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!                    │ ChangeFeed   │
//!                    └──────┬───────┘
//!        predicate(0) ┌─────┼─────┐ predicate(N-1)
//!                ┌────▼──┐     ┌──▼────┐
//!                │Worker0│ ... │WorkerN│──► ConfigStore (checkpoints)
//!                └───┬───┘     └───┬───┘
//!                    ▼             ▼
//!              ChangeListener  ChangeListener
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod partition;
pub mod strategy;

pub use self::config::*;
pub use self::error::*;
pub use self::filter::*;
pub use self::message::*;
pub use self::metrics::*;
pub use self::partition::*;
pub use self::strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::FanoutConfig;
    pub use crate::error::{FanoutError, Result};
    pub use crate::filter::Expr;
    pub use crate::message::{ChangeEvent, OperationType, ResumeToken};
    pub use crate::partition::PartitionRouter;
    pub use crate::strategy::{ChangeCursor, ChangeFeed, ChangeListener, ConfigStore, Lifecycle};
}
