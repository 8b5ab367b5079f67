//! Logging context ids
//!
//! Every manager gets a process-unique id, every worker derives its own from
//! it. Both are attached to log lines as structured fields.

use std::sync::atomic::{AtomicUsize, Ordering};

static MANAGER_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Next manager id: `csem_{database}_{collection}_{n}`
pub fn next_manager_id(database: &str, collection: &str) -> String {
    let n = MANAGER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("csem_{}_{}_{}", database, collection, n)
}

/// Worker id: `{manager_id}_partition_{p}`
pub fn worker_id(manager_id: &str, partition: u32) -> String {
    format!("{}_partition_{}", manager_id, partition)
}
