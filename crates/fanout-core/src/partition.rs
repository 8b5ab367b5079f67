//! Partition routing
//!
//! Maps a document's key value to one of N partitions. The mapping must be
//! identical across calls, processes and releases: a worker's feed filter is
//! computed once from it, and checkpoints assume a document never moves to
//! another partition.
//!
//! The hash is the first eight bytes (little endian) of a SHA-256 digest over
//! a type-tagged canonical encoding of the value. Integral numbers encode the
//! same whether they arrive as `1`, `1u64` or `1.0`, so a key read from a
//! post-image and from a deletion key payload always agree.

use crate::filter::Expr;
use crate::message::ChangeEvent;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Literal the partition predicate yields when the key is absent
const MISSING_KEY: &str = "null";

/// Stable signed 64-bit hash of a JSON value
pub fn stable_hash(value: &Value) -> i64 {
    let mut hasher = Sha256::new();
    encode_canonical(value, &mut hasher);
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(head)
}

/// Partition index of a key value: `|hash(key)| mod partitions`
///
/// `partitions` must be at least 1.
pub fn partition_of(key: &Value, partitions: u32) -> u32 {
    debug_assert!(partitions >= 1, "partition count must be positive");
    let bucket = stable_hash(key).unsigned_abs() % u64::from(partitions.max(1));
    bucket as u32
}

fn encode_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            let integral = n
                .as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from))
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 1e38)
                        .map(|f| f as i128)
                });
            match integral {
                Some(i) => {
                    hasher.update([2u8]);
                    hasher.update(i.to_le_bytes());
                }
                None => {
                    hasher.update([3u8]);
                    hasher.update(n.as_f64().unwrap_or(f64::NAN).to_bits().to_le_bytes());
                }
            }
        }
        Value::String(s) => {
            hasher.update([4u8]);
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update([5u8]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                encode_canonical(item, hasher);
            }
        }
        Value::Object(map) => {
            hasher.update([6u8]);
            hasher.update((map.len() as u64).to_le_bytes());
            for (k, v) in map {
                hasher.update((k.len() as u64).to_le_bytes());
                hasher.update(k.as_bytes());
                encode_canonical(v, hasher);
            }
        }
    }
}

/// Routes documents to partitions by one key field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRouter {
    key_name: String,
    partitions: u32,
}

impl PartitionRouter {
    pub fn new(key_name: impl Into<String>, partitions: u32) -> Self {
        Self {
            key_name: key_name.into(),
            partitions,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Partition of a raw key value
    pub fn partition_of(&self, key: &Value) -> u32 {
        partition_of(key, self.partitions)
    }

    /// Partition an event belongs to, `None` if it carries no key value
    pub fn route(&self, event: &ChangeEvent) -> Option<u32> {
        event.key_value(&self.key_name).map(|key| self.partition_of(key))
    }

    /// Feed predicate selecting the events of `partition`
    ///
    /// A single subscription has to catch both shapes of event: those with a
    /// post-image (insert/update/replace) and deletes, which only carry the
    /// document key. The predicate is the OR of the two branches.
    pub fn predicate(&self, partition: u32) -> Expr {
        Expr::or(vec![
            self.branch(Expr::full_document_key(&self.key_name), partition),
            self.branch(Expr::document_key(&self.key_name), partition),
        ])
    }

    fn branch(&self, key: Expr, partition: u32) -> Expr {
        Expr::eq(
            Expr::cond(
                Expr::exists(key.clone()),
                Expr::modulo(Expr::abs(Expr::hash(key)), u64::from(self.partitions)),
                Expr::lit(MISSING_KEY),
            ),
            Expr::lit(partition),
        )
    }
}
