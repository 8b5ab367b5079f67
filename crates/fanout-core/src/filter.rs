//! Predicate expressions pushed to the change feed
//!
//! Workers never filter events themselves: each one builds an [`Expr`] once
//! and hands it to the `ChangeFeed`, which evaluates it server-side (or, for
//! in-process feeds, through [`Expr::matches`]). The tree is small on purpose:
//! field access, literals, hashing, arithmetic used by the partition
//! predicate, equality, conditionals and boolean combinators.
//!
//! ## Field paths
//!
//! Field paths are rooted at the change event:
//!
//! - `fullDocument.<path>`
//! - `fullDocumentBeforeChange.<path>`
//! - `documentKey.<path>`
//! - `updateDescription.updatedFields.<path>`
//! - `operationType`, `ns`
//!
//! ## Example
//!
//! ```rust,ignore
//! // only inserts whose post-image has status == "paid"
//! let filter = Expr::and(vec![
//!     Expr::eq(Expr::field("operationType"), Expr::lit("insert")),
//!     Expr::eq(Expr::field("fullDocument.status"), Expr::lit("paid")),
//! ]);
//! ```

use crate::message::{lookup_path, ChangeEvent};
use crate::partition::stable_hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Expression tree evaluated against a [`ChangeEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Value at a dotted path of the event (missing when absent)
    Field(String),
    /// Constant value
    Literal(Value),
    /// Stable 64-bit hash of the operand
    Hash(Box<Expr>),
    /// Absolute value of a numeric operand
    Abs(Box<Expr>),
    /// Remainder of a numeric operand divided by a positive constant
    Mod(Box<Expr>, u64),
    /// Numeric-aware equality
    Eq(Box<Expr>, Box<Expr>),
    /// True when the operand is present and not null
    Exists(Box<Expr>),
    /// `then` when `when` is truthy, `otherwise` else
    Cond {
        when: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn field(path: impl Into<String>) -> Self {
        Self::Field(path.into())
    }

    /// `fullDocument.<key>`
    pub fn full_document_key(key_name: &str) -> Self {
        Self::Field(format!("fullDocument.{}", key_name))
    }

    /// `documentKey.<key>`
    pub fn document_key(key_name: &str) -> Self {
        Self::Field(format!("documentKey.{}", key_name))
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn hash(expr: Expr) -> Self {
        Self::Hash(Box::new(expr))
    }

    pub fn abs(expr: Expr) -> Self {
        Self::Abs(Box::new(expr))
    }

    pub fn modulo(expr: Expr, divisor: u64) -> Self {
        Self::Mod(Box::new(expr), divisor)
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::Eq(Box::new(left), Box::new(right))
    }

    pub fn exists(expr: Expr) -> Self {
        Self::Exists(Box::new(expr))
    }

    pub fn cond(when: Expr, then: Expr, otherwise: Expr) -> Self {
        Self::Cond {
            when: Box::new(when),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn and(exprs: Vec<Expr>) -> Self {
        Self::And(exprs)
    }

    pub fn or(exprs: Vec<Expr>) -> Self {
        Self::Or(exprs)
    }

    /// Evaluate against an event; `None` stands for a missing value
    pub fn evaluate(&self, event: &ChangeEvent) -> Option<Value> {
        match self {
            Self::Field(path) => resolve_field(event, path),
            Self::Literal(value) => Some(value.clone()),
            Self::Hash(inner) => {
                let value = inner.evaluate(event).unwrap_or(Value::Null);
                Some(Value::from(stable_hash(&value)))
            }
            Self::Abs(inner) => {
                let n = as_integer(&inner.evaluate(event)?)?;
                Some(integer_value(n.abs()))
            }
            Self::Mod(inner, divisor) => {
                if *divisor == 0 {
                    return None;
                }
                let n = as_integer(&inner.evaluate(event)?)?;
                Some(integer_value(n % i128::from(*divisor)))
            }
            Self::Eq(left, right) => {
                let equal = match (left.evaluate(event), right.evaluate(event)) {
                    (None, None) => true,
                    (Some(a), Some(b)) => values_equal(&a, &b),
                    _ => false,
                };
                Some(Value::Bool(equal))
            }
            Self::Exists(inner) => Some(Value::Bool(
                !matches!(inner.evaluate(event), None | Some(Value::Null)),
            )),
            Self::Cond {
                when,
                then,
                otherwise,
            } => {
                if truthy(when.evaluate(event).as_ref()) {
                    then.evaluate(event)
                } else {
                    otherwise.evaluate(event)
                }
            }
            Self::And(exprs) => Some(Value::Bool(
                exprs.iter().all(|e| truthy(e.evaluate(event).as_ref())),
            )),
            Self::Or(exprs) => Some(Value::Bool(
                exprs.iter().any(|e| truthy(e.evaluate(event).as_ref())),
            )),
        }
    }

    /// Check if the event passes this predicate
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        truthy(self.evaluate(event).as_ref())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, exprs: &[Expr]) -> fmt::Result {
            write!(f, "{}(", name)?;
            for (i, e) in exprs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", e)?;
            }
            f.write_str(")")
        }

        match self {
            Self::Field(path) => write!(f, "${}", path),
            Self::Literal(value) => write!(f, "{}", value),
            Self::Hash(inner) => write!(f, "hash({})", inner),
            Self::Abs(inner) => write!(f, "abs({})", inner),
            Self::Mod(inner, divisor) => write!(f, "mod({}, {})", inner, divisor),
            Self::Eq(left, right) => write!(f, "eq({}, {})", left, right),
            Self::Exists(inner) => write!(f, "exists({})", inner),
            Self::Cond {
                when,
                then,
                otherwise,
            } => write!(f, "cond({}, {}, {})", when, then, otherwise),
            Self::And(exprs) => list(f, "and", exprs),
            Self::Or(exprs) => list(f, "or", exprs),
        }
    }
}

/// Resolve an event-rooted field path
fn resolve_field(event: &ChangeEvent, path: &str) -> Option<Value> {
    let (root, rest) = match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    };

    let base = match root {
        "operationType" => return Some(Value::from(event.operation_type.as_str())),
        "ns" => return Some(Value::from(event.namespace.as_str())),
        "fullDocument" => event.full_document.as_ref()?,
        "fullDocumentBeforeChange" => event.full_document_before_change.as_ref()?,
        "documentKey" => &event.document_key,
        "updateDescription" => {
            let description = serde_json::to_value(event.update_description.as_ref()?).ok()?;
            return match rest {
                Some(rest) => lookup_path(&description, rest).cloned(),
                None => Some(description),
            };
        }
        _ => return None,
    };

    match rest {
        Some(rest) => lookup_path(base, rest).cloned(),
        None => Some(base.clone()),
    }
}

fn as_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| n.as_f64().map(|f| f.trunc() as i128)),
        _ => None,
    }
}

fn integer_value(n: i128) -> Value {
    if let Ok(v) = i64::try_from(n) {
        Value::from(v)
    } else if let Ok(v) = u64::try_from(n) {
        Value::from(v)
    } else {
        Value::Null
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if !x.is_f64() && !y.is_f64() => {
            as_integer(a) == as_integer(b)
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Aggregation-style truthiness: missing, null, false and zero are false
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}
