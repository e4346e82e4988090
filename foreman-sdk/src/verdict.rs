//! The test verdict written by the external test runner.
//!
//! foreman only reads this file. Two shapes are accepted:
//!
//! ```text
//! { "passed": true, "total": 12, "failed": 0, ... }   boolean verdict
//! { "passed": 11, "total": 12 }                        counts, green iff equal
//! ```
//!
//! A missing or unreadable verdict counts as failing.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Parsed test verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub total: Option<u64>,
    pub failed: Option<u64>,
    pub message: Option<String>,
    pub timestamp: Option<String>,
}

impl Verdict {
    /// Read the verdict at `path`, failing closed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw).unwrap_or_else(|| {
                debug!(path = %path.display(), "Unparseable test verdict, treating as failing");
                Self::default()
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No test verdict, treating as failing");
                Self::default()
            }
        }
    }

    /// Parse a verdict record. `None` when the record has no usable `passed`.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;
        let total = obj.get("total").and_then(Value::as_u64);
        let passed = match obj.get("passed")? {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_u64()? == total.unwrap_or(1),
            _ => return None,
        };
        Some(Self {
            passed,
            total,
            failed: obj.get("failed").and_then(Value::as_u64),
            message: obj.get("message").and_then(Value::as_str).map(str::to_string),
            timestamp: obj.get("timestamp").and_then(Value::as_str).map(str::to_string),
        })
    }
}
