//! Execution identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

use crate::error::CmdChainError;

const PREFIX: &str = "exec-";

static NEXT: AtomicU64 = AtomicU64::new(1);

/// Key under which one execution is cached and recorded.
///
/// Rendered as `exec-` plus zero-padded hex, so the string form sorts in
/// the order executions were started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{:08x}", self.0)
    }
}

impl Serialize for ExecutionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parses the cache key form back, e.g. from [`HistoryRecord::id`](crate::HistoryRecord).
impl FromStr for ExecutionId {
    type Err = CmdChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(PREFIX)
            .filter(|hex| !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(ExecutionId)
            .ok_or_else(|| CmdChainError::Internal(format!("malformed execution id: {s}")))
    }
}
