//! Counter store trait for abstracting the distributed and local backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::counter::{ConsumeOutcome, ConsumeSpec, CounterSnapshot};
use crate::error::Result;

/// Which backend served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Shared key-value store, consistent across processes
    Distributed,
    /// In-process fallback map
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Distributed => "distributed",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for counter store implementations.
///
/// `consume` must be atomic per key: concurrent callers on the same key each
/// observe a distinct, monotonically increasing count within a window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one hit against `key` and report whether it is within the limit.
    async fn consume(&self, key: &str, spec: &ConsumeSpec) -> Result<ConsumeOutcome>;

    /// Read the record for `key` without mutating it.
    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterSnapshot>>;

    /// Delete the record for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Which kind of backend this is.
    fn kind(&self) -> BackendKind;
}
