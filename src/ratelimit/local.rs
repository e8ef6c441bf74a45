//! In-process fallback counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{BackendKind, CounterStore};
use super::counter::{ConsumeOutcome, ConsumeSpec, CounterRecord, CounterSnapshot};
use crate::error::Result;

/// Number of removals between cooperative yields during a sweep.
const SWEEP_YIELD_EVERY: usize = 256;

/// Counter store backed by a sharded in-process map.
///
/// Every mutation happens under the shard write lock of its key, so
/// increments on the same key are linearizable. Correctness is process-local.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    records: DashMap<String, CounterRecord>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically record one hit. Never suspends.
    pub fn increment(&self, key: &str, spec: &ConsumeSpec) -> ConsumeOutcome {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, "Creating local counter record");
                CounterRecord::fresh(spec.now, spec.window)
            });

        record.consume(spec)
    }

    /// Snapshot of a live record.
    pub fn snapshot(&self, key: &str, now: DateTime<Utc>) -> Option<CounterSnapshot> {
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.snapshot())
    }

    /// Remove a record. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record that has expired at `now`.
    ///
    /// Candidates are collected first, then each is removed only if it is
    /// still expired under its shard lock, so a record renewed by a
    /// concurrent consume survives. Yields periodically.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for (i, key) in candidates.iter().enumerate() {
            if self
                .records
                .remove_if(key, |_, record| record.is_expired(now))
                .is_some()
            {
                removed += 1;
            }
            if (i + 1) % SWEEP_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        debug!(
            candidates = candidates.len(),
            removed = removed,
            remaining = self.records.len(),
            "Swept local counter records"
        );
        removed
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn consume(&self, key: &str, spec: &ConsumeSpec) -> Result<ConsumeOutcome> {
        Ok(self.increment(key, spec))
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterSnapshot>> {
        Ok(self.snapshot(key, now))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}
