//! Counter records and the fixed-window arithmetic shared by both backends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::clock::delta;

/// Parameters for one atomic consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSpec {
    /// Effective limit for this call (after penalties)
    pub limit: u64,
    /// Counting window
    pub window: Duration,
    /// Cooldown once the limit is exceeded, measured from the window start
    pub block: Duration,
    /// The instant of the call
    pub now: DateTime<Utc>,
}

/// Result of an atomic consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Hits recorded in the current window, including this one
    pub count: u64,
    pub remaining: u64,
    /// When the record expires and a fresh window begins
    pub reset_at: DateTime<Utc>,
}

/// Read-only view of a counter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

/// A counter tracking hits within a window for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    /// Current count of hits in this window
    pub count: u64,
    /// When the current window started
    pub window_started_at: DateTime<Utc>,
    /// When the counting window ends
    pub window_reset_at: DateTime<Utc>,
    /// Set once the limit was exceeded and the block outlasts the window
    pub blocked_until: Option<DateTime<Utc>>,
}

impl CounterRecord {
    /// Start a fresh, empty window at `now`.
    pub fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            window_started_at: now,
            window_reset_at: now + delta(window),
            blocked_until: None,
        }
    }

    /// When this record stops mattering.
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self.blocked_until {
            Some(until) if until > self.window_reset_at => until,
            _ => self.window_reset_at,
        }
    }

    /// Whether the record has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Record one hit and report the outcome.
    ///
    /// An expired record is replaced by a fresh window first. The first hit
    /// over the limit arms the block; later denied hits never extend it.
    pub fn consume(&mut self, spec: &ConsumeSpec) -> ConsumeOutcome {
        if self.is_expired(spec.now) {
            *self = Self::fresh(spec.now, spec.window);
        }

        self.count += 1;

        if self.count > spec.limit && self.blocked_until.is_none() {
            let until = self.window_started_at + delta(spec.block);
            if until > self.window_reset_at {
                self.blocked_until = Some(until);
            }
        }

        ConsumeOutcome {
            allowed: self.count <= spec.limit,
            count: self.count,
            remaining: spec.limit.saturating_sub(self.count),
            reset_at: self.expires_at(),
        }
    }

    /// Snapshot of the record.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            reset_at: self.expires_at(),
        }
    }
}
