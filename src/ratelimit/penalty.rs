//! Progressive penalties for repeat offenders.
//!
//! Every denial is remembered for a trailing window. Each remembered denial
//! halves the identity's effective quota. Nothing is cached, so a quiet
//! window restores the full quota without any explicit unban.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::clock::saturating_sub;

/// Default trailing window for violations.
pub const DEFAULT_PENALTY_WINDOW: Duration = Duration::from_secs(3600);
/// Default bound on remembered violations per identity.
pub const DEFAULT_MAX_TRACKED: usize = 64;

/// `max(1, floor(base * 0.5^violations))`.
pub fn penalized_quota(base: u64, violations: usize) -> u64 {
    if violations == 0 {
        return base;
    }
    if violations >= 64 {
        return 1;
    }
    ((base as f64) * 0.5f64.powi(violations as i32)).floor().max(1.0) as u64
}

/// Tracks recent denials per identity.
#[derive(Debug)]
pub struct PenaltyTracker {
    violations: DashMap<String, VecDeque<DateTime<Utc>>>,
    window: Duration,
    max_tracked: usize,
    enabled: bool,
}

impl Default for PenaltyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PENALTY_WINDOW, DEFAULT_MAX_TRACKED)
    }
}

impl PenaltyTracker {
    pub fn new(window: Duration, max_tracked: usize) -> Self {
        Self {
            violations: DashMap::new(),
            window,
            max_tracked: max_tracked.max(1),
            enabled: true,
        }
    }

    /// A tracker that never reduces quotas.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Remember a denial for `identity`.
    pub fn record_violation(&self, identity: &str, at: DateTime<Utc>) {
        if !self.enabled {
            return;
        }

        let mut history = self.violations.entry(identity.to_string()).or_default();
        history.push_back(at);
        while history.len() > self.max_tracked {
            history.pop_front();
        }
        trace!(identity = %identity, violations = history.len(), "Recorded violation");
    }

    /// Violations within the trailing window, pruning older ones.
    pub fn violation_count(&self, identity: &str, now: DateTime<Utc>) -> usize {
        let cutoff = saturating_sub(now, self.window);
        match self.violations.get_mut(identity) {
            Some(mut history) => {
                while history.front().is_some_and(|at| *at <= cutoff) {
                    history.pop_front();
                }
                history.len()
            }
            None => 0,
        }
    }

    /// The quota `identity` may use right now.
    pub fn effective_quota(&self, identity: &str, base: u64, now: DateTime<Utc>) -> u64 {
        if !self.enabled {
            return base;
        }

        let violations = self.violation_count(identity, now);
        let quota = penalized_quota(base, violations);
        if quota < base {
            debug!(
                identity = %identity,
                violations = violations,
                base = base,
                effective = quota,
                "Applying progressive penalty"
            );
        }
        quota
    }

    /// Drop identities with no violations left in the window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = saturating_sub(now, self.window);
        let before = self.violations.len();
        self.violations
            .retain(|_, history| history.back().is_some_and(|at| *at > cutoff));
        before - self.violations.len()
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.violations.len()
    }
}
