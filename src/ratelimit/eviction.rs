//! Background eviction of expired fallback state.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::local::LocalCounterStore;
use super::penalty::PenaltyTracker;
use crate::clock::Clock;

/// Default sweep interval.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(300);

/// What a single sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub counters: usize,
    pub identities: usize,
}

/// Periodically removes expired local counters and stale penalty history.
pub struct EvictionScheduler {
    local: Arc<LocalCounterStore>,
    penalties: Arc<PenaltyTracker>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl EvictionScheduler {
    pub fn new(
        local: Arc<LocalCounterStore>,
        penalties: Arc<PenaltyTracker>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            local,
            penalties,
            clock,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run one sweep now.
    pub async fn run_once(&self) -> SweepReport {
        let now = self.clock.now();
        let counters = self.local.sweep(now).await;
        let identities = self.penalties.prune(now);

        counter!("floodgate_evicted_records_total").increment(counters as u64);
        gauge!("floodgate_local_records").set(self.local.len() as f64);

        if counters > 0 || identities > 0 {
            debug!(
                counters = counters,
                identities = identities,
                "Evicted expired limiter state"
            );
        }

        SweepReport {
            counters,
            identities,
        }
    }

    /// Start sweeping on a background task.
    ///
    /// The first sweep happens one interval after spawning.
    pub fn spawn(self) -> EvictionHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(ticker);

            info!(interval_secs = period.as_secs(), "Eviction scheduler started");
            loop {
                tokio::select! {
                    _ = ticks.next() => {
                        self.run_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Eviction scheduler stopped");
        });

        EvictionHandle { shutdown_tx, task }
    }
}

/// Handle to a running [`EvictionScheduler`].
pub struct EvictionHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EvictionHandle {
    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait for it to finish its current sweep.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "Eviction task ended abnormally");
        }
    }
}
