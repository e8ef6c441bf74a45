//! The limiter engine.
//!
//! Ties policies, key derivation, penalties, the circuit breaker and both
//! counter stores together into a single admit/deny decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::backend::{BackendKind, CounterStore};
use super::breaker::{BreakerError, BreakerSettings, CircuitBreaker};
use super::counter::{ConsumeOutcome, ConsumeSpec, CounterSnapshot};
use super::decision::{Decision, LimitStatus};
use super::distributed::RedisCounterStore;
use super::eviction::{EvictionHandle, EvictionScheduler, DEFAULT_EVICTION_INTERVAL};
use super::identity::{RateLimitKey, RequestContext};
use super::local::LocalCounterStore;
use super::penalty::PenaltyTracker;
use super::policy::{Category, Policy, PolicyRegistry};
use crate::alert::{AlertSink, ChannelAlertSink, SecurityAlert, TracingAlertSink};
use crate::clock::{seconds_until, Clock, SystemClock};
use crate::config::FloodgateConfig;
use crate::error::Result;

/// Default upper bound on the pacing delay of evenly spread policies.
pub const DEFAULT_MAX_PACING_DELAY: Duration = Duration::from_secs(1);

/// How long an allowed call under an evenly spread policy should wait so
/// that the remaining points are spread over the rest of the window.
pub fn pacing_delay(remaining: u64, until_reset: Duration, cap: Duration) -> Duration {
    let divisor = u32::try_from(remaining.saturating_add(2)).unwrap_or(u32::MAX);
    (until_reset / divisor).min(cap)
}

/// The rate limiter engine.
///
/// All process-scoped state (fallback counters, breaker, penalties) is owned
/// by handles passed in at construction, so several engines can coexist.
pub struct LimiterEngine {
    registry: Arc<PolicyRegistry>,
    distributed: Option<Arc<dyn CounterStore>>,
    local: Arc<LocalCounterStore>,
    breaker: Arc<CircuitBreaker>,
    penalties: Arc<PenaltyTracker>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    max_pacing_delay: Duration,
    eviction_interval: Duration,
}

impl std::fmt::Debug for LimiterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterEngine")
            .field("policies", &self.registry.len())
            .field("distributed", &self.distributed.is_some())
            .field("breaker", &self.breaker)
            .field("local_records", &self.local.len())
            .finish()
    }
}

impl LimiterEngine {
    /// Start building an engine around a policy registry.
    pub fn builder(registry: PolicyRegistry) -> EngineBuilder {
        EngineBuilder::new(registry)
    }

    /// Wire an engine from configuration. Alerts go to the `security` log target.
    ///
    /// The distributed store is only used when a Redis URL is configured.
    pub fn from_config(config: &FloodgateConfig) -> Result<Self> {
        Ok(Self::configured(config)?.build())
    }

    /// Like [`LimiterEngine::from_config`], but alerts are delivered into a
    /// bounded channel for an external consumer.
    pub fn from_config_with_alert_channel(
        config: &FloodgateConfig,
    ) -> Result<(Self, mpsc::Receiver<SecurityAlert>)> {
        let (sink, rx) = ChannelAlertSink::new(config.alerts.channel_capacity);
        let engine = Self::configured(config)?.alerts(Arc::new(sink)).build();
        Ok((engine, rx))
    }

    fn configured(config: &FloodgateConfig) -> Result<EngineBuilder> {
        let registry = PolicyRegistry::from_config(&config.policies)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let breaker = CircuitBreaker::new(
            "distributed_counter_store",
            BreakerSettings {
                failure_threshold: config.breaker.failure_threshold,
                cooldown: Duration::from_secs(config.breaker.cooldown_secs),
                call_timeout: Duration::from_millis(config.redis.timeout_ms),
            },
            clock.clone(),
        );

        let penalties = if config.penalty.enabled {
            PenaltyTracker::new(
                Duration::from_secs(config.penalty.window_secs),
                config.penalty.max_tracked_violations,
            )
        } else {
            PenaltyTracker::disabled()
        };

        let mut builder = Self::builder(registry)
            .clock(clock)
            .breaker(Arc::new(breaker))
            .penalties(Arc::new(penalties))
            .max_pacing_delay(Duration::from_millis(config.pacing.max_delay_ms))
            .eviction_interval(Duration::from_secs(config.eviction.interval_secs));

        if let Some(url) = &config.redis.url {
            let store = RedisCounterStore::new(url, config.redis.key_prefix.clone())?;
            builder = builder.distributed(Arc::new(store));
        } else {
            warn!("No Redis URL configured, counters are process-local only");
        }

        Ok(builder)
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn local_store(&self) -> &Arc<LocalCounterStore> {
        &self.local
    }

    pub fn penalties(&self) -> &Arc<PenaltyTracker> {
        &self.penalties
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn eviction_interval(&self) -> Duration {
        self.eviction_interval
    }

    /// Start sweeping this engine's fallback counters and penalty history
    /// every [`LimiterEngine::eviction_interval`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_eviction(&self) -> EvictionHandle {
        EvictionScheduler::new(
            self.local.clone(),
            self.penalties.clone(),
            self.clock.clone(),
            self.eviction_interval,
        )
        .spawn()
    }

    /// Decide whether the request may proceed, consuming one point.
    ///
    /// Only an unregistered category is an error; backend trouble is
    /// absorbed by the breaker and the local fallback.
    pub async fn check(&self, category: Category, ctx: &RequestContext) -> Result<Decision> {
        let policy = self.registry.resolve(category)?;
        let key = RateLimitKey::derive(policy, ctx).to_string_key();
        let now = self.clock.now();
        let limit = self.penalties.effective_quota(&key, policy.quota, now);

        let spec = ConsumeSpec {
            limit,
            window: policy.window,
            block: policy.block,
            now,
        };

        trace!(key = %key, limit = limit, "Checking rate limit");
        let (outcome, served_by) = self.consume(&key, &spec).await;

        if !outcome.allowed {
            self.on_denied(policy, &key, &outcome, now);
        }

        let decision = Decision {
            category,
            key,
            allowed: outcome.allowed,
            limit,
            quota: policy.quota,
            window_secs: policy.window_secs(),
            remaining: outcome.remaining,
            reset_at: outcome.reset_at,
            retry_after_secs: seconds_until(outcome.reset_at, now),
            served_by,
        };

        counter!(
            "floodgate_decisions_total",
            "category" => category.as_str(),
            "outcome" => if decision.allowed { "allowed" } else { "denied" },
            "backend" => served_by.as_str()
        )
        .increment(1);

        if decision.allowed && policy.evenly_spread {
            self.pace(&decision, now).await;
        }

        Ok(decision)
    }

    /// Current state of the counter for a request, without consuming.
    pub async fn status(&self, category: Category, ctx: &RequestContext) -> Result<LimitStatus> {
        let policy = self.registry.resolve(category)?;
        let key = RateLimitKey::derive(policy, ctx).to_string_key();
        let now = self.clock.now();
        let limit = self.penalties.effective_quota(&key, policy.quota, now);

        let snapshot = self.peek(&key, now).await;
        let status = match snapshot {
            Some(CounterSnapshot { count, reset_at }) => LimitStatus {
                category,
                key,
                limit,
                remaining: limit.saturating_sub(count),
                reset_at: Some(reset_at),
                blocked: count > limit && reset_at > now,
            },
            None => LimitStatus {
                category,
                key,
                limit,
                remaining: limit,
                reset_at: None,
                blocked: false,
            },
        };

        Ok(status)
    }

    /// Clear the counter for a request on the active backend.
    pub async fn reset(&self, category: Category, ctx: &RequestContext) -> Result<()> {
        let policy = self.registry.resolve(category)?;
        let key = RateLimitKey::derive(policy, ctx).to_string_key();

        if let Some(store) = &self.distributed {
            match self.breaker.execute(|| store.reset(&key)).await {
                Ok(()) => {
                    debug!(key = %key, backend = "distributed", "Counter reset");
                    return Ok(());
                }
                Err(err) => self.log_fallback("reset", &key, &err),
            }
        }

        self.local.remove(&key);
        debug!(key = %key, backend = "local", "Counter reset");
        Ok(())
    }

    async fn consume(&self, key: &str, spec: &ConsumeSpec) -> (ConsumeOutcome, BackendKind) {
        if let Some(store) = &self.distributed {
            match self.breaker.execute(|| store.consume(key, spec)).await {
                Ok(outcome) => return (outcome, BackendKind::Distributed),
                Err(err) => self.log_fallback("consume", key, &err),
            }
        }

        (self.local.increment(key, spec), BackendKind::Local)
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Option<CounterSnapshot> {
        if let Some(store) = &self.distributed {
            match self.breaker.execute(|| store.peek(key, now)).await {
                Ok(snapshot) => return snapshot,
                Err(err) => self.log_fallback("peek", key, &err),
            }
        }

        self.local.snapshot(key, now)
    }

    fn log_fallback(&self, operation: &'static str, key: &str, err: &BreakerError) {
        match err {
            BreakerError::Open => {
                trace!(operation, key = %key, "Breaker open, using local counters");
            }
            BreakerError::Failed(cause) => {
                warn!(
                    operation,
                    key = %key,
                    error = %cause,
                    "Distributed counter store failed, using local counters"
                );
            }
        }
    }

    fn on_denied(&self, policy: &Policy, key: &str, outcome: &ConsumeOutcome, now: DateTime<Utc>) {
        self.penalties.record_violation(key, now);

        debug!(
            category = %policy.category,
            key = %key,
            count = outcome.count,
            reset_at = %outcome.reset_at,
            "Rate limit exceeded"
        );

        if let Some(threshold) = policy.alert_after_hits {
            if outcome.count > threshold {
                self.alerts
                    .raise(SecurityAlert::new(policy.category, key, outcome.count, now));
            }
        }
    }

    async fn pace(&self, decision: &Decision, now: DateTime<Utc>) {
        let until_reset = (decision.reset_at - now).to_std().unwrap_or_default();
        let delay = pacing_delay(decision.remaining, until_reset, self.max_pacing_delay);
        if !delay.is_zero() {
            trace!(
                key = %decision.key,
                delay_ms = delay.as_millis() as u64,
                "Pacing evenly spread call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Builder for [`LimiterEngine`].
pub struct EngineBuilder {
    registry: PolicyRegistry,
    distributed: Option<Arc<dyn CounterStore>>,
    local: Option<Arc<LocalCounterStore>>,
    breaker: Option<Arc<CircuitBreaker>>,
    penalties: Option<Arc<PenaltyTracker>>,
    alerts: Option<Arc<dyn AlertSink>>,
    clock: Option<Arc<dyn Clock>>,
    max_pacing_delay: Duration,
    eviction_interval: Duration,
}

impl EngineBuilder {
    fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry,
            distributed: None,
            local: None,
            breaker: None,
            penalties: None,
            alerts: None,
            clock: None,
            max_pacing_delay: DEFAULT_MAX_PACING_DELAY,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }

    /// Shared store used while the breaker is closed.
    pub fn distributed(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    pub fn local_store(mut self, store: Arc<LocalCounterStore>) -> Self {
        self.local = Some(store);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn penalties(mut self, penalties: Arc<PenaltyTracker>) -> Self {
        self.penalties = Some(penalties);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn max_pacing_delay(mut self, cap: Duration) -> Self {
        self.max_pacing_delay = cap;
        self
    }

    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn build(self) -> LimiterEngine {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(
                "distributed_counter_store",
                BreakerSettings::default(),
                clock.clone(),
            ))
        });

        LimiterEngine {
            registry: Arc::new(self.registry),
            distributed: self.distributed,
            local: self.local.unwrap_or_default(),
            breaker,
            penalties: self.penalties.unwrap_or_default(),
            alerts: self.alerts.unwrap_or_else(|| Arc::new(TracingAlertSink)),
            clock,
            max_pacing_delay: self.max_pacing_delay,
            eviction_interval: self.eviction_interval,
        }
    }
}
