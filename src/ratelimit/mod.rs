//! Rate limiting logic and state management.

mod backend;
mod breaker;
pub mod counter;
mod decision;
mod distributed;
mod eviction;
mod identity;
mod limiter;
mod local;
mod penalty;
mod policy;

pub use backend::{BackendKind, CounterStore};
pub use breaker::{BreakerError, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use counter::{ConsumeOutcome, ConsumeSpec, CounterRecord, CounterSnapshot};
pub use decision::{Decision, DecisionHook, LimitStatus, TracingDecisionHook};
pub use distributed::{RedisCounterStore, DEFAULT_KEY_PREFIX};
pub use eviction::{EvictionHandle, EvictionScheduler, SweepReport, DEFAULT_EVICTION_INTERVAL};
pub use identity::{RateLimitKey, RequestContext, UNKNOWN_ORIGIN};
pub use limiter::{pacing_delay, EngineBuilder, LimiterEngine, DEFAULT_MAX_PACING_DELAY};
pub use local::LocalCounterStore;
pub use penalty::{penalized_quota, PenaltyTracker, DEFAULT_MAX_TRACKED, DEFAULT_PENALTY_WINDOW};
pub use policy::{Category, KeyStrategy, PoliciesConfig, Policy, PolicyOverride, PolicyRegistry};
