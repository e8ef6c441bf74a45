//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use floodgate::clock::{Clock, ManualClock};
use floodgate::error::{FloodgateError, Result};
use floodgate::ratelimit::{
    BackendKind, BreakerSettings, CircuitBreaker, ConsumeOutcome, ConsumeSpec, CounterSnapshot,
    CounterStore, LimiterEngine, LocalCounterStore, PolicyRegistry, RequestContext,
};

/// How the scripted store answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Behave like a healthy shared store
    Healthy,
    /// Never answer
    Hang,
    /// Answer with a connection error
    Refuse,
}

/// A stand-in for Redis that counts calls and can be told to misbehave.
pub struct ScriptedStore {
    mode: Mutex<Mode>,
    calls: AtomicUsize,
    counters: LocalCounterStore,
}

impl ScriptedStore {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            counters: LocalCounterStore::new(),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            Mode::Healthy => Ok(()),
            Mode::Hang => std::future::pending().await,
            Mode::Refuse => Err(FloodgateError::BackendUnavailable(
                "connection refused".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CounterStore for ScriptedStore {
    async fn consume(&self, key: &str, spec: &ConsumeSpec) -> Result<ConsumeOutcome> {
        self.enter().await?;
        Ok(self.counters.increment(key, spec))
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterSnapshot>> {
        self.enter().await?;
        Ok(self.counters.snapshot(key, now))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.enter().await?;
        self.counters.remove(key);
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}

/// An engine wired to a scripted distributed store and a manual clock.
pub struct Harness {
    pub engine: LimiterEngine,
    pub store: Arc<ScriptedStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(registry: PolicyRegistry, mode: Mode, settings: BreakerSettings) -> Self {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = ScriptedStore::new(mode);
        let breaker = CircuitBreaker::new("test_store", settings, clock.clone());
        let engine = LimiterEngine::builder(registry)
            .clock(clock.clone())
            .distributed(store.clone())
            .breaker(Arc::new(breaker))
            .build();

        Self {
            engine,
            store,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn breaker_settings(threshold: u32, cooldown_secs: u64) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(cooldown_secs),
        call_timeout: Duration::from_secs(2),
    }
}

pub fn client(ip: &str) -> RequestContext {
    let ip: IpAddr = ip.parse().unwrap();
    RequestContext::from_origin(ip)
}
