//! Distributed counter store backed by Redis.
//!
//! All serving processes share the same counters. Increment, expiry and
//! block arming happen in a single Lua script so that concurrent callers on
//! any instance see a consistent count.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::backend::{BackendKind, CounterStore};
use super::counter::{ConsumeOutcome, ConsumeSpec, CounterSnapshot};
use crate::error::{FloodgateError, Result};

/// Default prefix applied to every counter key.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate:";

/// Atomic increment with expiry.
///
/// KEYS[1] counter hash with fields `count` and `blocked`
/// ARGV[1] window in ms, ARGV[2] block in ms, ARGV[3] limit
///
/// Returns `{count, ttl_ms}`. The first hit over the limit arms the block
/// once, stretching the TTL so the record lives until `window_start + block`
/// when that is longer. The limit may shrink mid-window under penalties, so
/// arming keys off the `blocked` field rather than an exact count.
const CONSUME_SCRIPT: &str = r#"
local window_ms = tonumber(ARGV[1])
local block_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], window_ms)
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], window_ms)
    ttl = window_ms
end

if count > limit and block_ms > window_ms and redis.call('HSETNX', KEYS[1], 'blocked', 1) == 1 then
    local blocked_ttl = block_ms - (window_ms - ttl)
    if blocked_ttl > ttl then
        redis.call('PEXPIRE', KEYS[1], blocked_ttl)
        ttl = blocked_ttl
    end
end

return {count, ttl}
"#;

/// Counter store backed by a Redis-compatible server.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store for the given Redis URL.
    ///
    /// The connection is established lazily on first use; a failed attempt
    /// is retried on the next call.
    pub fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FloodgateError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: key_prefix.into(),
            script: Script::new(CONSUME_SCRIPT),
        })
    }

    /// The full Redis key for a counter key.
    pub fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(classify)?;
                info!("Connected to distributed counter store");
                Ok::<_, FloodgateError>(manager)
            })
            .await?;

        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn consume(&self, key: &str, spec: &ConsumeSpec) -> Result<ConsumeOutcome> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection().await?;

        let reply: Vec<i64> = self
            .script
            .key(&redis_key)
            .arg(millis(spec.window))
            .arg(millis(spec.block))
            .arg(spec.limit)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        let (count, ttl_ms) = parse_consume_reply(&reply)?;
        trace!(key = %redis_key, count = count, ttl_ms = ttl_ms, "Distributed consume");

        Ok(ConsumeOutcome {
            allowed: count <= spec.limit,
            count,
            remaining: spec.limit.saturating_sub(count),
            reset_at: spec.now + TimeDelta::milliseconds(ttl_ms),
        })
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterSnapshot>> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection().await?;

        let (count, ttl_ms): (Option<i64>, i64) = redis::pipe()
            .cmd("HGET")
            .arg(&redis_key)
            .arg("count")
            .cmd("PTTL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        match count {
            Some(count) if count >= 0 && ttl_ms > 0 => Ok(Some(CounterSnapshot {
                count: count as u64,
                reset_at: now + TimeDelta::milliseconds(ttl_ms),
            })),
            Some(count) if count < 0 => Err(FloodgateError::BackendInternal(format!(
                "negative counter value {} for {}",
                count, redis_key
            ))),
            _ => Ok(None),
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection().await?;

        let deleted: i64 = redis::cmd("DEL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        debug!(key = %redis_key, deleted = deleted, "Reset distributed counter");
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}

fn millis(d: std::time::Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Validate the `{count, ttl_ms}` reply of the consume script.
fn parse_consume_reply(reply: &[i64]) -> Result<(u64, i64)> {
    match reply {
        [count, ttl_ms] if *count >= 1 && *ttl_ms >= 0 => Ok((*count as u64, *ttl_ms)),
        other => Err(FloodgateError::BackendInternal(format!(
            "unexpected consume reply: {:?}",
            other
        ))),
    }
}

/// Map a Redis error onto the backend failure taxonomy.
fn classify(err: RedisError) -> FloodgateError {
    let connectivity = err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || matches!(err.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain);

    if connectivity {
        FloodgateError::BackendUnavailable(err.to_string())
    } else {
        FloodgateError::BackendInternal(err.to_string())
    }
}
