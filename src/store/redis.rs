//! Redis-backed counter store.
//!
//! Every check runs as a single Lua script, so concurrent requests for one
//! subject from any number of processes are serialized by Redis itself. Each
//! window is a sorted set of admitted request timestamps and the bucket is a
//! hash of `tokens` and `ts`. All keys of one subject share a hash tag so the
//! script also works against Redis Cluster.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CounterStore, StoreError};
use crate::ratelimit::{GateOutcome, RateLimitPolicy, RateLimitSubject};

/// KEYS: one sorted set per window (shortest first), then the bucket hash.
/// ARGV: cost, burst, refill rate, member, bucket ttl, then `span, max` per
/// window. Time comes from the server so every process agrees on "now".
const CHECK_AND_CONSUME: &str = r#"
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

local cost = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local member = ARGV[4]
local bucket_ttl = tonumber(ARGV[5])
local epsilon = 0.000001

local window_count = #KEYS - 1
local bucket_key = KEYS[#KEYS]

local windows = {}
local spans = {}
local window_exceeded = false

for i = 1, window_count do
  local key = KEYS[i]
  local span = tonumber(ARGV[4 + 2 * i])
  local max = tonumber(ARGV[5 + 2 * i])
  spans[i] = span

  redis.call('ZREMRANGEBYSCORE', key, '-inf', now - span)
  local count = redis.call('ZCARD', key)
  local free_at = now
  if count >= max then
    window_exceeded = true
    local idx = count - max
    local entry = redis.call('ZRANGE', key, idx, idx, 'WITHSCORES')
    free_at = tonumber(entry[2]) + span
  end
  windows[i] = { count = count, reset_at = 0, free_at = free_at }
end

local bucket = redis.call('HMGET', bucket_key, 'tokens', 'ts')
local tokens = tonumber(bucket[1])
local last = tonumber(bucket[2])
if tokens == nil or last == nil then
  tokens = burst
  last = now
end
tokens = math.min(burst, tokens + math.max(0, now - last) * rate / 1000)

local bucket_free_at = now
if tokens + epsilon < cost then
  bucket_free_at = now + math.ceil((cost - tokens) * 1000 / rate)
end

local verdict
if window_exceeded then
  verdict = 'window_exceeded'
elseif tokens + epsilon < cost then
  verdict = 'burst_exceeded'
else
  verdict = 'admitted'
  tokens = math.max(0, tokens - cost)
  redis.call('HSET', bucket_key, 'tokens', tostring(tokens), 'ts', now)
  redis.call('PEXPIRE', bucket_key, bucket_ttl)
  for i = 1, window_count do
    redis.call('ZADD', KEYS[i], now, member)
    redis.call('PEXPIRE', KEYS[i], spans[i])
    windows[i].count = windows[i].count + 1
  end
end

for i = 1, window_count do
  local oldest = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
  if oldest[2] then
    windows[i].reset_at = tonumber(oldest[2]) + spans[i]
  else
    windows[i].reset_at = now + spans[i]
  end
end

return cjson.encode({
  now = now,
  verdict = verdict,
  windows = windows,
  tokens = tokens,
  bucket_free_at = bucket_free_at,
})
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Prepended to every key.
    pub key_prefix: String,
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "hivegate".to_string(),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

/// Counter store backed by Redis.
///
/// The connection is established lazily, so a process can start while Redis
/// is down and begin using it once it answers.
pub struct RedisStore {
    client: Client,
    manager: RwLock<Option<ConnectionManager>>,
    script: Script,
    key_prefix: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Validate the URL and build the store without connecting.
    pub fn new(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            manager: RwLock::new(None),
            script: Script::new(CHECK_AND_CONSUME),
            key_prefix: config.key_prefix,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Build the store and try to connect right away.
    ///
    /// A failed first connection is logged, not returned; the store retries
    /// on its next use.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        match store.connection().await {
            Ok(_) => info!(prefix = %store.key_prefix, "Connected to redis counter store"),
            Err(e) => warn!(error = %e, "Redis counter store not reachable at startup"),
        }
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(manager.clone());
        }

        let mut slot = self.manager.write().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }

        let manager = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))?
        .map_err(map_redis_error)?;

        debug!("Established redis connection manager");
        *slot = Some(manager.clone());
        Ok(manager)
    }

    fn subject_prefix(&self, subject: &RateLimitSubject) -> String {
        format!("{}:{{{}}}", self.key_prefix, subject.to_string_key())
    }

    /// Keys the script touches for `subject`, in KEYS order.
    fn keys(&self, subject: &RateLimitSubject, policy: &RateLimitPolicy) -> Vec<String> {
        let prefix = self.subject_prefix(subject);
        let mut keys: Vec<String> = policy
            .window_limits()
            .iter()
            .map(|limit| format!("{}:w:{}", prefix, limit.window.as_millis()))
            .collect();
        keys.push(format!("{}:bucket", prefix));
        keys
    }
}

/// Script arguments in ARGV order.
fn script_args(policy: &RateLimitPolicy, cost: f64, member: &str) -> Vec<String> {
    // An idle bucket is full again after this long, so an absent hash is
    // indistinguishable from an expired one.
    let bucket_ttl = policy.full_refill_millis().saturating_add(1_000);

    let mut args = vec![
        cost.to_string(),
        policy.burst_size().to_string(),
        policy.refill_rate().to_string(),
        member.to_string(),
        bucket_ttl.to_string(),
    ];
    for limit in policy.window_limits() {
        args.push(limit.window.as_millis().to_string());
        args.push(limit.max_requests.to_string());
    }
    args
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn parse_outcome(raw: &str, policy: &RateLimitPolicy) -> Result<GateOutcome, StoreError> {
    let outcome: GateOutcome = serde_json::from_str(raw)
        .map_err(|e| StoreError::Protocol(format!("malformed script result: {}", e)))?;

    if outcome.windows.len() != policy.window_limits().len() {
        return Err(StoreError::Protocol(format!(
            "script reported {} windows, policy has {}",
            outcome.windows.len(),
            policy.window_limits().len()
        )));
    }
    Ok(outcome)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn atomic_check_and_consume(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
        cost: f64,
    ) -> Result<GateOutcome, StoreError> {
        let mut conn = self.connection().await?;

        let member = Uuid::new_v4().to_string();
        let mut invocation = self.script.prepare_invoke();
        for key in self.keys(subject, policy) {
            invocation.key(key);
        }
        for arg in script_args(policy, cost, &member) {
            invocation.arg(arg);
        }

        let raw: String = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        parse_outcome(&raw, policy)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply: {}", reply)))
        }
    }

    async fn ensure_connected(&self) -> Result<(), StoreError> {
        self.connection().await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
