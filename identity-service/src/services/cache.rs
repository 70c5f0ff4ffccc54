//! Revocation cache: a fast, non-authoritative key/value tier in front of
//! the tenant store.
//!
//! Every operation is bounded by a per-operation timeout. Callers treat any
//! `CacheError` as "cache unavailable" and fall back to PostgreSQL; the cache
//! never decides correctness on its own except for positive revocation hits.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::services::error::ServiceError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection failed: {0}")]
    Connect(String),

    #[error("cache operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("cache operation `{op}` failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: redis::RedisError,
    },

    #[error("cache is closed")]
    Closed,

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        ServiceError::CacheUnavailable(err.to_string())
    }
}

pub fn revoked_api_key_key(fingerprint: &str) -> String {
    format!("api_key:revoked:{}", fingerprint)
}

pub fn revoked_session_key(session_id: Uuid) -> String {
    format!("session:revoked:{}", session_id)
}

pub fn lockout_attempts_key(identifier: &str) -> String {
    format!("lockout:attempts:{}", identifier)
}

pub fn lockout_until_key(identifier: &str) -> String {
    format!("lockout:until:{}", identifier)
}

/// Redis expiries are whole seconds; never round a live entry down to zero.
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// False for the no-op backend: callers that need a real counter
    /// (lockout) use this to decide whether they are active at all.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Increment a counter and (re)arm its expiry in one atomic step.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
    async fn close(&self) -> Result<(), CacheError>;
}

/// Redis-backed cache using a reconnecting `ConnectionManager`.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    op_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl RedisCache {
    /// Connect and PING within `config.connect_timeout`.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        tracing::info!(
            timeout_ms = config.connect_timeout.as_millis() as u64,
            "Connecting to Redis cache"
        );
        let client =
            Client::open(config.url.as_str()).map_err(|e| CacheError::Connect(e.to_string()))?;

        let connect = async {
            let mut manager = client.get_connection_manager().await?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut manager)
                .await?;
            Ok::<_, redis::RedisError>(manager)
        };

        let manager = match timeout(config.connect_timeout, connect).await {
            Ok(Ok(manager)) => manager,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to connect to Redis cache");
                return Err(CacheError::Connect(e.to_string()));
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = config.connect_timeout.as_millis() as u64,
                    "Timed out connecting to Redis cache"
                );
                return Err(CacheError::Connect(format!(
                    "no response within {:?}",
                    config.connect_timeout
                )));
            }
        };

        tracing::info!("Successfully connected to Redis cache");
        Ok(Self {
            manager,
            op_timeout: config.op_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CacheError::Backend { op, source }),
            Err(_) => Err(CacheError::Timeout {
                op,
                after: self.op_timeout,
            }),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        self.run(
            "set_ex",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        self.run(
            "get",
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn),
        )
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        self.run(
            "exists",
            redis::cmd("EXISTS")
                .arg(key)
                .query_async::<_, bool>(&mut conn),
        )
        .await
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, CacheError> {
        let mut conn = self.manager.clone();
        let (count,) = self
            .run(
                "incr_with_expiry",
                redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(key)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs(window))
                    .ignore()
                    .query_async::<_, (i64,)>(&mut conn),
            )
            .await?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        self.run(
            "delete",
            redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        self.run(
            "ping",
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map(|_| ())
    }

    async fn close(&self) -> Result<(), CacheError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Closing Redis cache");
        }
        Ok(())
    }
}

/// Stand-in when no cache is configured. Reads miss, writes succeed silently.
#[derive(Debug, Default, Clone)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn incr_with_expiry(&self, _key: &str, _window: Duration) -> Result<i64, CacheError> {
        Ok(0)
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// In-process cache with expiry, for tests. Can be switched into an
/// "unavailable" state to exercise degradation paths.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    /// Remaining lifetime of a live entry.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .get(key)
            .and_then(|(_, expires)| expires.checked_duration_since(now)))
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache switched off".to_string()));
        }
        self.entries
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("memory cache mutex poisoned: {}", e)))
    }

    fn live_value(
        entries: &mut HashMap<String, (String, Instant)>,
        key: &str,
    ) -> Option<String> {
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.lock()?
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(Self::live_value(&mut *self.lock()?, key))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(Self::live_value(&mut *self.lock()?, key).is_some())
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, CacheError> {
        let mut entries = self.lock()?;
        let current = Self::live_value(&mut entries, key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(key.to_string(), (next.to_string(), Instant::now() + window));
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.lock().map(|_| ())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(revoked_api_key_key("abc"), "api_key:revoked:abc");
        assert_eq!(lockout_attempts_key("u1"), "lockout:attempts:u1");
        assert_eq!(lockout_until_key("u1"), "lockout:until:u1");
        let id = Uuid::nil();
        assert_eq!(
            revoked_session_key(id),
            "session:revoked:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache
            .set_ex("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(cache.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_counts_within_window() {
        let cache = MemoryCache::new();
        let window = Duration::from_secs(60);
        assert_eq!(cache.incr_with_expiry("c", window).await.unwrap(), 1);
        assert_eq!(cache.incr_with_expiry("c", window).await.unwrap(), 2);
        cache.delete("c").await.unwrap();
        assert_eq!(cache.incr_with_expiry("c", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_memory_cache_errors() {
        let cache = MemoryCache::new();
        cache.set_unavailable(true);
        assert!(cache.ping().await.is_err());
        assert!(cache.get("k").await.is_err());
        cache.set_unavailable(false);
        assert!(cache.ping().await.is_ok());
    }

    #[tokio::test]
    async fn noop_cache_reports_disabled_and_misses() {
        let cache = NoopCache;
        assert!(!cache.is_enabled());
        cache
            .set_ex("k", "v", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_redis_fails_within_connect_timeout() {
        let mut config = CacheConfig::new("redis://127.0.0.1:1/0");
        config.connect_timeout = Duration::from_millis(500);
        let started = Instant::now();
        let result = RedisCache::connect(&config).await;
        assert!(matches!(result, Err(CacheError::Connect(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
