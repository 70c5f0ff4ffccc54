//! Failed-authentication lockout, kept entirely in the cache tier.
//!
//! Without a cache the tracker is disabled: attempts are never counted and
//! nobody is ever locked. That is logged once at construction and counted on
//! every check.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::LockoutConfig;
use crate::services::cache::{lockout_attempts_key, lockout_until_key, CacheBackend, CacheError};
use crate::services::metrics::{LOCKOUTS_TRIGGERED, LOCKOUT_DISABLED_CHECKS};

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: i64,
    /// Set when this failure crossed the threshold.
    pub locked_until: Option<DateTime<Utc>>,
}

impl FailureOutcome {
    pub fn triggered_lockout(&self) -> bool {
        self.locked_until.is_some()
    }
}

#[derive(Clone)]
pub struct LockoutTracker {
    cache: Arc<dyn CacheBackend>,
    config: LockoutConfig,
}

impl LockoutTracker {
    pub fn new(cache: Arc<dyn CacheBackend>, config: LockoutConfig) -> Self {
        if cache.is_enabled() {
            tracing::info!(
                max_attempts = config.max_attempts,
                window_secs = config.window.as_secs(),
                duration_secs = config.duration.as_secs(),
                backend = cache.name(),
                "Lockout tracker enabled"
            );
        } else {
            tracing::warn!("No cache configured; account lockout is disabled");
        }
        Self { cache, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Count a failure. Reaching the threshold starts a lockout and resets
    /// the counter for the next cycle.
    pub async fn record_failure(&self, identifier: &str) -> Result<FailureOutcome, CacheError> {
        if !self.is_enabled() {
            LOCKOUT_DISABLED_CHECKS.inc();
            return Ok(FailureOutcome {
                attempts: 0,
                locked_until: None,
            });
        }

        let attempts = self
            .cache
            .incr_with_expiry(&lockout_attempts_key(identifier), self.config.window)
            .await?;

        if attempts < i64::from(self.config.max_attempts) {
            return Ok(FailureOutcome {
                attempts,
                locked_until: None,
            });
        }

        let until = Utc::now()
            + chrono::Duration::from_std(self.config.duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        self.cache
            .set_ex(
                &lockout_until_key(identifier),
                &until.to_rfc3339(),
                self.config.duration,
            )
            .await?;
        self.cache.delete(&lockout_attempts_key(identifier)).await?;

        LOCKOUTS_TRIGGERED.inc();
        tracing::warn!(identifier, attempts, locked_until = %until, "Account locked out");

        Ok(FailureOutcome {
            attempts,
            locked_until: Some(until),
        })
    }

    /// When locked, the instant the lockout ends.
    pub async fn locked_until(&self, identifier: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        if !self.is_enabled() {
            LOCKOUT_DISABLED_CHECKS.inc();
            return Ok(None);
        }

        let raw = self.cache.get(&lockout_until_key(identifier)).await?;
        let now = Utc::now();
        Ok(raw
            .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
            .map(|until| until.with_timezone(&Utc))
            .filter(|until| *until > now))
    }

    pub async fn is_locked(&self, identifier: &str) -> Result<bool, CacheError> {
        Ok(self.locked_until(identifier).await?.is_some())
    }

    pub async fn failed_attempts(&self, identifier: &str) -> Result<i64, CacheError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let raw = self.cache.get(&lockout_attempts_key(identifier)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Forget failures and any active lockout.
    pub async fn clear(&self, identifier: &str) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.cache.delete(&lockout_attempts_key(identifier)).await?;
        self.cache.delete(&lockout_until_key(identifier)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::{MemoryCache, NoopCache};
    use std::time::Duration;

    fn tracker(max_attempts: u32) -> LockoutTracker {
        LockoutTracker::new(
            Arc::new(MemoryCache::new()),
            LockoutConfig {
                max_attempts,
                window: Duration::from_secs(60),
                duration: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn locks_on_reaching_threshold() {
        let tracker = tracker(3);
        let id = "user-1";

        assert!(!tracker.record_failure(id).await.unwrap().triggered_lockout());
        assert!(!tracker.record_failure(id).await.unwrap().triggered_lockout());
        assert_eq!(tracker.failed_attempts(id).await.unwrap(), 2);
        assert!(!tracker.is_locked(id).await.unwrap());

        let third = tracker.record_failure(id).await.unwrap();
        assert!(third.triggered_lockout());
        assert_eq!(third.attempts, 3);
        assert!(tracker.is_locked(id).await.unwrap());
    }

    #[tokio::test]
    async fn clear_unlocks() {
        let tracker = tracker(1);
        tracker.record_failure("a").await.unwrap();
        assert!(tracker.is_locked("a").await.unwrap());

        tracker.clear("a").await.unwrap();
        assert!(!tracker.is_locked("a").await.unwrap());
        assert_eq!(tracker.failed_attempts("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let tracker = tracker(1);
        tracker.record_failure("a").await.unwrap();
        assert!(!tracker.is_locked("b").await.unwrap());
    }

    #[tokio::test]
    async fn disabled_without_cache() {
        let tracker = LockoutTracker::new(Arc::new(NoopCache), LockoutConfig::default());
        assert!(!tracker.is_enabled());
        for _ in 0..10 {
            assert!(!tracker.record_failure("x").await.unwrap().triggered_lockout());
        }
        assert!(!tracker.is_locked("x").await.unwrap());
    }
}
