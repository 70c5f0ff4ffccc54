//! Configuration module for identity-service.
//!
//! Everything is read from environment variables (after `.env` is loaded by
//! the core config). Optional dependencies are modelled as `Option`s: an
//! unset `CACHE_ADDR` selects the no-op cache and an unset
//! `AUDIT_STREAM_URL` selects the structured-log audit emitter.

use secrecy::SecretString;
use service_core::config::{self as core_config, Environment};
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for readiness checks so they fail before request deadlines do.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub cache: Option<CacheConfig>,
    pub lockout: LockoutConfig,
    pub audit: Option<AuditTransportConfig>,
    pub credentials: CredentialConfig,
    pub background: BackgroundConfig,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Applied to every transaction via `SET LOCAL`-equivalent `set_config`.
    pub statement_timeout: Duration,
    pub run_migrations: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// `redis://` connection URL.
    pub url: String,
    /// Budget for connecting and the first PING at startup.
    pub connect_timeout: Duration,
    /// Budget for each cache operation on the request path.
    pub op_timeout: Duration,
}

impl CacheConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(2),
            op_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockoutConfig {
    pub max_attempts: u32,
    pub window: Duration,
    pub duration: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(15 * 60),
            duration: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditTransportConfig {
    pub url: String,
    pub stream_key: String,
    /// Approximate MAXLEN applied on every XADD.
    pub max_len: usize,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Base64-encoded 32-byte AES-256-GCM key for sealing issued secrets.
    pub envelope_key: Option<SecretString>,
    /// Cache TTL for revocations of keys without an expiry.
    pub revocation_ttl_ceiling: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            envelope_key: None,
            revocation_ttl_ceiling: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    pub queue_capacity: usize,
    pub job_timeout: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            job_timeout: Duration::from_secs(5),
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match var("ENVIRONMENT") {
            Some(raw) => raw.parse::<Environment>()?,
            None => Environment::Development,
        };

        let database = DatabaseConfig {
            url: var("DATABASE_URL").ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
            })?,
            max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
            min_connections: parse_or(&var, "DATABASE_MIN_CONNECTIONS", 1)?,
            acquire_timeout: Duration::from_secs(parse_or(
                &var,
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                5,
            )?),
            statement_timeout: Duration::from_millis(parse_or(
                &var,
                "DATABASE_STATEMENT_TIMEOUT_MS",
                5_000,
            )?),
            run_migrations: parse_or(&var, "DATABASE_RUN_MIGRATIONS", true)?,
        };

        let cache = match var("CACHE_ADDR") {
            Some(addr) => Some(CacheConfig {
                url: cache_url(
                    &addr,
                    var("CACHE_PASSWORD").as_deref(),
                    parse_or(&var, "CACHE_DB", 0u32)?,
                ),
                connect_timeout: Duration::from_millis(parse_or(
                    &var,
                    "CACHE_CONNECT_TIMEOUT_MS",
                    2_000,
                )?),
                op_timeout: Duration::from_millis(parse_or(&var, "CACHE_OP_TIMEOUT_MS", 250)?),
            }),
            None => None,
        };

        let lockout = LockoutConfig {
            max_attempts: parse_or(&var, "LOCKOUT_MAX_ATTEMPTS", 5)?,
            window: scaled_secs(
                "LOCKOUT_WINDOW_MINUTES",
                parse_or(&var, "LOCKOUT_WINDOW_MINUTES", 15)?,
                60,
            )?,
            duration: scaled_secs(
                "LOCKOUT_DURATION_MINUTES",
                parse_or(&var, "LOCKOUT_DURATION_MINUTES", 15)?,
                60,
            )?,
        };

        let audit = match var("AUDIT_STREAM_URL") {
            Some(url) => Some(AuditTransportConfig {
                url,
                stream_key: var("AUDIT_STREAM_KEY")
                    .unwrap_or_else(|| "audit.identity".to_string()),
                max_len: parse_or(&var, "AUDIT_STREAM_MAX_LEN", 100_000)?,
                connect_timeout: Duration::from_secs(2),
                publish_timeout: Duration::from_millis(parse_or(
                    &var,
                    "AUDIT_PUBLISH_TIMEOUT_MS",
                    500,
                )?),
            }),
            None => None,
        };

        let credentials = CredentialConfig {
            envelope_key: var("SECRET_ENVELOPE_KEY").map(SecretString::new),
            revocation_ttl_ceiling: scaled_secs(
                "REVOCATION_TTL_CEILING_DAYS",
                parse_or(&var, "REVOCATION_TTL_CEILING_DAYS", 365)?,
                24 * 60 * 60,
            )?,
        };

        let background = BackgroundConfig {
            queue_capacity: parse_or(&var, "BACKGROUND_QUEUE_CAPACITY", 256)?,
            job_timeout: Duration::from_secs(parse_or(&var, "BACKGROUND_JOB_TIMEOUT_SECS", 5)?),
        };

        let probe_timeout =
            Duration::from_millis(parse_or(&var, "PROBE_TIMEOUT_MS", 2_000)?).min(MAX_PROBE_TIMEOUT);

        let config = Self {
            common,
            environment,
            service_name: var("SERVICE_NAME").unwrap_or_else(|| "identity-service".to_string()),
            service_version: var("SERVICE_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
            database,
            cache,
            lockout,
            audit,
            credentials,
            background,
            probe_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MAX_CONNECTIONS must be positive and not below DATABASE_MIN_CONNECTIONS"
            )));
        }

        if self.lockout.max_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCKOUT_MAX_ATTEMPTS must be positive"
            )));
        }

        if self.lockout.window.is_zero() || self.lockout.duration.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCKOUT_WINDOW_MINUTES and LOCKOUT_DURATION_MINUTES must be positive"
            )));
        }

        if self.background.queue_capacity == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BACKGROUND_QUEUE_CAPACITY must be positive"
            )));
        }

        if self.credentials.revocation_ttl_ceiling.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REVOCATION_TTL_CEILING_DAYS must be positive"
            )));
        }

        // The passthrough envelope is development-only.
        if self.environment.is_production() && self.credentials.envelope_key.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SECRET_ENVELOPE_KEY is required in production"
            )));
        }

        Ok(())
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        None => Ok(default),
    }
}

/// `value` units of `unit_secs` seconds, rejecting values that overflow.
fn scaled_secs(key: &str, value: u64, unit_secs: u64) -> Result<Duration, AppError> {
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("{} is out of range: {}", key, value)))
}

/// Accepts either a full `redis://` / `rediss://` URL or a bare `host:port`.
fn cache_url(addr: &str, password: Option<&str>, db: u32) -> String {
    if addr.contains("://") {
        return addr.to_string();
    }
    match password {
        Some(pw) => format!("redis://:{}@{}/{}", pw, addr, db),
        None => format!("redis://{}/{}", addr, db),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<IdentityConfig, AppError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IdentityConfig::from_lookup(core_config::Config::default(), |key| map.get(key).cloned())
    }

    #[test]
    fn minimal_environment_uses_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/identity")]).unwrap();
        assert!(config.cache.is_none());
        assert!(config.audit.is_none());
        assert_eq!(config.lockout.max_attempts, 5);
        assert_eq!(config.lockout.window, Duration::from_secs(900));
        assert_eq!(config.probe_timeout, MAX_PROBE_TIMEOUT);
        assert_eq!(config.environment, Environment::Development);
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        for key in ["REVOCATION_TTL_CEILING_DAYS", "LOCKOUT_WINDOW_MINUTES"] {
            let result = load(&[
                ("DATABASE_URL", "postgres://localhost/identity"),
                (key, "18446744073709551615"),
            ]);
            assert!(
                matches!(result, Err(AppError::ConfigError(_))),
                "{} should be rejected",
                key
            );
        }
    }

    #[test]
    fn database_url_is_required() {
        assert!(load(&[("CACHE_ADDR", "localhost:6379")]).is_err());
    }

    #[test]
    fn bare_cache_address_becomes_redis_url() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("CACHE_ADDR", "cache.internal:6379"),
            ("CACHE_PASSWORD", "s3cret"),
            ("CACHE_DB", "2"),
        ])
        .unwrap();
        let cache = config.cache.unwrap();
        assert_eq!(cache.url, "redis://:s3cret@cache.internal:6379/2");
        assert_eq!(cache.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn empty_cache_address_means_unconfigured() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("CACHE_ADDR", "  "),
        ])
        .unwrap();
        assert!(config.cache.is_none());
    }

    #[test]
    fn production_requires_envelope_key() {
        let result = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("ENVIRONMENT", "production"),
        ]);
        assert!(result.is_err());

        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("ENVIRONMENT", "production"),
            (
                "SECRET_ENVELOPE_KEY",
                "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
            ),
        ]);
        assert!(config.is_ok());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let result = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("LOCKOUT_MAX_ATTEMPTS", "five"),
        ]);
        assert!(result.is_err());

        let result = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("LOCKOUT_MAX_ATTEMPTS", "0"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn probe_timeout_is_clamped() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/identity"),
            ("PROBE_TIMEOUT_MS", "10000"),
        ])
        .unwrap();
        assert_eq!(config.probe_timeout, MAX_PROBE_TIMEOUT);
    }
}
