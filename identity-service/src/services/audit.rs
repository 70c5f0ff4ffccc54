//! Audit emitters.
//!
//! Every mutating identity operation produces exactly one [`AuditEvent`].
//! Delivery is best effort from the caller's point of view: [`AuditRecorder`]
//! absorbs transport failures, counts them, and writes the event to the
//! structured log instead so it is never silently lost.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::config::AuditTransportConfig;
use crate::models::{AuditAction, AuditEvent};
use crate::services::error::ServiceError;
use crate::services::metrics::AUDIT_EMIT_FAILURES;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit transport connection failed: {0}")]
    Connect(String),

    #[error("audit publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("audit publish failed: {0}")]
    Publish(String),

    #[error("audit event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit emitter is closed")]
    Closed,
}

impl From<AuditError> for ServiceError {
    fn from(err: AuditError) -> Self {
        ServiceError::AuditTransportUnavailable(err.to_string())
    }
}

#[async_trait]
pub trait AuditEmitter: Send + Sync {
    /// Transport name for logs and metric labels.
    fn transport(&self) -> &'static str;

    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError>;

    async fn close(&self) -> Result<(), AuditError>;
}

/// Durable transport: appends each event to a Redis stream.
pub struct RedisStreamAuditEmitter {
    manager: ConnectionManager,
    stream_key: String,
    max_len: usize,
    publish_timeout: Duration,
    closed: AtomicBool,
}

impl RedisStreamAuditEmitter {
    pub async fn connect(config: &AuditTransportConfig) -> Result<Self, AuditError> {
        tracing::info!(stream = %config.stream_key, "Connecting audit stream");
        let client =
            Client::open(config.url.as_str()).map_err(|e| AuditError::Connect(e.to_string()))?;

        let connect = async {
            let mut manager = client.get_connection_manager().await?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut manager)
                .await?;
            Ok::<_, redis::RedisError>(manager)
        };

        let manager = match timeout(config.connect_timeout, connect).await {
            Ok(Ok(manager)) => manager,
            Ok(Err(e)) => return Err(AuditError::Connect(e.to_string())),
            Err(_) => {
                return Err(AuditError::Connect(format!(
                    "no response within {:?}",
                    config.connect_timeout
                )))
            }
        };

        Ok(Self {
            manager,
            stream_key: config.stream_key.clone(),
            max_len: config.max_len,
            publish_timeout: config.publish_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AuditEmitter for RedisStreamAuditEmitter {
    fn transport(&self) -> &'static str {
        "redis_stream"
    }

    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AuditError::Closed);
        }
        let payload = serde_json::to_string(event)?;
        let mut conn = self.manager.clone();

        let mut xadd = redis::cmd("XADD");
        xadd.arg(&self.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("event_id")
            .arg(event.event_id.to_string())
            .arg("org_id")
            .arg(event.org_id.to_string())
            .arg("action")
            .arg(event.action.as_str())
            .arg("hash")
            .arg(&event.hash)
            .arg("payload")
            .arg(&payload);
        let publish = xadd.query_async::<_, String>(&mut conn);

        match timeout(self.publish_timeout, publish).await {
            Ok(Ok(_id)) => Ok(()),
            Ok(Err(e)) => Err(AuditError::Publish(format!("XADD failed: {}", e))),
            Err(_) => Err(AuditError::Timeout(self.publish_timeout)),
        }
    }

    async fn close(&self) -> Result<(), AuditError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(stream = %self.stream_key, "Closing audit stream");
        }
        Ok(())
    }
}

/// Writes each event as a structured log record on the `audit` target.
#[derive(Debug, Default, Clone)]
pub struct LogAuditEmitter;

#[async_trait]
impl AuditEmitter for LogAuditEmitter {
    fn transport(&self) -> &'static str {
        "log"
    }

    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(
            target: "audit",
            event_id = %event.event_id,
            org_id = %event.org_id,
            action = %event.action,
            actor_type = event.actor_type.as_str(),
            actor_id = ?event.actor_id,
            target_type = event.target_type.as_str(),
            target_id = ?event.target_id,
            hash = %event.hash,
            payload = %payload,
            "audit event"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopAuditEmitter;

#[async_trait]
impl AuditEmitter for NoopAuditEmitter {
    fn transport(&self) -> &'static str {
        "noop"
    }

    async fn emit(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Captures events in memory for assertions.
#[derive(Default)]
pub struct MemoryAuditEmitter {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent emit fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.events()
            .iter()
            .filter(|event| event.action == action)
            .count()
    }
}

#[async_trait]
impl AuditEmitter for MemoryAuditEmitter {
    fn transport(&self) -> &'static str {
        "memory"
    }

    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Publish("memory emitter switched off".to_string()));
        }
        self.events
            .lock()
            .map_err(|e| AuditError::Publish(format!("memory emitter mutex poisoned: {}", e)))?
            .push(event.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Pick the durable stream when one is configured and reachable, otherwise
/// the structured-log emitter.
pub async fn select_audit_emitter(config: Option<&AuditTransportConfig>) -> Arc<dyn AuditEmitter> {
    let Some(config) = config else {
        tracing::warn!("No audit stream configured; audit events go to the structured log");
        return Arc::new(LogAuditEmitter);
    };

    match RedisStreamAuditEmitter::connect(config).await {
        Ok(emitter) => {
            tracing::info!(stream = %config.stream_key, "Audit stream ready");
            Arc::new(emitter)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Audit stream unavailable; falling back to the structured log"
            );
            Arc::new(LogAuditEmitter)
        }
    }
}

/// Service-facing handle that never fails the caller.
#[derive(Clone)]
pub struct AuditRecorder {
    emitter: Arc<dyn AuditEmitter>,
}

impl AuditRecorder {
    pub fn new(emitter: Arc<dyn AuditEmitter>) -> Self {
        Self { emitter }
    }

    pub fn emitter(&self) -> &Arc<dyn AuditEmitter> {
        &self.emitter
    }

    /// Deliver one event. On transport failure the event is logged instead.
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.emitter.emit(&event).await {
            let transport = self.emitter.transport();
            AUDIT_EMIT_FAILURES.with_label_values(&[transport]).inc();
            tracing::error!(
                error = %e,
                transport,
                event_id = %event.event_id,
                action = %event.action,
                "Audit delivery failed; recording to log"
            );
            let _ = LogAuditEmitter.emit(&event).await;
        }
    }
}
