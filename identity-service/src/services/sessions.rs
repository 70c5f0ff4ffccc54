//! Refresh-token sessions and failed-login lockout.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{
    Actor, AuditAction, AuditEvent, CreateSession, RevocationStatus, Session, TargetType, User,
    UpdateUserStatus,
};
use crate::services::audit::AuditRecorder;
use crate::services::cache::{revoked_session_key, CacheBackend};
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::lockout::{FailureOutcome, LockoutTracker};
use crate::services::metrics::CACHE_DEGRADED;

/// Hex SHA-256 of a refresh token. Only this form is stored.
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub refresh_token: SecretString,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub mfa_verified_at: Option<DateTime<Utc>>,
    /// Chosen by the authentication layer; must be in the future.
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionService {
    db: Database,
    cache: Arc<dyn CacheBackend>,
    lockout: LockoutTracker,
    audit: AuditRecorder,
}

impl SessionService {
    pub fn new(
        db: Database,
        cache: Arc<dyn CacheBackend>,
        lockout: LockoutTracker,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            db,
            cache,
            lockout,
            audit,
        }
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    // ==================== Sessions ====================

    #[instrument(skip(self, request), fields(org_id = %request.org_id, user_id = %request.user_id))]
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<Session, ServiceError> {
        let user = match self.db.get_user(request.org_id, request.user_id).await {
            Ok(user) => user,
            Err(ServiceError::NotFound { .. }) => return Err(ServiceError::PrincipalNotFound),
            Err(e) => return Err(e),
        };
        if !user.is_active() {
            return Err(ServiceError::PrincipalInactive);
        }

        let session = self
            .db
            .create_session(&CreateSession {
                session_id: None,
                org_id: request.org_id,
                user_id: request.user_id,
                refresh_token_hash: hash_refresh_token(request.refresh_token.expose_secret()),
                ip_address: request.ip_address.clone(),
                user_agent: request.user_agent.clone(),
                mfa_verified_at: request.mfa_verified_at,
                expires_at: request.expires_at,
            })
            .await?;

        self.audit
            .record(
                AuditEvent::new(
                    session.org_id,
                    Actor::user(session.user_id),
                    AuditAction::SessionCreate,
                    TargetType::Session,
                    Some(session.session_id),
                )
                .with_client(request.ip_address, request.user_agent)
                .with_metadata("expires_at", session.expires_at.to_rfc3339()),
            )
            .await;

        Ok(session)
    }

    pub async fn get_session(&self, org_id: Uuid, session_id: Uuid) -> Result<Session, ServiceError> {
        self.db.get_session(org_id, session_id).await
    }

    pub async fn list_active_sessions(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Session>, ServiceError> {
        self.db.list_active_sessions_for_user(org_id, user_id).await
    }

    /// Revoke once. A second attempt surfaces `OptimisticLockConflict` or
    /// `AlreadyRevoked`.
    #[instrument(skip(self, actor))]
    pub async fn revoke_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        expected_version: i64,
        actor: Actor,
    ) -> Result<Session, ServiceError> {
        let session = self
            .db
            .revoke_session(org_id, session_id, expected_version)
            .await?;

        self.write_through_revocation(&session).await;
        self.audit
            .record(
                AuditEvent::new(
                    org_id,
                    actor,
                    AuditAction::SessionRevoke,
                    TargetType::Session,
                    Some(session_id),
                )
                .with_metadata("user_id", session.user_id.to_string()),
            )
            .await;

        Ok(session)
    }

    /// Logout-style revoke: a session that is already revoked is not an
    /// error. Returns `None` in that case.
    pub async fn revoke_session_idempotent(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        expected_version: i64,
        actor: Actor,
    ) -> Result<Option<Session>, ServiceError> {
        match self
            .revoke_session(org_id, session_id, expected_version, actor)
            .await
        {
            Ok(session) => Ok(Some(session)),
            Err(e) if e.is_conflict() => {
                let current = self.db.get_session(org_id, session_id).await?;
                if current.is_revoked() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a session may still be used. Expiry is judged on `expires_at`
    /// alone, regardless of `revoked_at`.
    #[instrument(skip(self))]
    pub async fn check_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
    ) -> Result<RevocationStatus, ServiceError> {
        if self.cached_revocation(session_id).await {
            return Ok(RevocationStatus::Revoked);
        }
        match self.db.get_session(org_id, session_id).await {
            Ok(session) => Ok(session_status(&session, Utc::now())),
            Err(ServiceError::NotFound { .. }) => Ok(RevocationStatus::Unknown),
            Err(e) => Err(e),
        }
    }

    /// Resolve a presented refresh token to a usable session.
    #[instrument(skip(self, refresh_token))]
    pub async fn validate_refresh_token(
        &self,
        org_id: Uuid,
        refresh_token: &SecretString,
    ) -> Result<Session, ServiceError> {
        let hash = hash_refresh_token(refresh_token.expose_secret());
        let session = match self.db.get_session_by_refresh_token_hash(org_id, &hash).await {
            Ok(session) => session,
            Err(ServiceError::NotFound { .. }) => {
                return Err(ServiceError::CredentialRejected("unknown"))
            }
            Err(e) => return Err(e),
        };

        if self.cached_revocation(session.session_id).await {
            return Err(ServiceError::CredentialRejected("revoked"));
        }
        match session_status(&session, Utc::now()) {
            RevocationStatus::Active => Ok(session),
            RevocationStatus::Expired => Err(ServiceError::CredentialRejected("expired")),
            _ => Err(ServiceError::CredentialRejected("revoked")),
        }
    }

    pub async fn mark_mfa_verified(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        expected_version: i64,
    ) -> Result<Session, ServiceError> {
        self.db
            .mark_session_mfa_verified(org_id, session_id, expected_version)
            .await
    }

    async fn cached_revocation(&self, session_id: Uuid) -> bool {
        match self.cache.exists(&revoked_session_key(session_id)).await {
            Ok(hit) => hit,
            Err(e) => {
                CACHE_DEGRADED
                    .with_label_values(&["session_revocation_check"])
                    .inc();
                tracing::warn!(error = %e, "Session revocation cache unavailable; using store");
                false
            }
        }
    }

    async fn write_through_revocation(&self, session: &Session) {
        let Ok(ttl) = (session.expires_at - Utc::now()).to_std() else {
            return;
        };
        if ttl.is_zero() {
            return;
        }
        if let Err(e) = self
            .cache
            .set_ex(&revoked_session_key(session.session_id), "revoked", ttl)
            .await
        {
            CACHE_DEGRADED
                .with_label_values(&["session_revocation_write"])
                .inc();
            tracing::warn!(
                error = %e,
                session_id = %session.session_id,
                "Failed to write session revocation to cache"
            );
        }
    }

    // ==================== Lockout ====================

    /// Emails are unique only within an org, so the cache key carries both.
    fn email_identifier(org_id: Uuid, email: &str) -> String {
        format!("{}:{}", org_id, email.trim().to_lowercase())
    }

    /// Reject authentication for a locked account. The durable
    /// `lockout_until` on the user row is checked before the cache.
    #[instrument(skip(self, user), fields(org_id = %user.org_id, user_id = %user.user_id))]
    pub async fn check_lockout(&self, user: &User) -> Result<(), ServiceError> {
        if let Some(until) = user.lockout_until.filter(|_| user.is_locked_out()) {
            return Err(ServiceError::AccountLocked { until });
        }

        for identifier in [
            user.user_id.to_string(),
            Self::email_identifier(user.org_id, &user.email),
        ] {
            match self.lockout.locked_until(&identifier).await {
                Ok(Some(until)) => return Err(ServiceError::AccountLocked { until }),
                Ok(None) => {}
                Err(e) => {
                    CACHE_DEGRADED.with_label_values(&["lockout_check"]).inc();
                    tracing::warn!(error = %e, "Lockout cache unavailable; allowing attempt");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Count a failed authentication for `user`. Crossing the threshold
    /// stamps `lockout_until` on the user row and emits `user.lockout`.
    #[instrument(skip(self, user), fields(org_id = %user.org_id, user_id = %user.user_id))]
    pub async fn record_failed_attempt(&self, user: &User) -> Result<FailureOutcome, ServiceError> {
        let outcome = match self.lockout.record_failure(&user.user_id.to_string()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                CACHE_DEGRADED.with_label_values(&["lockout_record"]).inc();
                tracing::warn!(error = %e, "Could not record failed attempt");
                return Ok(FailureOutcome {
                    attempts: 0,
                    locked_until: None,
                });
            }
        };

        if let Some(until) = outcome.locked_until {
            self.persist_lockout(user, until).await;
            self.audit
                .record(
                    AuditEvent::new(
                        user.org_id,
                        Actor::system(),
                        AuditAction::UserLockout,
                        TargetType::User,
                        Some(user.user_id),
                    )
                    .with_metadata("failed_attempts", outcome.attempts)
                    .with_metadata("lockout_until", until.to_rfc3339()),
                )
                .await;
        }

        Ok(outcome)
    }

    /// Count a failure against an email that matched no user in `org_id`.
    #[instrument(skip(self, email), fields(org_id = %org_id))]
    pub async fn record_failed_attempt_for_email(
        &self,
        org_id: Uuid,
        email: &str,
    ) -> FailureOutcome {
        let identifier = Self::email_identifier(org_id, email);
        match self.lockout.record_failure(&identifier).await {
            Ok(outcome) => outcome,
            Err(e) => {
                CACHE_DEGRADED.with_label_values(&["lockout_record"]).inc();
                tracing::warn!(error = %e, "Could not record failed attempt");
                FailureOutcome {
                    attempts: 0,
                    locked_until: None,
                }
            }
        }
    }

    /// Reset lockout state and stamp `last_login_at`.
    #[instrument(skip(self, user), fields(org_id = %user.org_id, user_id = %user.user_id))]
    pub async fn record_successful_login(&self, user: &User) -> Result<(), ServiceError> {
        for identifier in [
            user.user_id.to_string(),
            Self::email_identifier(user.org_id, &user.email),
        ] {
            if let Err(e) = self.lockout.clear(&identifier).await {
                CACHE_DEGRADED.with_label_values(&["lockout_clear"]).inc();
                tracing::warn!(error = %e, "Could not clear lockout state");
            }
        }
        self.db
            .record_user_login(user.org_id, user.user_id, Utc::now())
            .await
    }

    /// Best effort: the cache already enforces the lockout.
    async fn persist_lockout(&self, user: &User, until: DateTime<Utc>) {
        let result = async {
            let current = self.db.get_user(user.org_id, user.user_id).await?;
            self.db
                .update_user_status(&UpdateUserStatus {
                    org_id: current.org_id,
                    user_id: current.user_id,
                    expected_version: current.version,
                    status: current.status,
                    lockout_until: Some(until),
                })
                .await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, user_id = %user.user_id, "Failed to persist lockout_until");
        }
    }
}

fn session_status(session: &Session, now: DateTime<Utc>) -> RevocationStatus {
    if session.is_revoked() {
        RevocationStatus::Revoked
    } else if session.is_expired_at(now) {
        RevocationStatus::Expired
    } else {
        RevocationStatus::Active
    }
}
