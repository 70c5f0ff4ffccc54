//! API key lifecycle: issuance, revocation, rotation and the fast
//! fingerprint-keyed revocation check used by the gateway.
//!
//! PostgreSQL is the only authority. The revocation cache is written through
//! on revocation and consulted first on checks, but only a positive
//! "revoked" hit is trusted without a store round-trip.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::config::CredentialConfig;
use crate::models::{
    Actor, ApiKey, AuditAction, AuditEvent, CreateApiKey, Metadata, Principal, RevocationStatus,
    TargetType,
};
use crate::services::audit::AuditRecorder;
use crate::services::background::{BackgroundJob, BackgroundQueue};
use crate::services::cache::{revoked_api_key_key, CacheBackend};
use crate::services::database::Database;
use crate::services::envelope::{SealedSecret, SecretEnvelope};
use crate::services::error::ServiceError;
use crate::services::metrics::{
    API_KEYS_ISSUED, API_KEYS_REVOKED, CACHE_DEGRADED, REVOCATION_CHECKS,
};

const SECRET_BYTES: usize = 32;

/// 32 bytes from the OS CSPRNG, base64url without padding.
pub fn generate_secret() -> SecretString {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    SecretString::new(URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 of the secret, base64url without padding. This is the only
/// derivative of a secret that is ever stored.
pub fn fingerprint(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

/// How long a revocation marker should live in the cache: until the key
/// would have expired anyway, capped at `ceiling`. `None` when the key is
/// already past expiry and the marker would add nothing.
pub fn revocation_ttl(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    ceiling: Duration,
) -> Option<Duration> {
    match expires_at {
        None => Some(ceiling),
        Some(expires_at) => (expires_at - now)
            .to_std()
            .ok()
            .filter(|remaining| !remaining.is_zero())
            .map(|remaining| remaining.min(ceiling)),
    }
}

#[derive(Debug, Clone)]
pub struct IssueApiKeyRequest {
    pub org_id: Uuid,
    pub principal: Principal,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Convenience alternative to `expires_at`; ignored when that is set.
    pub expires_in_days: Option<u32>,
    pub display_name: Option<String>,
    pub annotations: Metadata,
    pub actor: Actor,
}

impl IssueApiKeyRequest {
    pub fn new(org_id: Uuid, principal: Principal, actor: Actor) -> Self {
        Self {
            org_id,
            principal,
            scopes: Vec::new(),
            expires_at: None,
            expires_in_days: None,
            display_name: None,
            annotations: Metadata::new(),
            actor,
        }
    }

    fn resolve_expiry(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ServiceError> {
        let expires_at = self.expires_at.or_else(|| {
            self.expires_in_days
                .map(|days| now + chrono::Duration::days(i64::from(days)))
        });
        match expires_at {
            Some(at) if at <= now => Err(ServiceError::Validation(
                "API key expiry must be in the future".to_string(),
            )),
            other => Ok(other),
        }
    }
}

/// A newly issued key. `secret` is shown to the caller once and never stored.
pub struct IssuedApiKey {
    pub api_key: ApiKey,
    pub secret: SecretString,
}

impl std::fmt::Debug for IssuedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedApiKey")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RotateApiKeyRequest {
    pub org_id: Uuid,
    pub api_key_id: Uuid,
    pub expected_version: i64,
    /// Replacement scopes; the predecessor's scopes when `None`.
    pub scopes: Option<Vec<String>>,
    /// Replacement expiry; the predecessor's expiry when `None`.
    pub expires_at: Option<DateTime<Utc>>,
    pub actor: Actor,
}

#[derive(Debug)]
pub struct RotatedCredential {
    pub issued: IssuedApiKey,
    pub revoked: ApiKey,
}

#[derive(Clone)]
pub struct CredentialService {
    db: Database,
    cache: Arc<dyn CacheBackend>,
    envelope: Arc<dyn SecretEnvelope>,
    audit: AuditRecorder,
    queue: Arc<BackgroundQueue>,
    ttl_ceiling: Duration,
}

impl CredentialService {
    pub fn new(
        db: Database,
        cache: Arc<dyn CacheBackend>,
        envelope: Arc<dyn SecretEnvelope>,
        audit: AuditRecorder,
        queue: Arc<BackgroundQueue>,
        config: &CredentialConfig,
    ) -> Self {
        Self {
            db,
            cache,
            envelope,
            audit,
            queue,
            ttl_ceiling: config.revocation_ttl_ceiling,
        }
    }

    /// Issue a new key for an active principal.
    #[instrument(skip(self, request), fields(org_id = %request.org_id, principal = %request.principal))]
    pub async fn issue_api_key(
        &self,
        request: IssueApiKeyRequest,
    ) -> Result<IssuedApiKey, ServiceError> {
        let now = Utc::now();
        let expires_at = request.resolve_expiry(now)?;
        self.ensure_principal_active(request.org_id, request.principal)
            .await?;

        let mut annotations = request.annotations;
        if let Some(name) = request.display_name {
            annotations.insert("display_name".to_string(), name.into());
        }

        let (issued, sealed) = self
            .persist_new_key(
                request.org_id,
                request.principal,
                request.scopes,
                expires_at,
                annotations,
            )
            .await?;

        self.forward_sealed(request.org_id, sealed);
        self.audit_issue(request.actor, &issued.api_key).await;

        tracing::info!(
            api_key_id = %issued.api_key.api_key_id,
            fingerprint = %issued.api_key.fingerprint,
            "API key issued"
        );
        Ok(issued)
    }

    #[instrument(skip(self))]
    pub async fn get_api_key(&self, org_id: Uuid, api_key_id: Uuid) -> Result<ApiKey, ServiceError> {
        self.db.get_api_key(org_id, api_key_id).await
    }

    pub async fn list_api_keys_for_principal(
        &self,
        org_id: Uuid,
        principal: Principal,
    ) -> Result<Vec<ApiKey>, ServiceError> {
        self.db.list_api_keys_for_principal(org_id, principal).await
    }

    pub async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>, ServiceError> {
        self.db.list_api_keys(org_id).await
    }

    /// Revoke a key and write the revocation through to the cache.
    #[instrument(skip(self, actor))]
    pub async fn revoke_api_key(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        expected_version: i64,
        actor: Actor,
    ) -> Result<ApiKey, ServiceError> {
        let key = self
            .db
            .revoke_api_key(org_id, api_key_id, expected_version)
            .await?;

        self.write_through_revocation(&key).await;
        API_KEYS_REVOKED.inc();
        self.audit_revoke(actor, &key).await;

        Ok(key)
    }

    /// Replace a key with a fresh secret and revoke the old one atomically.
    #[instrument(skip(self, request), fields(org_id = %request.org_id, api_key_id = %request.api_key_id))]
    pub async fn rotate_api_key(
        &self,
        request: RotateApiKeyRequest,
    ) -> Result<RotatedCredential, ServiceError> {
        let now = Utc::now();
        let current = self
            .db
            .get_api_key(request.org_id, request.api_key_id)
            .await?;
        if current.is_revoked() {
            return Err(ServiceError::AlreadyRevoked { entity: "api key" });
        }
        let principal = current.principal();
        self.ensure_principal_active(request.org_id, principal)
            .await?;

        let expires_at = match request.expires_at.or(current.expires_at) {
            Some(at) if at <= now => {
                return Err(ServiceError::Validation(
                    "replacement expiry must be in the future".to_string(),
                ))
            }
            other => other,
        };
        let scopes = request.scopes.unwrap_or_else(|| current.scopes.clone());
        let mut annotations = current.annotations.clone();
        annotations.insert(
            "rotated_from".to_string(),
            current.api_key_id.to_string().into(),
        );

        let api_key_id = Uuid::new_v4();
        let secret = generate_secret();
        let sealed = self.envelope.seal(api_key_id, &secret)?;
        let replacement = CreateApiKey {
            api_key_id: Some(api_key_id),
            org_id: request.org_id,
            principal,
            fingerprint: fingerprint(secret.expose_secret()),
            scopes,
            expires_at,
            annotations,
        };

        let rotated = self
            .db
            .rotate_api_key(
                request.org_id,
                request.api_key_id,
                request.expected_version,
                &replacement,
            )
            .await?;

        self.write_through_revocation(&rotated.revoked).await;
        self.forward_sealed(request.org_id, sealed);
        API_KEYS_ISSUED
            .with_label_values(&[principal.kind().as_str()])
            .inc();
        API_KEYS_REVOKED.inc();
        self.audit_issue(request.actor, &rotated.replacement).await;
        self.audit_revoke(request.actor, &rotated.revoked).await;

        if let Principal::ServiceAccount(id) = principal {
            self.stamp_service_account_rotation(request.org_id, id)
                .await;
        }

        Ok(RotatedCredential {
            issued: IssuedApiKey {
                api_key: rotated.replacement,
                secret,
            },
            revoked: rotated.revoked,
        })
    }

    /// Replace a key's annotations.
    #[instrument(skip(self, annotations, actor))]
    pub async fn annotate_api_key(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        expected_version: i64,
        annotations: Metadata,
        actor: Actor,
    ) -> Result<ApiKey, ServiceError> {
        let key = self
            .db
            .update_api_key_annotations(org_id, api_key_id, expected_version, &annotations)
            .await?;

        let keys: Vec<serde_json::Value> = annotations
            .keys()
            .map(|k| serde_json::Value::String(k.clone()))
            .collect();
        self.audit
            .record(
                AuditEvent::new(
                    org_id,
                    actor,
                    AuditAction::ApiKeyAnnotate,
                    TargetType::ApiKey,
                    Some(api_key_id),
                )
                .with_metadata("annotation_keys", keys)
                .with_metadata("version", key.version),
            )
            .await;

        Ok(key)
    }

    /// Fast revocation check by fingerprint.
    ///
    /// A cached revocation answers immediately. Otherwise the store decides,
    /// and a store-confirmed revocation is written back to the cache. A store
    /// failure is returned as an error, never as "active".
    #[instrument(skip(self))]
    pub async fn check_revocation(&self, fingerprint: &str) -> Result<RevocationStatus, ServiceError> {
        if self.cached_revocation(fingerprint).await {
            return Ok(RevocationStatus::Revoked);
        }
        let (status, _) = self.store_revocation_status(fingerprint).await?;
        Ok(status)
    }

    /// Authenticate a presented secret.
    ///
    /// Succeeds only for a known, unrevoked, unexpired key; on success the
    /// key's `last_used_at` is updated out of band.
    #[instrument(skip(self, secret))]
    pub async fn validate_api_key(&self, secret: &SecretString) -> Result<ApiKey, ServiceError> {
        let fingerprint = fingerprint(secret.expose_secret());

        if self.cached_revocation(&fingerprint).await {
            return Err(ServiceError::CredentialRejected("revoked"));
        }

        match self.store_revocation_status(&fingerprint).await? {
            (RevocationStatus::Active, Some(key)) => {
                self.queue.try_submit(BackgroundJob::TouchApiKey {
                    org_id: key.org_id,
                    api_key_id: key.api_key_id,
                    at: Utc::now(),
                });
                Ok(key)
            }
            (RevocationStatus::Revoked, _) => Err(ServiceError::CredentialRejected("revoked")),
            (RevocationStatus::Expired, _) => Err(ServiceError::CredentialRejected("expired")),
            _ => Err(ServiceError::CredentialRejected("unknown")),
        }
    }

    async fn cached_revocation(&self, fingerprint: &str) -> bool {
        match self.cache.exists(&revoked_api_key_key(fingerprint)).await {
            Ok(true) => {
                REVOCATION_CHECKS
                    .with_label_values(&["cache", RevocationStatus::Revoked.as_str()])
                    .inc();
                true
            }
            Ok(false) => false,
            Err(e) => {
                CACHE_DEGRADED.with_label_values(&["revocation_check"]).inc();
                tracing::warn!(error = %e, "Revocation cache unavailable; falling back to store");
                false
            }
        }
    }

    async fn store_revocation_status(
        &self,
        fingerprint: &str,
    ) -> Result<(RevocationStatus, Option<ApiKey>), ServiceError> {
        let key = self.db.find_api_key_by_fingerprint(fingerprint).await?;
        let status = key
            .as_ref()
            .map(|k| k.revocation_status_at(Utc::now()))
            .unwrap_or(RevocationStatus::Unknown);

        REVOCATION_CHECKS
            .with_label_values(&["store", status.as_str()])
            .inc();

        if let (RevocationStatus::Revoked, Some(k)) = (status, key.as_ref()) {
            self.write_through_revocation(k).await;
        }
        Ok((status, key))
    }

    async fn ensure_principal_active(
        &self,
        org_id: Uuid,
        principal: Principal,
    ) -> Result<(), ServiceError> {
        let active = match principal {
            Principal::User(id) => self.db.get_user(org_id, id).await.map(|u| u.is_active()),
            Principal::ServiceAccount(id) => self
                .db
                .get_service_account(org_id, id)
                .await
                .map(|sa| sa.is_active()),
        };
        match active {
            Ok(true) => Ok(()),
            Ok(false) => Err(ServiceError::PrincipalInactive),
            Err(ServiceError::NotFound { .. }) => Err(ServiceError::PrincipalNotFound),
            Err(e) => Err(e),
        }
    }

    /// Seal first, then insert: a sealing failure leaves nothing behind.
    async fn persist_new_key(
        &self,
        org_id: Uuid,
        principal: Principal,
        scopes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
        annotations: Metadata,
    ) -> Result<(IssuedApiKey, SealedSecret), ServiceError> {
        let api_key_id = Uuid::new_v4();
        let secret = generate_secret();
        let sealed = self.envelope.seal(api_key_id, &secret).map_err(|e| {
            tracing::error!(error = %e, algorithm = self.envelope.algorithm(), "Failed to seal API key secret");
            ServiceError::from(e)
        })?;

        let api_key = self
            .db
            .create_api_key(&CreateApiKey {
                api_key_id: Some(api_key_id),
                org_id,
                principal,
                fingerprint: fingerprint(secret.expose_secret()),
                scopes,
                expires_at,
                annotations,
            })
            .await?;

        API_KEYS_ISSUED
            .with_label_values(&[principal.kind().as_str()])
            .inc();
        Ok((IssuedApiKey { api_key, secret }, sealed))
    }

    fn forward_sealed(&self, org_id: Uuid, sealed: SealedSecret) {
        let api_key_id = sealed.api_key_id;
        if !self
            .queue
            .try_submit(BackgroundJob::ForwardSealedSecret { org_id, sealed })
        {
            tracing::error!(%api_key_id, "Sealed secret was not forwarded");
        }
    }

    /// Best effort: a cache failure is logged and counted, never returned.
    async fn write_through_revocation(&self, key: &ApiKey) {
        let Some(ttl) = revocation_ttl(key.expires_at, Utc::now(), self.ttl_ceiling) else {
            return;
        };
        if let Err(e) = self
            .cache
            .set_ex(&revoked_api_key_key(&key.fingerprint), "revoked", ttl)
            .await
        {
            CACHE_DEGRADED.with_label_values(&["revocation_write"]).inc();
            tracing::warn!(
                error = %e,
                api_key_id = %key.api_key_id,
                "Failed to write revocation to cache; store remains authoritative"
            );
        }
    }

    async fn stamp_service_account_rotation(&self, org_id: Uuid, service_account_id: Uuid) {
        let result = async {
            let account = self
                .db
                .get_service_account(org_id, service_account_id)
                .await?;
            self.db
                .mark_service_account_rotated(org_id, service_account_id, account.version)
                .await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                %service_account_id,
                "Failed to record service account rotation time"
            );
        }
    }

    async fn audit_issue(&self, actor: Actor, key: &ApiKey) {
        let scopes: Vec<serde_json::Value> = key
            .scopes
            .iter()
            .map(|s| serde_json::Value::String(s.clone()))
            .collect();
        self.audit
            .record(
                AuditEvent::new(
                    key.org_id,
                    actor,
                    AuditAction::ApiKeyIssue,
                    TargetType::ApiKey,
                    Some(key.api_key_id),
                )
                .with_metadata("principal_type", key.principal_type.as_str())
                .with_metadata("principal_id", key.principal_id.to_string())
                .with_metadata("fingerprint", key.fingerprint.clone())
                .with_metadata("scopes", scopes)
                .with_metadata(
                    "expires_at",
                    key.expires_at
                        .map(|at| serde_json::Value::String(at.to_rfc3339()))
                        .unwrap_or(serde_json::Value::Null),
                ),
            )
            .await;
    }

    async fn audit_revoke(&self, actor: Actor, key: &ApiKey) {
        self.audit
            .record(
                AuditEvent::new(
                    key.org_id,
                    actor,
                    AuditAction::ApiKeyRevoke,
                    TargetType::ApiKey,
                    Some(key.api_key_id),
                )
                .with_metadata("principal_type", key.principal_type.as_str())
                .with_metadata("principal_id", key.principal_id.to_string())
                .with_metadata("fingerprint", key.fingerprint.clone()),
            )
            .await;
    }
}
