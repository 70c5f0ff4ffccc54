use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    finish_update, require_non_empty, soft_delete, stale_revoke_error, Database, TenantTx,
    API_KEYS,
};
use crate::models::{ApiKey, CreateApiKey, Metadata, Principal};
use crate::services::error::ServiceError;
use crate::services::metrics::DB_QUERY_DURATION;

/// A rotation's result: the replacement key and its revoked predecessor.
#[derive(Debug, Clone)]
pub struct RotatedApiKey {
    pub replacement: ApiKey,
    pub revoked: ApiKey,
}

async fn insert_api_key(tx: &mut TenantTx, input: &CreateApiKey) -> Result<ApiKey, ServiceError> {
    require_non_empty("fingerprint", &input.fingerprint)?;

    let api_key_id = input.api_key_id.unwrap_or_else(Uuid::new_v4);
    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        INSERT INTO api_keys (
            api_key_id, org_id, principal_type, principal_id, fingerprint,
            status, scopes, expires_at, annotations
        )
        VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(api_key_id)
    .bind(input.org_id)
    .bind(input.principal.kind())
    .bind(input.principal.id())
    .bind(&input.fingerprint)
    .bind(Json(&input.scopes))
    .bind(input.expires_at)
    .bind(Json(&input.annotations))
    .fetch_one(&mut **tx)
    .await?;
    Ok(key)
}

/// `active -> revoked`, predicated on the caller's version.
async fn revoke_in(
    tx: &mut TenantTx,
    org_id: Uuid,
    api_key_id: Uuid,
    expected_version: i64,
) -> Result<Option<ApiKey>, ServiceError> {
    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE api_keys
        SET status = 'revoked', revoked_at = NOW(), version = version + 1, updated_at = NOW()
        WHERE api_key_id = $1 AND org_id = $2 AND version = $3
          AND revoked_at IS NULL AND deleted_at IS NULL
        RETURNING *
        "#,
    )
    .bind(api_key_id)
    .bind(org_id)
    .bind(expected_version)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(key)
}

impl Database {
    // ==================== API Key Operations ====================

    /// Persist a freshly issued key. Only the fingerprint is stored.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, principal = %input.principal))]
    pub async fn create_api_key(&self, input: &CreateApiKey) -> Result<ApiKey, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_api_key"])
            .start_timer();

        let mut tx = self.begin_tenant(input.org_id).await?;
        let key = insert_api_key(&mut tx, input).await?;
        tx.commit().await?;

        timer.observe_duration();
        info!(api_key_id = %key.api_key_id, "API key stored");
        Ok(key)
    }

    #[instrument(skip(self))]
    pub async fn get_api_key(&self, org_id: Uuid, api_key_id: Uuid) -> Result<ApiKey, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE api_key_id = $1 AND org_id = $2 AND deleted_at IS NULL",
        )
        .bind(api_key_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        key.ok_or(ServiceError::NotFound {
            entity: API_KEYS.name,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_api_key_by_fingerprint(
        &self,
        org_id: Uuid,
        fingerprint: &str,
    ) -> Result<ApiKey, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE fingerprint = $1 AND org_id = $2 AND deleted_at IS NULL",
        )
        .bind(fingerprint)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        key.ok_or(ServiceError::NotFound {
            entity: API_KEYS.name,
        })
    }

    /// Look a key up by fingerprint when the owning org is not yet known.
    ///
    /// The owning org comes from the `api_key_fingerprints` lookup table,
    /// which sits outside row-level security and holds nothing but the org
    /// id; the row is then read under that org's tenant marker.
    #[instrument(skip(self))]
    pub async fn find_api_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ApiKey>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_api_key_by_fingerprint"])
            .start_timer();

        let mut tx = self.begin_unscoped().await?;
        let org_id: Option<Uuid> =
            sqlx::query_scalar("SELECT api_key_org_for_fingerprint($1)")
                .bind(fingerprint)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        let result = match org_id {
            Some(org_id) => match self.get_api_key_by_fingerprint(org_id, fingerprint).await {
                Ok(key) => Some(key),
                // Soft-deleted between the two reads.
                Err(ServiceError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        timer.observe_duration();
        Ok(result)
    }

    /// Keys held by one principal, newest first.
    #[instrument(skip(self), fields(principal = %principal))]
    pub async fn list_api_keys_for_principal(
        &self,
        org_id: Uuid,
        principal: Principal,
    ) -> Result<Vec<ApiKey>, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT * FROM api_keys
            WHERE org_id = $1 AND principal_type = $2 AND principal_id = $3 AND deleted_at IS NULL
            ORDER BY created_at DESC, api_key_id
            "#,
        )
        .bind(org_id)
        .bind(principal.kind())
        .bind(principal.id())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(keys)
    }

    #[instrument(skip(self))]
    pub async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT * FROM api_keys
            WHERE org_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC, api_key_id
            "#,
        )
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(keys)
    }

    /// Revoke a key. Terminal: a revoked key can never become active again.
    #[instrument(skip(self))]
    pub async fn revoke_api_key(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        expected_version: i64,
    ) -> Result<ApiKey, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["revoke_api_key"])
            .start_timer();

        let mut tx = self.begin_tenant(org_id).await?;
        let key = match revoke_in(&mut tx, org_id, api_key_id, expected_version).await? {
            Some(key) => {
                tx.commit().await?;
                key
            }
            None => {
                let err =
                    stale_revoke_error(&mut tx, API_KEYS, org_id, api_key_id, expected_version)
                        .await;
                tx.rollback().await?;
                return Err(err);
            }
        };

        timer.observe_duration();
        info!(api_key_id = %key.api_key_id, "API key revoked");
        Ok(key)
    }

    /// Replace a key with a new one and revoke the old one atomically.
    #[instrument(skip(self, replacement), fields(org_id = %org_id, api_key_id = %api_key_id))]
    pub async fn rotate_api_key(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        expected_version: i64,
        replacement: &CreateApiKey,
    ) -> Result<RotatedApiKey, ServiceError> {
        if replacement.org_id != org_id {
            return Err(ServiceError::Validation(
                "replacement key must belong to the same organization".to_string(),
            ));
        }

        let mut tx = self.begin_tenant(org_id).await?;
        let revoked = match revoke_in(&mut tx, org_id, api_key_id, expected_version).await? {
            Some(key) => key,
            None => {
                let err =
                    stale_revoke_error(&mut tx, API_KEYS, org_id, api_key_id, expected_version)
                        .await;
                tx.rollback().await?;
                return Err(err);
            }
        };
        let replacement = insert_api_key(&mut tx, replacement).await?;
        tx.commit().await?;

        info!(
            revoked = %revoked.api_key_id,
            replacement = %replacement.api_key_id,
            "API key rotated"
        );
        Ok(RotatedApiKey {
            replacement,
            revoked,
        })
    }

    #[instrument(skip(self, annotations))]
    pub async fn update_api_key_annotations(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        expected_version: i64,
        annotations: &Metadata,
    ) -> Result<ApiKey, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            UPDATE api_keys
            SET annotations = $4, version = version + 1, updated_at = NOW()
            WHERE api_key_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(api_key_id)
        .bind(org_id)
        .bind(expected_version)
        .bind(Json(annotations))
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, key, API_KEYS, org_id, api_key_id).await
    }

    /// Out-of-band usage stamp. Does not bump `version`.
    #[instrument(skip(self))]
    pub async fn touch_api_key_last_used(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        sqlx::query(
            r#"
            UPDATE api_keys
            SET last_used_at = GREATEST(COALESCE(last_used_at, $3), $3)
            WHERE api_key_id = $1 AND org_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(api_key_id)
        .bind(org_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn soft_delete_api_key(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        expected_version: i64,
    ) -> Result<(), ServiceError> {
        soft_delete(self, API_KEYS, org_id, api_key_id, expected_version).await
    }
}
