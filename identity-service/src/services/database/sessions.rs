use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{finish_update, require_non_empty, stale_revoke_error, Database, SESSIONS};
use crate::models::{CreateSession, Session};
use crate::services::error::ServiceError;

impl Database {
    // ==================== Session Operations ====================

    /// Persist a session. `expires_at` is supplied by the caller and must be in the future.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, user_id = %input.user_id))]
    pub async fn create_session(&self, input: &CreateSession) -> Result<Session, ServiceError> {
        require_non_empty("refresh_token_hash", &input.refresh_token_hash)?;
        if input.expires_at <= Utc::now() {
            return Err(ServiceError::Validation(
                "session expiry must be in the future".to_string(),
            ));
        }

        let session_id = input.session_id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.begin_tenant(input.org_id).await?;
        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (
                session_id, org_id, user_id, refresh_token_hash, ip_address,
                user_agent, mfa_verified_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(input.org_id)
        .bind(input.user_id)
        .bind(&input.refresh_token_hash)
        .bind(&input.ip_address)
        .bind(&input.user_agent)
        .bind(input.mfa_verified_at)
        .bind(input.expires_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn get_session(&self, org_id: Uuid, session_id: Uuid) -> Result<Session, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE session_id = $1 AND org_id = $2 AND deleted_at IS NULL",
        )
        .bind(session_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        session.ok_or(ServiceError::NotFound {
            entity: SESSIONS.name,
        })
    }

    #[instrument(skip(self, refresh_token_hash))]
    pub async fn get_session_by_refresh_token_hash(
        &self,
        org_id: Uuid,
        refresh_token_hash: &str,
    ) -> Result<Session, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE refresh_token_hash = $1 AND org_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(refresh_token_hash)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        session.ok_or(ServiceError::NotFound {
            entity: SESSIONS.name,
        })
    }

    /// Unrevoked, unexpired sessions for a user, newest first.
    #[instrument(skip(self))]
    pub async fn list_active_sessions_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Session>, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE org_id = $1 AND user_id = $2
              AND revoked_at IS NULL AND expires_at > NOW() AND deleted_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(sessions)
    }

    /// Revoke a session exactly once. A retry with a stale version is a conflict.
    #[instrument(skip(self))]
    pub async fn revoke_session(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        expected_version: i64,
    ) -> Result<Session, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let session = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET revoked_at = NOW(), version = version + 1, updated_at = NOW()
            WHERE session_id = $1 AND org_id = $2 AND version = $3
              AND revoked_at IS NULL AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        match session {
            Some(session) => {
                tx.commit().await?;
                info!(session_id = %session.session_id, "Session revoked");
                Ok(session)
            }
            None => {
                let err =
                    stale_revoke_error(&mut tx, SESSIONS, org_id, session_id, expected_version)
                        .await;
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn mark_session_mfa_verified(
        &self,
        org_id: Uuid,
        session_id: Uuid,
        expected_version: i64,
    ) -> Result<Session, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let session = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET mfa_verified_at = NOW(), version = version + 1, updated_at = NOW()
            WHERE session_id = $1 AND org_id = $2 AND version = $3
              AND revoked_at IS NULL AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, session, SESSIONS, org_id, session_id).await
    }
}
