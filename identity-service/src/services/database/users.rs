use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{finish_update, require_non_empty, soft_delete, Database, USERS};
use crate::models::{
    CreateUser, UpdateUserMfa, UpdateUserProfile, UpdateUserStatus, User,
};
use crate::services::error::ServiceError;
use crate::services::metrics::DB_QUERY_DURATION;

/// Emails are compared case-insensitively and stored folded.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Database {
    // ==================== User Operations ====================

    /// Insert a new user into `input.org_id`.
    #[instrument(skip(self, input), fields(org_id = %input.org_id))]
    pub async fn create_user(&self, input: &CreateUser) -> Result<User, ServiceError> {
        let email = normalize_email(&input.email);
        if !email.contains('@') {
            return Err(ServiceError::Validation("email must contain '@'".to_string()));
        }
        require_non_empty("password_hash", &input.password_hash)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_user"])
            .start_timer();

        let user_id = input.user_id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.begin_tenant(input.org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                user_id, org_id, email, display_name, password_hash, status,
                external_idp_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(input.org_id)
        .bind(&email)
        .bind(&input.display_name)
        .bind(&input.password_hash)
        .bind(input.status)
        .bind(&input.external_idp_id)
        .bind(Json(&input.metadata))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        timer.observe_duration();
        info!(user_id = %user.user_id, "User created");
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, org_id: Uuid, user_id: Uuid) -> Result<User, ServiceError> {
        self.fetch_user(org_id, user_id, false).await
    }

    #[instrument(skip(self))]
    pub async fn get_user_including_deleted(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<User, ServiceError> {
        self.fetch_user(org_id, user_id, true).await
    }

    async fn fetch_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        include_deleted: bool,
    ) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE user_id = $1 AND org_id = $2 AND ($3 OR deleted_at IS NULL)",
        )
        .bind(user_id)
        .bind(org_id)
        .bind(include_deleted)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        user.ok_or(ServiceError::NotFound {
            entity: USERS.name,
        })
    }

    /// Case-insensitive lookup by email within an org.
    #[instrument(skip(self, email))]
    pub async fn get_user_by_email(&self, org_id: Uuid, email: &str) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE org_id = $1 AND email = $2 AND deleted_at IS NULL",
        )
        .bind(org_id)
        .bind(normalize_email(email))
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        user.ok_or(ServiceError::NotFound {
            entity: USERS.name,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_user_by_external_idp(
        &self,
        org_id: Uuid,
        external_idp_id: &str,
    ) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE org_id = $1 AND external_idp_id = $2 AND deleted_at IS NULL",
        )
        .bind(org_id)
        .bind(external_idp_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        user.ok_or(ServiceError::NotFound {
            entity: USERS.name,
        })
    }

    /// List live users in an org, oldest first.
    #[instrument(skip(self))]
    pub async fn list_users(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<User>, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE org_id = $1 AND deleted_at IS NULL
            ORDER BY created_at, user_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(org_id)
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(users)
    }

    #[instrument(skip(self, input), fields(org_id = %input.org_id, user_id = %input.user_id))]
    pub async fn update_user_profile(
        &self,
        input: &UpdateUserProfile,
    ) -> Result<User, ServiceError> {
        require_non_empty("display_name", &input.display_name)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_user_profile"])
            .start_timer();

        let mut tx = self.begin_tenant(input.org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET display_name = $4, metadata = $5, version = version + 1, updated_at = NOW()
            WHERE user_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(input.org_id)
        .bind(input.expected_version)
        .bind(&input.display_name)
        .bind(Json(&input.metadata))
        .fetch_optional(&mut *tx)
        .await?;

        let user = finish_update(tx, user, USERS, input.org_id, input.user_id).await?;
        timer.observe_duration();
        Ok(user)
    }

    /// Set status and the durable lockout deadline together.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, user_id = %input.user_id, status = %input.status))]
    pub async fn update_user_status(&self, input: &UpdateUserStatus) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(input.org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET status = $4, lockout_until = $5, version = version + 1, updated_at = NOW()
            WHERE user_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(input.org_id)
        .bind(input.expected_version)
        .bind(input.status)
        .bind(input.lockout_until)
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, user, USERS, input.org_id, input.user_id).await
    }

    #[instrument(skip(self, password_hash))]
    pub async fn update_user_password_hash(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        expected_version: i64,
        password_hash: &str,
    ) -> Result<User, ServiceError> {
        require_non_empty("password_hash", password_hash)?;

        let mut tx = self.begin_tenant(org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET password_hash = $4, version = version + 1, updated_at = NOW()
            WHERE user_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(expected_version)
        .bind(password_hash)
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, user, USERS, org_id, user_id).await
    }

    #[instrument(skip(self, input), fields(org_id = %input.org_id, user_id = %input.user_id))]
    pub async fn update_user_mfa(&self, input: &UpdateUserMfa) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(input.org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET mfa_enrolled = $4, mfa_methods = $5, mfa_secret = $6,
                version = version + 1, updated_at = NOW()
            WHERE user_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(input.org_id)
        .bind(input.expected_version)
        .bind(input.mfa_enrolled)
        .bind(Json(&input.mfa_methods))
        .bind(&input.mfa_secret)
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, user, USERS, input.org_id, input.user_id).await
    }

    /// Replace the stored (already hashed) recovery tokens.
    #[instrument(skip(self, hashed_tokens))]
    pub async fn update_user_recovery_tokens(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        expected_version: i64,
        hashed_tokens: &[String],
    ) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET recovery_tokens = $4, version = version + 1, updated_at = NOW()
            WHERE user_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(expected_version)
        .bind(Json(hashed_tokens))
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, user, USERS, org_id, user_id).await
    }

    #[instrument(skip(self))]
    pub async fn update_user_external_idp(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        expected_version: i64,
        external_idp_id: Option<&str>,
    ) -> Result<User, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET external_idp_id = $4, version = version + 1, updated_at = NOW()
            WHERE user_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(expected_version)
        .bind(external_idp_id)
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, user, USERS, org_id, user_id).await
    }

    /// Record a successful login and clear any durable lockout.
    ///
    /// Login bookkeeping is not a versioned mutation: it neither requires nor
    /// bumps `version`, so it never invalidates a caller's pending edit.
    #[instrument(skip(self))]
    pub async fn record_user_login(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let result = sqlx::query(
            r#"
            UPDATE users
            SET last_login_at = $3, lockout_until = NULL
            WHERE user_id = $1 AND org_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound {
                entity: USERS.name,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn soft_delete_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        expected_version: i64,
    ) -> Result<(), ServiceError> {
        soft_delete(self, USERS, org_id, user_id, expected_version).await
    }
}
