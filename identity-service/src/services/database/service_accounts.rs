use sqlx::types::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{finish_update, require_non_empty, soft_delete, Database, SERVICE_ACCOUNTS};
use crate::models::{CreateServiceAccount, ServiceAccount, UpdateServiceAccount};
use crate::services::error::ServiceError;
use crate::services::metrics::DB_QUERY_DURATION;

impl Database {
    // ==================== Service Account Operations ====================

    #[instrument(skip(self, input), fields(org_id = %input.org_id, name = %input.name))]
    pub async fn create_service_account(
        &self,
        input: &CreateServiceAccount,
    ) -> Result<ServiceAccount, ServiceError> {
        require_non_empty("name", &input.name)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_service_account"])
            .start_timer();

        let id = input.service_account_id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.begin_tenant(input.org_id).await?;
        let account = sqlx::query_as::<_, ServiceAccount>(
            r#"
            INSERT INTO service_accounts (service_account_id, org_id, name, description, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.org_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(Json(&input.metadata))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        timer.observe_duration();
        info!(service_account_id = %account.service_account_id, "Service account created");
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn get_service_account(
        &self,
        org_id: Uuid,
        service_account_id: Uuid,
    ) -> Result<ServiceAccount, ServiceError> {
        self.fetch_service_account(org_id, service_account_id, false)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_service_account_including_deleted(
        &self,
        org_id: Uuid,
        service_account_id: Uuid,
    ) -> Result<ServiceAccount, ServiceError> {
        self.fetch_service_account(org_id, service_account_id, true)
            .await
    }

    async fn fetch_service_account(
        &self,
        org_id: Uuid,
        service_account_id: Uuid,
        include_deleted: bool,
    ) -> Result<ServiceAccount, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let account = sqlx::query_as::<_, ServiceAccount>(
            r#"
            SELECT * FROM service_accounts
            WHERE service_account_id = $1 AND org_id = $2 AND ($3 OR deleted_at IS NULL)
            "#,
        )
        .bind(service_account_id)
        .bind(org_id)
        .bind(include_deleted)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        account.ok_or(ServiceError::NotFound {
            entity: SERVICE_ACCOUNTS.name,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_service_accounts(
        &self,
        org_id: Uuid,
    ) -> Result<Vec<ServiceAccount>, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let accounts = sqlx::query_as::<_, ServiceAccount>(
            r#"
            SELECT * FROM service_accounts
            WHERE org_id = $1 AND deleted_at IS NULL
            ORDER BY name
            "#,
        )
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(accounts)
    }

    #[instrument(skip(self, input), fields(org_id = %input.org_id, service_account_id = %input.service_account_id))]
    pub async fn update_service_account(
        &self,
        input: &UpdateServiceAccount,
    ) -> Result<ServiceAccount, ServiceError> {
        require_non_empty("name", &input.name)?;

        let mut tx = self.begin_tenant(input.org_id).await?;
        let account = sqlx::query_as::<_, ServiceAccount>(
            r#"
            UPDATE service_accounts
            SET name = $4, description = $5, status = $6, metadata = $7,
                version = version + 1, updated_at = NOW()
            WHERE service_account_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(input.service_account_id)
        .bind(input.org_id)
        .bind(input.expected_version)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.status)
        .bind(Json(&input.metadata))
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(
            tx,
            account,
            SERVICE_ACCOUNTS,
            input.org_id,
            input.service_account_id,
        )
        .await
    }

    /// Stamp `last_rotation_at` after a credential rotation.
    #[instrument(skip(self))]
    pub async fn mark_service_account_rotated(
        &self,
        org_id: Uuid,
        service_account_id: Uuid,
        expected_version: i64,
    ) -> Result<ServiceAccount, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let account = sqlx::query_as::<_, ServiceAccount>(
            r#"
            UPDATE service_accounts
            SET last_rotation_at = NOW(), version = version + 1, updated_at = NOW()
            WHERE service_account_id = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(service_account_id)
        .bind(org_id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        finish_update(tx, account, SERVICE_ACCOUNTS, org_id, service_account_id).await
    }

    #[instrument(skip(self))]
    pub async fn soft_delete_service_account(
        &self,
        org_id: Uuid,
        service_account_id: Uuid,
        expected_version: i64,
    ) -> Result<(), ServiceError> {
        soft_delete(
            self,
            SERVICE_ACCOUNTS,
            org_id,
            service_account_id,
            expected_version,
        )
        .await
    }
}
