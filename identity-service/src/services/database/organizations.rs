use sqlx::types::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{finish_update, require_non_empty, soft_delete, Database, ORGS};
use crate::models::{CreateOrg, Organization, UpdateOrg};
use crate::services::error::ServiceError;
use crate::services::metrics::DB_QUERY_DURATION;

impl Database {
    // ==================== Organization Operations ====================

    /// Insert a new organization. Slugs are globally unique.
    #[instrument(skip(self, input), fields(slug = %input.slug))]
    pub async fn create_org(&self, input: &CreateOrg) -> Result<Organization, ServiceError> {
        validate_slug(&input.slug)?;
        require_non_empty("name", &input.name)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_org"])
            .start_timer();

        let org_id = input.org_id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.begin_tenant(org_id).await?;
        let org = sqlx::query_as::<_, Organization>(
            r#"
            INSERT INTO orgs (
                org_id, slug, name, status, billing_owner_user_id, budget_policy_id,
                declarative_mode, declarative_repo_url, declarative_branch,
                mfa_required_roles, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(&input.slug)
        .bind(&input.name)
        .bind(input.status)
        .bind(input.billing_owner_user_id)
        .bind(input.budget_policy_id)
        .bind(input.declarative_mode)
        .bind(&input.declarative_repo_url)
        .bind(&input.declarative_branch)
        .bind(Json(&input.mfa_required_roles))
        .bind(Json(&input.metadata))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        timer.observe_duration();
        info!(org_id = %org.org_id, "Organization created");
        Ok(org)
    }

    /// Find a live organization by id.
    #[instrument(skip(self))]
    pub async fn get_org(&self, org_id: Uuid) -> Result<Organization, ServiceError> {
        self.fetch_org(org_id, false).await
    }

    /// Find an organization by id, including soft-deleted ones.
    #[instrument(skip(self))]
    pub async fn get_org_including_deleted(
        &self,
        org_id: Uuid,
    ) -> Result<Organization, ServiceError> {
        self.fetch_org(org_id, true).await
    }

    async fn fetch_org(
        &self,
        org_id: Uuid,
        include_deleted: bool,
    ) -> Result<Organization, ServiceError> {
        let mut tx = self.begin_tenant(org_id).await?;
        let org = sqlx::query_as::<_, Organization>(
            "SELECT * FROM orgs WHERE org_id = $1 AND ($2 OR deleted_at IS NULL)",
        )
        .bind(org_id)
        .bind(include_deleted)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        org.ok_or(ServiceError::NotFound {
            entity: ORGS.name,
        })
    }

    /// Find a live organization by slug. Runs before the tenant is known.
    #[instrument(skip(self))]
    pub async fn get_org_by_slug(&self, slug: &str) -> Result<Organization, ServiceError> {
        let mut tx = self.begin_unscoped().await?;
        let org = sqlx::query_as::<_, Organization>(
            "SELECT * FROM orgs WHERE slug = $1 AND deleted_at IS NULL",
        )
        .bind(slug)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        org.ok_or(ServiceError::NotFound {
            entity: ORGS.name,
        })
    }

    /// Replace an organization's mutable fields.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, expected_version = input.expected_version))]
    pub async fn update_org(&self, input: &UpdateOrg) -> Result<Organization, ServiceError> {
        require_non_empty("name", &input.name)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_org"])
            .start_timer();

        let mut tx = self.begin_tenant(input.org_id).await?;
        let org = sqlx::query_as::<_, Organization>(
            r#"
            UPDATE orgs
            SET name = $3,
                status = $4,
                billing_owner_user_id = $5,
                budget_policy_id = $6,
                declarative_mode = $7,
                declarative_repo_url = $8,
                declarative_branch = $9,
                declarative_last_commit = $10,
                mfa_required_roles = $11,
                metadata = $12,
                version = version + 1,
                updated_at = NOW()
            WHERE org_id = $1 AND version = $2 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(input.org_id)
        .bind(input.expected_version)
        .bind(&input.name)
        .bind(input.status)
        .bind(input.billing_owner_user_id)
        .bind(input.budget_policy_id)
        .bind(input.declarative_mode)
        .bind(&input.declarative_repo_url)
        .bind(&input.declarative_branch)
        .bind(&input.declarative_last_commit)
        .bind(Json(&input.mfa_required_roles))
        .bind(Json(&input.metadata))
        .fetch_optional(&mut *tx)
        .await?;

        let org = finish_update(tx, org, ORGS, input.org_id, input.org_id).await?;
        timer.observe_duration();
        info!(org_id = %org.org_id, version = org.version, "Organization updated");
        Ok(org)
    }

    /// Soft-delete an organization.
    #[instrument(skip(self))]
    pub async fn soft_delete_org(
        &self,
        org_id: Uuid,
        expected_version: i64,
    ) -> Result<(), ServiceError> {
        soft_delete(self, ORGS, org_id, org_id, expected_version).await
    }
}

/// Slugs are lowercase ASCII letters, digits and single hyphens.
fn validate_slug(slug: &str) -> Result<(), ServiceError> {
    let valid = !slug.is_empty()
        && slug.len() <= 63
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "invalid organization slug: {:?}",
            slug
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::validate_slug;

    #[test]
    fn slug_rules() {
        assert!(validate_slug("acme").is_ok());
        assert!(validate_slug("acme-labs-2").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("acme--labs").is_err());
        assert!(validate_slug("acme labs").is_err());
    }
}
