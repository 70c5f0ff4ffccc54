//! Audited mutations on organizations, users and service accounts.
//!
//! Reads go straight to the tenant store; every write here emits exactly one
//! audit event after it commits.

use tracing::instrument;
use uuid::Uuid;

use crate::models::{
    Actor, AuditAction, AuditEvent, CreateOrg, CreateServiceAccount, CreateUser, Organization,
    ServiceAccount, TargetType, UpdateOrg, UpdateServiceAccount, UpdateUserProfile,
    UpdateUserStatus, User,
};
use crate::services::audit::AuditRecorder;
use crate::services::database::Database;
use crate::services::error::ServiceError;

#[derive(Clone)]
pub struct DirectoryService {
    db: Database,
    audit: AuditRecorder,
}

impl DirectoryService {
    pub fn new(db: Database, audit: AuditRecorder) -> Self {
        Self { db, audit }
    }

    pub fn store(&self) -> &Database {
        &self.db
    }

    async fn emit(
        &self,
        org_id: Uuid,
        actor: Actor,
        action: AuditAction,
        target_type: TargetType,
        target_id: Uuid,
        version: Option<i64>,
    ) {
        let mut event = AuditEvent::new(org_id, actor, action, target_type, Some(target_id));
        if let Some(version) = version {
            event = event.with_metadata("version", version);
        }
        self.audit.record(event).await;
    }

    // ==================== Organizations ====================

    #[instrument(skip(self, input, actor), fields(slug = %input.slug))]
    pub async fn create_org(
        &self,
        input: &CreateOrg,
        actor: Actor,
    ) -> Result<Organization, ServiceError> {
        let org = self.db.create_org(input).await?;
        self.emit(
            org.org_id,
            actor,
            AuditAction::OrgCreate,
            TargetType::Org,
            org.org_id,
            Some(org.version),
        )
        .await;
        Ok(org)
    }

    #[instrument(skip(self, input, actor), fields(org_id = %input.org_id))]
    pub async fn update_org(
        &self,
        input: &UpdateOrg,
        actor: Actor,
    ) -> Result<Organization, ServiceError> {
        let org = self.db.update_org(input).await?;
        self.emit(
            org.org_id,
            actor,
            AuditAction::OrgUpdate,
            TargetType::Org,
            org.org_id,
            Some(org.version),
        )
        .await;
        Ok(org)
    }

    pub async fn delete_org(
        &self,
        org_id: Uuid,
        expected_version: i64,
        actor: Actor,
    ) -> Result<(), ServiceError> {
        self.db.soft_delete_org(org_id, expected_version).await?;
        self.emit(
            org_id,
            actor,
            AuditAction::OrgDelete,
            TargetType::Org,
            org_id,
            None,
        )
        .await;
        Ok(())
    }

    // ==================== Users ====================

    #[instrument(skip(self, input, actor), fields(org_id = %input.org_id))]
    pub async fn create_user(&self, input: &CreateUser, actor: Actor) -> Result<User, ServiceError> {
        let user = self.db.create_user(input).await?;
        self.emit(
            user.org_id,
            actor,
            AuditAction::UserCreate,
            TargetType::User,
            user.user_id,
            Some(user.version),
        )
        .await;
        Ok(user)
    }

    pub async fn update_user_profile(
        &self,
        input: &UpdateUserProfile,
        actor: Actor,
    ) -> Result<User, ServiceError> {
        let user = self.db.update_user_profile(input).await?;
        self.emit(
            user.org_id,
            actor,
            AuditAction::UserUpdate,
            TargetType::User,
            user.user_id,
            Some(user.version),
        )
        .await;
        Ok(user)
    }

    pub async fn update_user_status(
        &self,
        input: &UpdateUserStatus,
        actor: Actor,
    ) -> Result<User, ServiceError> {
        let user = self.db.update_user_status(input).await?;
        self.audit
            .record(
                AuditEvent::new(
                    user.org_id,
                    actor,
                    AuditAction::UserUpdate,
                    TargetType::User,
                    Some(user.user_id),
                )
                .with_metadata("status", user.status.as_str())
                .with_metadata("version", user.version),
            )
            .await;
        Ok(user)
    }

    pub async fn delete_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        expected_version: i64,
        actor: Actor,
    ) -> Result<(), ServiceError> {
        self.db
            .soft_delete_user(org_id, user_id, expected_version)
            .await?;
        self.emit(
            org_id,
            actor,
            AuditAction::UserDelete,
            TargetType::User,
            user_id,
            None,
        )
        .await;
        Ok(())
    }

    // ==================== Service Accounts ====================

    pub async fn create_service_account(
        &self,
        input: &CreateServiceAccount,
        actor: Actor,
    ) -> Result<ServiceAccount, ServiceError> {
        let account = self.db.create_service_account(input).await?;
        self.emit(
            account.org_id,
            actor,
            AuditAction::ServiceAccountCreate,
            TargetType::ServiceAccount,
            account.service_account_id,
            Some(account.version),
        )
        .await;
        Ok(account)
    }

    pub async fn update_service_account(
        &self,
        input: &UpdateServiceAccount,
        actor: Actor,
    ) -> Result<ServiceAccount, ServiceError> {
        let account = self.db.update_service_account(input).await?;
        self.emit(
            account.org_id,
            actor,
            AuditAction::ServiceAccountUpdate,
            TargetType::ServiceAccount,
            account.service_account_id,
            Some(account.version),
        )
        .await;
        Ok(account)
    }

    pub async fn delete_service_account(
        &self,
        org_id: Uuid,
        service_account_id: Uuid,
        expected_version: i64,
        actor: Actor,
    ) -> Result<(), ServiceError> {
        self.db
            .soft_delete_service_account(org_id, service_account_id, expected_version)
            .await?;
        self.emit(
            org_id,
            actor,
            AuditAction::ServiceAccountDelete,
            TargetType::ServiceAccount,
            service_account_id,
            None,
        )
        .await;
        Ok(())
    }
}
