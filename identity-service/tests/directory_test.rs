//! Integration tests for organization, user and service account management.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{create_org, create_service_account, create_user, spawn_runtime, unique_slug};
use identity_service::models::{
    Actor, AuditAction, CreateOrg, OrgStatus, Principal, UpdateOrg, UpdateUserMfa,
};
use identity_service::services::{CreateSessionRequest, IssueApiKeyRequest, ServiceError};
use secrecy::SecretString;
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn org_lifecycle_is_versioned_and_audited() {
    let app = spawn_runtime().await;
    let directory = app.runtime.directory();
    let slug = unique_slug("acme");

    let org = directory
        .create_org(&CreateOrg::new(slug.clone(), "Acme"), Actor::system())
        .await
        .unwrap();
    assert_eq!(org.version, 1);
    assert!(org.mfa_required_roles.is_empty());
    assert!(org.metadata.is_empty());

    let duplicate = directory
        .create_org(&CreateOrg::new(slug.clone(), "Acme again"), Actor::system())
        .await;
    assert!(matches!(duplicate, Err(ServiceError::Conflict(_))));

    let invalid = directory
        .create_org(&CreateOrg::new("Not A Slug", "Bad"), Actor::system())
        .await;
    assert!(matches!(invalid, Err(ServiceError::Validation(_))));

    let mut update = UpdateOrg::from_current(&org);
    update.status = OrgStatus::Suspended;
    update.mfa_required_roles = vec!["admin".to_string()];
    let updated = directory.update_org(&update, Actor::system()).await.unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.status, OrgStatus::Suspended);

    let by_slug = app.runtime.db().get_org_by_slug(&slug).await.unwrap();
    assert_eq!(by_slug.org_id, org.org_id);
    assert_eq!(by_slug.mfa_required_roles, vec!["admin".to_string()]);

    directory
        .delete_org(org.org_id, updated.version, Actor::system())
        .await
        .unwrap();
    assert!(matches!(
        app.runtime.db().get_org(org.org_id).await,
        Err(ServiceError::NotFound { .. })
    ));

    assert_eq!(app.audit.count(AuditAction::OrgCreate), 1);
    assert_eq!(app.audit.count(AuditAction::OrgUpdate), 1);
    assert_eq!(app.audit.count(AuditAction::OrgDelete), 1);
    assert!(app.audit.events().iter().all(|e| e.verify_hash()));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn user_credential_fields_bump_version() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org.org_id).await;
    let db = app.runtime.db();

    let user = db
        .update_user_password_hash(org.org_id, user.user_id, user.version, "$argon2id$rotated")
        .await
        .unwrap();
    assert_eq!(user.version, 2);
    assert_eq!(user.password_hash, "$argon2id$rotated");

    let user = db
        .update_user_mfa(&UpdateUserMfa {
            org_id: org.org_id,
            user_id: user.user_id,
            expected_version: user.version,
            mfa_enrolled: true,
            mfa_methods: vec!["totp".to_string()],
            mfa_secret: Some("sealed-totp-seed".to_string()),
        })
        .await
        .unwrap();
    assert!(user.mfa_enrolled);
    assert_eq!(user.mfa_methods, vec!["totp".to_string()]);

    let user = db
        .update_user_recovery_tokens(
            org.org_id,
            user.user_id,
            user.version,
            &["hash-1".to_string(), "hash-2".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(user.recovery_tokens.len(), 2);

    let idp_id = format!("google|{}", Uuid::new_v4().simple());
    let user = db
        .update_user_external_idp(org.org_id, user.user_id, user.version, Some(&idp_id))
        .await
        .unwrap();
    assert_eq!(user.version, 5);

    let linked = db
        .get_user_by_external_idp(org.org_id, &idp_id)
        .await
        .unwrap();
    assert_eq!(linked.user_id, user.user_id);

    let stale = db
        .update_user_password_hash(org.org_id, user.user_id, 1, "$argon2id$stale")
        .await;
    assert!(matches!(
        stale,
        Err(ServiceError::OptimisticLockConflict { .. })
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn service_accounts_list_and_delete() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let first = create_service_account(&app.runtime, org.org_id).await;
    let second = create_service_account(&app.runtime, org.org_id).await;
    let db = app.runtime.db();

    let listed = db.list_service_accounts(org.org_id).await.unwrap();
    assert_eq!(listed.len(), 2);

    app.runtime
        .directory()
        .delete_service_account(
            org.org_id,
            second.service_account_id,
            second.version,
            Actor::system(),
        )
        .await
        .unwrap();

    let listed = db.list_service_accounts(org.org_id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].service_account_id, first.service_account_id);
    assert!(db
        .get_service_account_including_deleted(org.org_id, second.service_account_id)
        .await
        .unwrap()
        .deleted_at
        .is_some());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn api_key_annotations_and_soft_delete() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let account = create_service_account(&app.runtime, org.org_id).await;
    let credentials = app.runtime.credentials();

    let mut request = IssueApiKeyRequest::new(
        org.org_id,
        Principal::ServiceAccount(account.service_account_id),
        Actor::system(),
    );
    request.display_name = Some("ci".to_string());
    request.expires_in_days = Some(30);
    let issued = credentials.issue_api_key(request).await.unwrap();
    assert_eq!(issued.api_key.annotations["display_name"], "ci");
    assert!(issued.api_key.expires_at.is_some());

    let mut annotations = issued.api_key.annotations.clone();
    annotations.insert("owner".to_string(), "platform".into());
    let annotated = credentials
        .annotate_api_key(
            org.org_id,
            issued.api_key.api_key_id,
            issued.api_key.version,
            annotations,
            Actor::system(),
        )
        .await
        .unwrap();
    assert_eq!(annotated.version, issued.api_key.version + 1);
    assert_eq!(annotated.annotations["owner"], "platform");
    assert_eq!(app.audit.count(AuditAction::ApiKeyAnnotate), 1);

    let db = app.runtime.db();
    let scoped = db
        .get_api_key_by_fingerprint(org.org_id, &issued.api_key.fingerprint)
        .await
        .unwrap();
    assert_eq!(scoped.api_key_id, issued.api_key.api_key_id);

    db.soft_delete_api_key(org.org_id, annotated.api_key_id, annotated.version)
        .await
        .unwrap();
    assert!(credentials.list_api_keys(org.org_id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn active_sessions_and_mfa_step_up() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org.org_id).await;
    let sessions = app.runtime.sessions();

    let mut created = Vec::new();
    for _ in 0..2 {
        let session = sessions
            .create_session(CreateSessionRequest {
                org_id: org.org_id,
                user_id: user.user_id,
                refresh_token: SecretString::new(Uuid::new_v4().to_string()),
                ip_address: None,
                user_agent: None,
                mfa_verified_at: None,
                expires_at: Utc::now() + ChronoDuration::hours(1),
            })
            .await
            .unwrap();
        created.push(session);
    }

    let verified = sessions
        .mark_mfa_verified(org.org_id, created[0].session_id, created[0].version)
        .await
        .unwrap();
    assert!(verified.mfa_verified_at.is_some());
    assert_eq!(verified.version, created[0].version + 1);

    sessions
        .revoke_session(
            org.org_id,
            created[1].session_id,
            created[1].version,
            Actor::user(user.user_id),
        )
        .await
        .unwrap();

    let active = sessions
        .list_active_sessions(org.org_id, user.user_id)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, created[0].session_id);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn failures_for_unknown_email_are_counted() {
    let app = spawn_runtime().await;
    let sessions = app.runtime.sessions();
    let org_id = Uuid::new_v4();
    let email = format!("{}@Example.com", Uuid::new_v4().simple());

    let first = sessions.record_failed_attempt_for_email(org_id, &email).await;
    let second = sessions
        .record_failed_attempt_for_email(org_id, &email.to_uppercase())
        .await;
    assert_eq!(first.attempts, 1);
    assert_eq!(second.attempts, 2);
}
