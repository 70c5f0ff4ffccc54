//! Integration tests for tenant scoping.

mod common;

use common::{create_org, create_service_account, create_user, spawn_runtime};
use identity_service::models::{Actor, Principal};
use identity_service::services::{IssueApiKeyRequest, ServiceError};
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn rows_are_invisible_from_another_org() {
    let app = spawn_runtime().await;
    let org_a = create_org(&app.runtime).await;
    let org_b = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org_a.org_id).await;
    let db = app.runtime.db();

    assert!(db.get_user(org_a.org_id, user.user_id).await.is_ok());
    assert!(matches!(
        db.get_user(org_b.org_id, user.user_id).await,
        Err(ServiceError::NotFound { .. })
    ));

    let listed = db.list_users(org_b.org_id, 100, 0).await.unwrap();
    assert!(listed.iter().all(|u| u.org_id == org_b.org_id));
    assert!(!listed.iter().any(|u| u.user_id == user.user_id));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn cross_org_api_key_operations_fail() {
    let app = spawn_runtime().await;
    let org_a = create_org(&app.runtime).await;
    let org_b = create_org(&app.runtime).await;
    let account = create_service_account(&app.runtime, org_a.org_id).await;
    let credentials = app.runtime.credentials();

    let issued = credentials
        .issue_api_key(IssueApiKeyRequest::new(
            org_a.org_id,
            Principal::ServiceAccount(account.service_account_id),
            Actor::system(),
        ))
        .await
        .unwrap();

    assert!(matches!(
        credentials
            .get_api_key(org_b.org_id, issued.api_key.api_key_id)
            .await,
        Err(ServiceError::NotFound { .. })
    ));
    assert!(matches!(
        credentials
            .revoke_api_key(
                org_b.org_id,
                issued.api_key.api_key_id,
                issued.api_key.version,
                Actor::system(),
            )
            .await,
        Err(ServiceError::NotFound { .. })
    ));

    // A principal from another org cannot be issued a key.
    let foreign = credentials
        .issue_api_key(IssueApiKeyRequest::new(
            org_b.org_id,
            Principal::ServiceAccount(account.service_account_id),
            Actor::system(),
        ))
        .await;
    assert!(matches!(foreign, Err(ServiceError::PrincipalNotFound)));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn same_email_is_allowed_in_different_orgs() {
    let app = spawn_runtime().await;
    let org_a = create_org(&app.runtime).await;
    let org_b = create_org(&app.runtime).await;
    let email = format!("{}@example.com", uuid::Uuid::new_v4().simple());
    let db = app.runtime.db();

    let a = db
        .create_user(&identity_service::models::CreateUser::new(
            org_a.org_id,
            email.clone(),
            "A",
            "$argon2id$hash",
        ))
        .await
        .unwrap();
    let b = db
        .create_user(&identity_service::models::CreateUser::new(
            org_b.org_id,
            email,
            "B",
            "$argon2id$hash",
        ))
        .await
        .unwrap();
    assert_ne!(a.user_id, b.user_id);
}

/// Superusers and BYPASSRLS roles skip every policy, so the query runs under a
/// plain role when the test connection holds either attribute.
async fn drop_rls_bypass(tx: &mut identity_service::services::TenantTx) {
    let bypasses: bool = sqlx::query_scalar(
        "SELECT rolsuper OR rolbypassrls FROM pg_roles WHERE rolname = current_user",
    )
    .fetch_one(&mut **tx)
    .await
    .unwrap();
    if !bypasses {
        return;
    }
    sqlx::query(
        r#"
        DO $$
        BEGIN
            IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'identity_tenant_reader') THEN
                CREATE ROLE identity_tenant_reader NOLOGIN;
            END IF;
        END
        $$
        "#,
    )
    .execute(&mut **tx)
    .await
    .unwrap();
    sqlx::query("GRANT SELECT ON users TO identity_tenant_reader")
        .execute(&mut **tx)
        .await
        .unwrap();
    sqlx::query("SET LOCAL ROLE identity_tenant_reader")
        .execute(&mut **tx)
        .await
        .unwrap();
}

async fn visible_users(app: &common::TestRuntime, marker: Option<Uuid>, user_id: Uuid) -> i64 {
    let db = app.runtime.db();
    let mut tx = match marker {
        Some(org_id) => db.begin_tenant(org_id).await.unwrap(),
        None => db.pool().begin().await.unwrap(),
    };
    drop_rls_bypass(&mut tx).await;
    // No org_id predicate: only the row policy stands between the tenants.
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM users WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    count
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn row_policy_hides_other_tenants_without_org_predicate() {
    let app = spawn_runtime().await;
    let org_a = create_org(&app.runtime).await;
    let org_b = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org_a.org_id).await;

    assert_eq!(visible_users(&app, Some(org_a.org_id), user.user_id).await, 1);
    assert_eq!(visible_users(&app, Some(org_b.org_id), user.user_id).await, 0);
    assert_eq!(visible_users(&app, None, user.user_id).await, 0);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn fingerprint_lookup_resolves_org_under_forced_policies() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let account = create_service_account(&app.runtime, org.org_id).await;
    let credentials = app.runtime.credentials();

    let issued = credentials
        .issue_api_key(IssueApiKeyRequest::new(
            org.org_id,
            Principal::ServiceAccount(account.service_account_id),
            Actor::system(),
        ))
        .await
        .unwrap();

    let db = app.runtime.db();
    let found = db
        .find_api_key_by_fingerprint(&issued.api_key.fingerprint)
        .await
        .unwrap()
        .expect("key resolvable by fingerprint");
    assert_eq!(found.api_key_id, issued.api_key.api_key_id);
    assert_eq!(found.org_id, org.org_id);

    db.soft_delete_api_key(org.org_id, found.api_key_id, found.version)
        .await
        .unwrap();
    assert!(db
        .find_api_key_by_fingerprint(&issued.api_key.fingerprint)
        .await
        .unwrap()
        .is_none());
}
