//! Integration tests for sessions and account lockout.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{create_org, create_user, spawn_runtime, spawn_runtime_with_lockout};
use identity_service::config::LockoutConfig;
use identity_service::models::{Actor, AuditAction, RevocationStatus};
use identity_service::services::{CreateSessionRequest, ServiceError};
use secrecy::SecretString;
use std::time::Duration;
use uuid::Uuid;

fn session_request(org_id: Uuid, user_id: Uuid, token: &str, ttl: ChronoDuration) -> CreateSessionRequest {
    CreateSessionRequest {
        org_id,
        user_id,
        refresh_token: SecretString::new(token.to_string()),
        ip_address: Some("203.0.113.7".to_string()),
        user_agent: Some("integration-test".to_string()),
        mfa_verified_at: None,
        expires_at: Utc::now() + ttl,
    }
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn session_expires_without_revocation() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org.org_id).await;
    let sessions = app.runtime.sessions();

    let token = Uuid::new_v4().to_string();
    let session = sessions
        .create_session(session_request(
            org.org_id,
            user.user_id,
            &token,
            ChronoDuration::seconds(1),
        ))
        .await
        .unwrap();
    assert_ne!(session.refresh_token_hash, token);
    assert_eq!(
        sessions
            .check_session(org.org_id, session.session_id)
            .await
            .unwrap(),
        RevocationStatus::Active
    );

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let status = sessions
        .check_session(org.org_id, session.session_id)
        .await
        .unwrap();
    assert_eq!(status, RevocationStatus::Expired);

    let current = sessions
        .get_session(org.org_id, session.session_id)
        .await
        .unwrap();
    assert!(current.revoked_at.is_none());

    let refresh = sessions
        .validate_refresh_token(org.org_id, &SecretString::new(token))
        .await;
    assert!(matches!(
        refresh,
        Err(ServiceError::CredentialRejected("expired"))
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn revoked_session_stays_revoked() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org.org_id).await;
    let sessions = app.runtime.sessions();

    let token = Uuid::new_v4().to_string();
    let session = sessions
        .create_session(session_request(
            org.org_id,
            user.user_id,
            &token,
            ChronoDuration::hours(1),
        ))
        .await
        .unwrap();

    let revoked = sessions
        .revoke_session(org.org_id, session.session_id, session.version, Actor::user(user.user_id))
        .await
        .unwrap();
    assert!(revoked.revoked_at.is_some());

    let again = sessions
        .revoke_session(org.org_id, session.session_id, session.version, Actor::user(user.user_id))
        .await;
    assert!(matches!(
        again,
        Err(ServiceError::OptimisticLockConflict { .. })
    ));

    let logout = sessions
        .revoke_session_idempotent(
            org.org_id,
            session.session_id,
            revoked.version,
            Actor::user(user.user_id),
        )
        .await
        .unwrap();
    assert!(logout.is_none());

    app.cache.clear().unwrap();
    assert_eq!(
        sessions
            .check_session(org.org_id, session.session_id)
            .await
            .unwrap(),
        RevocationStatus::Revoked
    );
    assert!(matches!(
        sessions
            .validate_refresh_token(org.org_id, &SecretString::new(token))
            .await,
        Err(ServiceError::CredentialRejected("revoked"))
    ));

    assert_eq!(app.audit.count(AuditAction::SessionCreate), 1);
    assert_eq!(app.audit.count(AuditAction::SessionRevoke), 1);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn session_for_unknown_user_is_rejected() {
    let app = spawn_runtime().await;
    let org = create_org(&app.runtime).await;

    let result = app
        .runtime
        .sessions()
        .create_session(session_request(
            org.org_id,
            Uuid::new_v4(),
            "token",
            ChronoDuration::hours(1),
        ))
        .await;
    assert!(matches!(result, Err(ServiceError::PrincipalNotFound)));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn repeated_failures_lock_the_account() {
    let app = spawn_runtime_with_lockout(LockoutConfig {
        max_attempts: 3,
        window: Duration::from_secs(60),
        duration: Duration::from_secs(60),
    })
    .await;
    let org = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org.org_id).await;
    let sessions = app.runtime.sessions();

    for attempt in 1..3 {
        let outcome = sessions.record_failed_attempt(&user).await.unwrap();
        assert_eq!(outcome.attempts, attempt);
        assert!(!outcome.triggered_lockout());
    }
    assert!(sessions.check_lockout(&user).await.is_ok());

    let outcome = sessions.record_failed_attempt(&user).await.unwrap();
    assert!(outcome.triggered_lockout());
    assert!(matches!(
        sessions.check_lockout(&user).await,
        Err(ServiceError::AccountLocked { .. })
    ));

    let stored = app
        .runtime
        .db()
        .get_user(org.org_id, user.user_id)
        .await
        .unwrap();
    assert!(stored.lockout_until.is_some());
    assert_eq!(app.audit.count(AuditAction::UserLockout), 1);

    // The durable stamp holds even when the cache forgets.
    app.cache.clear().unwrap();
    assert!(matches!(
        sessions.check_lockout(&stored).await,
        Err(ServiceError::AccountLocked { .. })
    ));

    sessions.record_successful_login(&stored).await.unwrap();
    let unlocked = app
        .runtime
        .db()
        .get_user(org.org_id, user.user_id)
        .await
        .unwrap();
    assert!(unlocked.lockout_until.is_none());
    assert!(unlocked.last_login_at.is_some());
    assert!(sessions.check_lockout(&unlocked).await.is_ok());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn email_failures_do_not_lock_same_email_in_another_org() {
    let app = spawn_runtime_with_lockout(LockoutConfig {
        max_attempts: 1,
        window: Duration::from_secs(60),
        duration: Duration::from_secs(60),
    })
    .await;
    let org_a = create_org(&app.runtime).await;
    let org_b = create_org(&app.runtime).await;
    let user = create_user(&app.runtime, org_a.org_id).await;
    let sessions = app.runtime.sessions();

    let outcome = sessions
        .record_failed_attempt_for_email(org_b.org_id, &user.email)
        .await;
    assert!(outcome.triggered_lockout());
    assert!(sessions.check_lockout(&user).await.is_ok());

    let outcome = sessions
        .record_failed_attempt_for_email(org_a.org_id, &user.email.to_uppercase())
        .await;
    assert!(outcome.triggered_lockout());
    assert!(matches!(
        sessions.check_lockout(&user).await,
        Err(ServiceError::AccountLocked { .. })
    ));
}
