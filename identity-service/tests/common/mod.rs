//! Common test utilities for identity-service integration tests.

use identity_service::config::{DatabaseConfig, LockoutConfig};
use identity_service::models::{CreateOrg, CreateServiceAccount, CreateUser, Organization, ServiceAccount, User};
use identity_service::services::{
    AesGcmEnvelope, Database, MemoryAuditEmitter, MemoryCache, MemorySealedSecretStore,
};
use identity_service::startup::{Runtime, RuntimeBuilder};
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,identity_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run the ignored integration tests")
}

pub fn test_database_config() -> DatabaseConfig {
    let mut config = DatabaseConfig::new(database_url());
    config.max_connections = 4;
    config
}

/// Test runtime with in-memory side channels the tests can inspect.
#[allow(dead_code)]
pub struct TestRuntime {
    pub runtime: Runtime,
    pub cache: Arc<MemoryCache>,
    pub audit: Arc<MemoryAuditEmitter>,
    pub secrets: Arc<MemorySealedSecretStore>,
}

pub async fn spawn_runtime() -> TestRuntime {
    spawn_runtime_with_lockout(LockoutConfig::default()).await
}

pub async fn spawn_runtime_with_lockout(lockout: LockoutConfig) -> TestRuntime {
    init_tracing();

    let db = Database::connect(&test_database_config())
        .await
        .expect("Failed to connect to test database");

    let cache = Arc::new(MemoryCache::new());
    let audit = Arc::new(MemoryAuditEmitter::new());
    let secrets = Arc::new(MemorySealedSecretStore::new());
    let envelope = Arc::new(AesGcmEnvelope::new(&[7u8; 32]).expect("valid test key"));

    let runtime = RuntimeBuilder::new(db)
        .cache(cache.clone())
        .audit(audit.clone())
        .envelope(envelope)
        .secret_store(secrets.clone())
        .lockout(lockout)
        .probe_timeout(Duration::from_secs(2))
        .build();

    TestRuntime {
        runtime,
        cache,
        audit,
        secrets,
    }
}

pub fn unique_slug(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

#[allow(dead_code)]
pub async fn create_org(runtime: &Runtime) -> Organization {
    let slug = unique_slug("org");
    runtime
        .db()
        .create_org(&CreateOrg::new(slug.clone(), format!("Org {}", slug)))
        .await
        .expect("Failed to create org")
}

#[allow(dead_code)]
pub async fn create_user(runtime: &Runtime, org_id: Uuid) -> User {
    let email = format!("{}@example.com", Uuid::new_v4().simple());
    runtime
        .db()
        .create_user(&CreateUser::new(org_id, email, "Test User", "$argon2id$test-hash"))
        .await
        .expect("Failed to create user")
}

#[allow(dead_code)]
pub async fn create_service_account(runtime: &Runtime, org_id: Uuid) -> ServiceAccount {
    runtime
        .db()
        .create_service_account(&CreateServiceAccount::new(org_id, unique_slug("sa")))
        .await
        .expect("Failed to create service account")
}
