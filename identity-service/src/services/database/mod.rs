//! Tenant store: PostgreSQL access layer for identity entities.
//!
//! Every tenant-bound operation runs inside a transaction that first sets the
//! transaction-local `app.org_id` setting, which the row-level security
//! policies in `migrations/` compare against each row's `org_id`. Queries also
//! filter on `org_id` explicitly, so a missing policy and a missing predicate
//! would both have to fail for rows to leak across tenants.
//!
//! Mutations are optimistic: the caller passes the `version` it last read and
//! the update is predicated on `id AND org_id AND version AND deleted_at IS
//! NULL`. When zero rows match, the row is re-read inside the same
//! transaction to report `NotFound` or `OptimisticLockConflict`.

mod api_keys;
mod organizations;
mod service_accounts;
mod sessions;
mod users;

pub use api_keys::RotatedApiKey;

use crate::config::DatabaseConfig;
use crate::db;
use crate::services::error::ServiceError;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// A transaction with the tenant marker already applied.
pub type TenantTx = Transaction<'static, Postgres>;

/// Table coordinates used when classifying a zero-row update.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntityRef {
    pub table: &'static str,
    pub id_column: &'static str,
    pub name: &'static str,
}

pub(crate) const ORGS: EntityRef = EntityRef {
    table: "orgs",
    id_column: "org_id",
    name: "organization",
};
pub(crate) const USERS: EntityRef = EntityRef {
    table: "users",
    id_column: "user_id",
    name: "user",
};
pub(crate) const SERVICE_ACCOUNTS: EntityRef = EntityRef {
    table: "service_accounts",
    id_column: "service_account_id",
    name: "service account",
};
pub(crate) const API_KEYS: EntityRef = EntityRef {
    table: "api_keys",
    id_column: "api_key_id",
    name: "api key",
};
pub(crate) const SESSIONS: EntityRef = EntityRef {
    table: "sessions",
    id_column: "session_id",
    name: "session",
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    statement_timeout: Duration,
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statement_timeout: Duration::from_secs(5),
        }
    }

    /// Override the per-transaction statement timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Connect, and apply migrations when configured to.
    #[instrument(skip(config), fields(service = "identity-service"))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, ServiceError> {
        let pool = db::create_pool(config).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            ServiceError::from(e)
        })?;
        let database = Self::new(pool).with_statement_timeout(config.statement_timeout);

        if config.run_migrations {
            database.run_migrations().await?;
        }

        Ok(database)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), ServiceError> {
        db::run_migrations(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            ServiceError::Internal(anyhow::anyhow!("Migration failed: {}", e))
        })
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                ServiceError::from(e)
            })?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            info!("Closing PostgreSQL pool");
            self.pool.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Begin a transaction bound to `org_id`.
    ///
    /// The tenant marker and statement timeout are passed as bind parameters
    /// to `set_config(.., true)`, which scopes both to this transaction.
    pub async fn begin_tenant(&self, org_id: Uuid) -> Result<TenantTx, ServiceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "SELECT set_config('app.org_id', $1, true), set_config('statement_timeout', $2, true)",
        )
        .bind(org_id.to_string())
        .bind(self.statement_timeout.as_millis().to_string())
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    /// Begin a transaction with no tenant marker, for lookups that precede
    /// tenant resolution (e.g. org by slug).
    pub(crate) async fn begin_unscoped(&self) -> Result<TenantTx, ServiceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(self.statement_timeout.as_millis().to_string())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

/// Work out why an optimistic update matched no rows.
pub(crate) async fn stale_update_error(
    tx: &mut TenantTx,
    entity: EntityRef,
    org_id: Uuid,
    id: Uuid,
) -> ServiceError {
    let sql = format!(
        "SELECT version FROM {} WHERE {} = $1 AND org_id = $2 AND deleted_at IS NULL",
        entity.table, entity.id_column
    );
    match sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .bind(org_id)
        .fetch_optional(&mut **tx)
        .await
    {
        Ok(Some(_)) => ServiceError::OptimisticLockConflict {
            entity: entity.name,
        },
        Ok(None) => ServiceError::NotFound {
            entity: entity.name,
        },
        Err(e) => e.into(),
    }
}

/// Commit when the optimistic update returned a row, otherwise classify the
/// miss and roll back.
pub(crate) async fn finish_update<T>(
    mut tx: TenantTx,
    row: Option<T>,
    entity: EntityRef,
    org_id: Uuid,
    id: Uuid,
) -> Result<T, ServiceError> {
    match row {
        Some(row) => {
            tx.commit().await?;
            Ok(row)
        }
        None => {
            let err = stale_update_error(&mut tx, entity, org_id, id).await;
            tx.rollback().await?;
            Err(err)
        }
    }
}

/// Classify a zero-row update on an entity with a terminal `revoked_at`.
///
/// A version mismatch is reported first so that a retry with a stale version
/// always surfaces as a concurrency conflict.
pub(crate) async fn stale_revoke_error(
    tx: &mut TenantTx,
    entity: EntityRef,
    org_id: Uuid,
    id: Uuid,
    expected_version: i64,
) -> ServiceError {
    let sql = format!(
        "SELECT version, revoked_at IS NOT NULL FROM {} WHERE {} = $1 AND org_id = $2 AND deleted_at IS NULL",
        entity.table, entity.id_column
    );
    match sqlx::query_as::<_, (i64, bool)>(&sql)
        .bind(id)
        .bind(org_id)
        .fetch_optional(&mut **tx)
        .await
    {
        Ok(None) => ServiceError::NotFound {
            entity: entity.name,
        },
        Ok(Some((version, _))) if version != expected_version => {
            ServiceError::OptimisticLockConflict {
                entity: entity.name,
            }
        }
        Ok(Some((_, true))) => ServiceError::AlreadyRevoked {
            entity: entity.name,
        },
        Ok(Some((_, false))) => ServiceError::OptimisticLockConflict {
            entity: entity.name,
        },
        Err(e) => e.into(),
    }
}

/// Soft-delete a tenant-bound row under optimistic concurrency.
pub(crate) async fn soft_delete(
    db: &Database,
    entity: EntityRef,
    org_id: Uuid,
    id: Uuid,
    expected_version: i64,
) -> Result<(), ServiceError> {
    let mut tx = db.begin_tenant(org_id).await?;
    let sql = format!(
        "UPDATE {} SET deleted_at = NOW(), updated_at = NOW(), version = version + 1 \
         WHERE {} = $1 AND org_id = $2 AND version = $3 AND deleted_at IS NULL \
         RETURNING version",
        entity.table, entity.id_column
    );
    let row = sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .bind(org_id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;
    finish_update(tx, row, entity, org_id, id).await?;
    info!(entity = entity.name, %org_id, %id, "Soft-deleted row");
    Ok(())
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}
