use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{entity} was modified concurrently; reload and retry with the current version")]
    OptimisticLockConflict { entity: &'static str },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Principal is not active")]
    PrincipalInactive,

    #[error("{entity} already revoked")]
    AlreadyRevoked { entity: &'static str },

    #[error("Credential rejected: {0}")]
    CredentialRejected(&'static str),

    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },

    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Audit transport unavailable: {0}")]
    AuditTransportUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// True when the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::StorageUnavailable(_))
    }

    /// True for the 409-equivalent outcomes: stale version, duplicate value,
    /// or a terminal transition that already happened.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ServiceError::OptimisticLockConflict { .. }
                | ServiceError::Conflict(_)
                | ServiceError::AlreadyRevoked { .. }
        )
    }
}

/// SQLSTATE classes that indicate the database could not serve the request
/// rather than rejecting it: connection exceptions, transaction rollbacks
/// (serialization failures, deadlocks), insufficient resources and operator
/// intervention (which includes statement timeouts).
const TRANSIENT_SQLSTATE_CLASSES: [&str; 4] = ["08", "40", "53", "57"];

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                let constraint = db_err.constraint().unwrap_or("unique constraint");
                ServiceError::Conflict(format!("duplicate value violates {}", constraint))
            }
            sqlx::Error::Database(ref db_err)
                if db_err.is_foreign_key_violation() || db_err.is_check_violation() =>
            {
                ServiceError::Validation(db_err.message().to_string())
            }
            sqlx::Error::Database(ref db_err) => {
                let transient = db_err.code().is_some_and(|code| {
                    TRANSIENT_SQLSTATE_CLASSES
                        .iter()
                        .any(|class| code.starts_with(class))
                });
                if transient {
                    ServiceError::StorageUnavailable(err)
                } else {
                    ServiceError::Internal(anyhow::Error::new(err))
                }
            }
            sqlx::Error::RowNotFound => ServiceError::NotFound { entity: "row" },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. } => ServiceError::Internal(anyhow::Error::new(err)),
            other => ServiceError::StorageUnavailable(other),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound { .. } | ServiceError::PrincipalNotFound => {
                AppError::NotFound(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::OptimisticLockConflict { .. }
            | ServiceError::Conflict(_)
            | ServiceError::AlreadyRevoked { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::PrincipalInactive | ServiceError::Validation(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::CredentialRejected(reason) => {
                AppError::Unauthorized(anyhow::anyhow!(reason))
            }
            ServiceError::AccountLocked { until } => {
                let retry_after = (until - Utc::now()).num_seconds().max(1) as u64;
                AppError::TooManyRequests(
                    "Account temporarily locked".to_string(),
                    Some(retry_after),
                )
            }
            ServiceError::StorageUnavailable(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::CacheUnavailable(reason)
            | ServiceError::AuditTransportUnavailable(reason) => {
                AppError::ServiceUnavailable(reason)
            }
            ServiceError::Config(reason) => AppError::ConfigError(anyhow::anyhow!(reason)),
            ServiceError::EncryptionFailure(reason) => {
                AppError::InternalError(anyhow::anyhow!("Encryption failure: {}", reason))
            }
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn conflicts_are_distinguishable_from_failures() {
        let stale = ServiceError::OptimisticLockConflict { entity: "user" };
        assert!(stale.is_conflict());
        assert!(!stale.is_retryable());

        let revoked = ServiceError::AlreadyRevoked { entity: "api key" };
        assert!(revoked.is_conflict());
        assert_eq!(
            AppError::from(revoked).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn pool_timeout_is_retryable_storage_failure() {
        let err = ServiceError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert_eq!(
            AppError::from(err).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn business_outcomes_map_to_client_errors() {
        assert_eq!(
            AppError::from(ServiceError::NotFound { entity: "session" }).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(ServiceError::PrincipalInactive).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(ServiceError::CredentialRejected("api key revoked")).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn lockout_reports_retry_after() {
        let until = Utc::now() + chrono::Duration::minutes(5);
        match AppError::from(ServiceError::AccountLocked { until }) {
            AppError::TooManyRequests(_, Some(secs)) => assert!(secs > 200 && secs <= 300),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }
}
