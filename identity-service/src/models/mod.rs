//! Domain models for identity-service.
//!
//! Row structs map one-to-one onto the tables in `migrations/`; the
//! `Create*` / `Update*` structs are the inputs accepted by the tenant store.

/// Implements sqlx text encoding for a string-backed enum that provides
/// `as_str()` and `FromStr<Err = String>`.
///
/// The column stays `TEXT`, while reads reject values outside the enum
/// instead of passing them through as loose strings.
macro_rules! text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                raw.parse::<$ty>().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

mod api_key;
mod audit_event;
mod organization;
mod principal;
mod service_account;
mod session;
mod user;

pub use api_key::{ApiKey, ApiKeyStatus, CreateApiKey, RevocationStatus};
pub use audit_event::{Actor, ActorType, AuditAction, AuditEvent, TargetType};
pub use organization::{CreateOrg, DeclarativeMode, OrgStatus, Organization, UpdateOrg};
pub use principal::{Principal, PrincipalType};
pub use service_account::{
    CreateServiceAccount, ServiceAccount, ServiceAccountStatus, UpdateServiceAccount,
};
pub use session::{CreateSession, Session};
pub use user::{
    CreateUser, UpdateUserMfa, UpdateUserProfile, UpdateUserStatus, User, UserStatus,
};

/// Free-form JSON object stored in `metadata` / `annotations` columns.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
