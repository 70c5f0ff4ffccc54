//! API key model. Only the fingerprint of a key is ever stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use super::{Metadata, Principal, PrincipalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
    Expired,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for ApiKeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown api key status: {}", other)),
        }
    }
}

text_enum!(ApiKeyStatus);

/// API key entity.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiKey {
    pub api_key_id: Uuid,
    pub org_id: Uuid,
    pub principal_type: PrincipalType,
    pub principal_id: Uuid,
    pub fingerprint: String,
    pub status: ApiKeyStatus,
    #[sqlx(json)]
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    #[sqlx(json)]
    pub annotations: Metadata,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn principal(&self) -> Principal {
        Principal::from_parts(self.principal_type, self.principal_id)
    }

    pub fn is_revoked(&self) -> bool {
        self.status == ApiKeyStatus::Revoked || self.revoked_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ApiKeyStatus::Expired || self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Revocation takes precedence over expiry.
    pub fn revocation_status_at(&self, now: DateTime<Utc>) -> RevocationStatus {
        if self.is_revoked() {
            RevocationStatus::Revoked
        } else if self.is_expired_at(now) {
            RevocationStatus::Expired
        } else {
            RevocationStatus::Active
        }
    }
}

/// Input for persisting a freshly issued key.
#[derive(Debug, Clone)]
pub struct CreateApiKey {
    pub api_key_id: Option<Uuid>,
    pub org_id: Uuid,
    pub principal: Principal,
    pub fingerprint: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub annotations: Metadata,
}

/// Outcome of a fingerprint-keyed validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationStatus {
    Active,
    Revoked,
    Expired,
    /// No key with this fingerprint exists.
    Unknown,
}

impl RevocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(status: ApiKeyStatus, expires_at: Option<DateTime<Utc>>) -> ApiKey {
        let now = Utc::now();
        ApiKey {
            api_key_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            principal_type: PrincipalType::ServiceAccount,
            principal_id: Uuid::new_v4(),
            fingerprint: "fp".to_string(),
            status,
            scopes: vec!["inference:invoke".to_string()],
            issued_at: now,
            revoked_at: (status == ApiKeyStatus::Revoked).then_some(now),
            expires_at,
            last_used_at: None,
            annotations: Metadata::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn revoked_wins_over_expired() {
        let now = Utc::now();
        let k = key(ApiKeyStatus::Revoked, Some(now - Duration::days(1)));
        assert_eq!(k.revocation_status_at(now), RevocationStatus::Revoked);
    }

    #[test]
    fn past_expiry_is_expired_even_when_status_active() {
        let now = Utc::now();
        let k = key(ApiKeyStatus::Active, Some(now - Duration::seconds(1)));
        assert_eq!(k.revocation_status_at(now), RevocationStatus::Expired);
        assert!(!k.revocation_status_at(now).is_valid());
    }

    #[test]
    fn key_without_expiry_stays_active() {
        let k = key(ApiKeyStatus::Active, None);
        assert!(k
            .revocation_status_at(Utc::now() + Duration::days(3650))
            .is_valid());
        assert_eq!(k.principal(), Principal::ServiceAccount(k.principal_id));
    }
}
