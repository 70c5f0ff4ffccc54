//! User model - human principals scoped to one organization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use super::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Invited,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invited => "invited",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "invited" => Ok(Self::Invited),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown user status: {}", other)),
        }
    }
}

text_enum!(UserStatus);

/// User entity. Secret-bearing columns are never serialized.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub status: UserStatus,
    pub mfa_enrolled: bool,
    #[sqlx(json)]
    pub mfa_methods: Vec<String>,
    #[serde(skip_serializing)]
    pub mfa_secret: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub lockout_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    #[sqlx(json)]
    pub recovery_tokens: Vec<String>,
    pub external_idp_id: Option<String>,
    #[sqlx(json)]
    pub metadata: Metadata,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active && self.deleted_at.is_none()
    }

    /// Durable lockout recorded on the row, independent of the cache tier.
    pub fn is_locked_out(&self) -> bool {
        self.lockout_until.is_some_and(|until| until > Utc::now())
    }
}

/// Input for creating a user.
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub user_id: Option<Uuid>,
    pub org_id: Uuid,
    pub email: String,
    pub display_name: String,
    /// Already-hashed password; the store never sees plaintext.
    pub password_hash: String,
    pub status: UserStatus,
    pub external_idp_id: Option<String>,
    pub metadata: Metadata,
}

impl CreateUser {
    pub fn new(
        org_id: Uuid,
        email: impl Into<String>,
        display_name: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            user_id: None,
            org_id,
            email: email.into(),
            display_name: display_name.into(),
            password_hash: password_hash.into(),
            status: UserStatus::Active,
            external_idp_id: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateUserProfile {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub expected_version: i64,
    pub display_name: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct UpdateUserStatus {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub expected_version: i64,
    pub status: UserStatus,
    pub lockout_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UpdateUserMfa {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub expected_version: i64,
    pub mfa_enrolled: bool,
    pub mfa_methods: Vec<String>,
    pub mfa_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockout_in_the_past_does_not_lock() {
        let mut user = sample_user();
        user.lockout_until = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(!user.is_locked_out());
        user.lockout_until = Some(Utc::now() + chrono::Duration::minutes(1));
        assert!(user.is_locked_out());
    }

    #[test]
    fn secrets_are_not_serialized() {
        let json = serde_json::to_value(sample_user()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert!(json.get("mfa_secret").is_none());
        assert!(json.get("recovery_tokens").is_none());
        assert_eq!(json["status"], "active");
    }

    fn sample_user() -> User {
        let now = Utc::now();
        User {
            user_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            email: "admin@acme.io".to_string(),
            display_name: "Admin".to_string(),
            password_hash: "$argon2id$v=19$m=19456,t=2,p=1$abc$def".to_string(),
            status: UserStatus::Active,
            mfa_enrolled: false,
            mfa_methods: Vec::new(),
            mfa_secret: Some("JBSWY3DPEHPK3PXP".to_string()),
            last_login_at: None,
            lockout_until: None,
            recovery_tokens: vec!["hashed".to_string()],
            external_idp_id: None,
            metadata: Metadata::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
