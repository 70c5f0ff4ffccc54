//! Service account model - non-human principals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use super::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAccountStatus {
    Active,
    Suspended,
}

impl ServiceAccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for ServiceAccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown service account status: {}", other)),
        }
    }
}

text_enum!(ServiceAccountStatus);

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServiceAccount {
    pub service_account_id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: ServiceAccountStatus,
    #[sqlx(json)]
    pub metadata: Metadata,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServiceAccount {
    pub fn is_active(&self) -> bool {
        self.status == ServiceAccountStatus::Active && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CreateServiceAccount {
    pub service_account_id: Option<Uuid>,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Metadata,
}

impl CreateServiceAccount {
    pub fn new(org_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            service_account_id: None,
            org_id,
            name: name.into(),
            description: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateServiceAccount {
    pub org_id: Uuid,
    pub service_account_id: Uuid,
    pub expected_version: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: ServiceAccountStatus,
    pub metadata: Metadata,
}
