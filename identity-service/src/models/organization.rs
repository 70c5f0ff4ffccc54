//! Organization model: the tenant root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use super::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgStatus {
    Active,
    Suspended,
}

impl OrgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for OrgStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown org status: {}", other)),
        }
    }
}

text_enum!(OrgStatus);

/// Whether the org's configuration is reconciled from a Git repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclarativeMode {
    #[default]
    Disabled,
    Enabled,
}

impl DeclarativeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
        }
    }
}

impl FromStr for DeclarativeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "enabled" => Ok(Self::Enabled),
            other => Err(format!("unknown declarative mode: {}", other)),
        }
    }
}

text_enum!(DeclarativeMode);

/// Organization entity.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Organization {
    pub org_id: Uuid,
    pub slug: String,
    pub name: String,
    pub status: OrgStatus,
    pub billing_owner_user_id: Option<Uuid>,
    pub budget_policy_id: Option<Uuid>,
    pub declarative_mode: DeclarativeMode,
    pub declarative_repo_url: Option<String>,
    pub declarative_branch: Option<String>,
    pub declarative_last_commit: Option<String>,
    #[sqlx(json)]
    pub mfa_required_roles: Vec<String>,
    #[sqlx(json)]
    pub metadata: Metadata,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn is_active(&self) -> bool {
        self.status == OrgStatus::Active && self.deleted_at.is_none()
    }
}

/// Input for creating an organization.
#[derive(Debug, Clone)]
pub struct CreateOrg {
    /// Caller-chosen id; generated when absent.
    pub org_id: Option<Uuid>,
    pub slug: String,
    pub name: String,
    pub status: OrgStatus,
    pub billing_owner_user_id: Option<Uuid>,
    pub budget_policy_id: Option<Uuid>,
    pub declarative_mode: DeclarativeMode,
    pub declarative_repo_url: Option<String>,
    pub declarative_branch: Option<String>,
    pub mfa_required_roles: Vec<String>,
    pub metadata: Metadata,
}

impl CreateOrg {
    pub fn new(slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            org_id: None,
            slug: slug.into(),
            name: name.into(),
            status: OrgStatus::Active,
            billing_owner_user_id: None,
            budget_policy_id: None,
            declarative_mode: DeclarativeMode::Disabled,
            declarative_repo_url: None,
            declarative_branch: None,
            mfa_required_roles: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

/// Full replacement of an organization's mutable fields. The slug is immutable.
#[derive(Debug, Clone)]
pub struct UpdateOrg {
    pub org_id: Uuid,
    pub expected_version: i64,
    pub name: String,
    pub status: OrgStatus,
    pub billing_owner_user_id: Option<Uuid>,
    pub budget_policy_id: Option<Uuid>,
    pub declarative_mode: DeclarativeMode,
    pub declarative_repo_url: Option<String>,
    pub declarative_branch: Option<String>,
    pub declarative_last_commit: Option<String>,
    pub mfa_required_roles: Vec<String>,
    pub metadata: Metadata,
}

impl UpdateOrg {
    /// Start an update from the last-read row, carrying its version.
    pub fn from_current(org: &Organization) -> Self {
        Self {
            org_id: org.org_id,
            expected_version: org.version,
            name: org.name.clone(),
            status: org.status,
            billing_owner_user_id: org.billing_owner_user_id,
            budget_policy_id: org.budget_policy_id,
            declarative_mode: org.declarative_mode,
            declarative_repo_url: org.declarative_repo_url.clone(),
            declarative_branch: org.declarative_branch.clone(),
            declarative_last_commit: org.declarative_last_commit.clone(),
            mfa_required_roles: org.mfa_required_roles.clone(),
            metadata: org.metadata.clone(),
        }
    }
}
