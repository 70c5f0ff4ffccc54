//! Audit event model - append-only record of identity mutations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{Metadata, Principal, PrincipalType};

/// Who performed the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    ServiceAccount,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ServiceAccount => "service_account",
            Self::System => "system",
        }
    }
}

impl From<PrincipalType> for ActorType {
    fn from(kind: PrincipalType) -> Self {
        match kind {
            PrincipalType::User => Self::User,
            PrincipalType::ServiceAccount => Self::ServiceAccount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    #[serde(rename = "org.create")]
    OrgCreate,
    #[serde(rename = "org.update")]
    OrgUpdate,
    #[serde(rename = "org.delete")]
    OrgDelete,
    #[serde(rename = "user.create")]
    UserCreate,
    #[serde(rename = "user.update")]
    UserUpdate,
    #[serde(rename = "user.delete")]
    UserDelete,
    #[serde(rename = "user.lockout")]
    UserLockout,
    #[serde(rename = "service_account.create")]
    ServiceAccountCreate,
    #[serde(rename = "service_account.update")]
    ServiceAccountUpdate,
    #[serde(rename = "service_account.delete")]
    ServiceAccountDelete,
    #[serde(rename = "api_key.issue")]
    ApiKeyIssue,
    #[serde(rename = "api_key.revoke")]
    ApiKeyRevoke,
    #[serde(rename = "api_key.annotate")]
    ApiKeyAnnotate,
    #[serde(rename = "session.create")]
    SessionCreate,
    #[serde(rename = "session.revoke")]
    SessionRevoke,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrgCreate => "org.create",
            Self::OrgUpdate => "org.update",
            Self::OrgDelete => "org.delete",
            Self::UserCreate => "user.create",
            Self::UserUpdate => "user.update",
            Self::UserDelete => "user.delete",
            Self::UserLockout => "user.lockout",
            Self::ServiceAccountCreate => "service_account.create",
            Self::ServiceAccountUpdate => "service_account.update",
            Self::ServiceAccountDelete => "service_account.delete",
            Self::ApiKeyIssue => "api_key.issue",
            Self::ApiKeyRevoke => "api_key.revoke",
            Self::ApiKeyAnnotate => "api_key.annotate",
            Self::SessionCreate => "session.create",
            Self::SessionRevoke => "session.revoke",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Org,
    User,
    ServiceAccount,
    ApiKey,
    Session,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Org => "org",
            Self::User => "user",
            Self::ServiceAccount => "service_account",
            Self::ApiKey => "api_key",
            Self::Session => "session",
        }
    }
}

/// A single audit record. Never carries secret material.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub metadata: Metadata,
    /// Hex SHA-256 over the serialized event with this field empty.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        org_id: Uuid,
        actor: Actor,
        action: AuditAction,
        target_type: TargetType,
        target_id: Option<Uuid>,
    ) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            org_id,
            actor_id: actor.id,
            actor_type: actor.kind,
            action,
            target_type,
            target_id,
            ip_address: None,
            user_agent: None,
            metadata: Metadata::new(),
            hash: String::new(),
            created_at: Utc::now(),
        };
        event.hash = event.compute_hash();
        event
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self.hash = self.compute_hash();
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self.hash = self.compute_hash();
        self
    }

    pub fn compute_hash(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.hash = String::new();
        let payload = serde_json::to_vec(&unsigned).unwrap_or_else(|_| {
            format!("{}:{}:{}", unsigned.event_id, unsigned.org_id, unsigned.action).into_bytes()
        });
        hex::encode(Sha256::digest(payload))
    }

    /// True when the event has not been altered since it was built.
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// The acting identity recorded on an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub kind: ActorType,
}

impl Actor {
    pub fn user(id: Uuid) -> Self {
        Self {
            id: Some(id),
            kind: ActorType::User,
        }
    }

    pub fn service_account(id: Uuid) -> Self {
        Self {
            id: Some(id),
            kind: ActorType::ServiceAccount,
        }
    }

    pub fn system() -> Self {
        Self {
            id: None,
            kind: ActorType::System,
        }
    }
}

impl From<Principal> for Actor {
    fn from(principal: Principal) -> Self {
        Self {
            id: Some(principal.id()),
            kind: principal.kind().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_match_wire_format() {
        let json = serde_json::to_value(AuditAction::ApiKeyRevoke).unwrap();
        assert_eq!(json, "api_key.revoke");
        assert_eq!(AuditAction::SessionRevoke.as_str(), "session.revoke");
    }

    #[test]
    fn hash_tracks_payload_changes() {
        let event = AuditEvent::new(
            Uuid::new_v4(),
            Actor::system(),
            AuditAction::UserLockout,
            TargetType::User,
            Some(Uuid::new_v4()),
        )
        .with_metadata("failed_attempts", 5);
        assert_eq!(event.hash.len(), 64);
        assert!(event.verify_hash());

        let mut tampered = event.clone();
        tampered.metadata.insert("failed_attempts".to_string(), 1.into());
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn actor_from_principal_keeps_kind() {
        let id = Uuid::new_v4();
        let actor = Actor::from(Principal::ServiceAccount(id));
        assert_eq!(actor.kind, ActorType::ServiceAccount);
        assert_eq!(actor.id, Some(id));
    }
}
