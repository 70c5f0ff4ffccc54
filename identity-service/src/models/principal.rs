//! Credential holders: a human user or a service account.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Discriminator stored in `api_keys.principal_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    User,
    ServiceAccount,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ServiceAccount => "service_account",
        }
    }
}

impl FromStr for PrincipalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "service_account" => Ok(Self::ServiceAccount),
            other => Err(format!("unknown principal type: {}", other)),
        }
    }
}

text_enum!(PrincipalType);

/// The holder of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Principal {
    User(Uuid),
    ServiceAccount(Uuid),
}

impl Principal {
    pub fn from_parts(kind: PrincipalType, id: Uuid) -> Self {
        match kind {
            PrincipalType::User => Self::User(id),
            PrincipalType::ServiceAccount => Self::ServiceAccount(id),
        }
    }

    pub fn kind(&self) -> PrincipalType {
        match self {
            Self::User(_) => PrincipalType::User,
            Self::ServiceAccount(_) => PrincipalType::ServiceAccount,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::User(id) | Self::ServiceAccount(id) => *id,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_discriminator() {
        assert!("users".parse::<PrincipalType>().is_err());
        assert!("ServiceAccount".parse::<PrincipalType>().is_err());
        assert_eq!(
            "service_account".parse::<PrincipalType>(),
            Ok(PrincipalType::ServiceAccount)
        );
    }

    #[test]
    fn principal_serializes_as_tagged_union() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(Principal::ServiceAccount(id)).unwrap();
        assert_eq!(json["type"], "service_account");
        assert_eq!(json["id"], id.to_string());
    }

    #[test]
    fn from_parts_preserves_kind_and_id() {
        let id = Uuid::new_v4();
        let principal = Principal::from_parts(PrincipalType::User, id);
        assert_eq!(principal, Principal::User(id));
        assert_eq!(principal.to_string(), format!("user:{}", id));
    }
}
