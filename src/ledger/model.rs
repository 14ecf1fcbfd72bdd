use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::audit::ActorType;
use crate::error::{AppError, AppResult};

use super::issuer::Issuer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Revoked,
    /// Only ever read from imported rows; this service derives expiry from `expires_at`.
    Expired,
}

/// Who an entitlement is bound to. Exactly one form per entitlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    Subject(String),
    External(ExternalRef),
}

impl Holder {
    /// Exactly one of the two references must be present and non-blank.
    pub fn from_refs(subject_id: Option<&str>, external_subject_ref: Option<&str>) -> AppResult<Self> {
        let subject_id = subject_id.map(str::trim).filter(|s| !s.is_empty());
        let external = external_subject_ref.map(str::trim).filter(|s| !s.is_empty());
        match (subject_id, external) {
            (Some(s), None) => Ok(Holder::Subject(s.to_string())),
            (None, Some(r)) => Ok(Holder::External(ExternalRef::parse(r)?)),
            (None, None) => Err(AppError::missing_field("subject_id or external_subject_ref")),
            (Some(_), Some(_)) => Err(AppError::user(
                "ambiguous_subject",
                "provide only one of subject_id and external_subject_ref",
            )),
        }
    }
}

/// A raw `platform:id` reference for accounts that have no Subject yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
    pub platform: String,
    pub id: String,
}

impl ExternalRef {
    pub fn new(platform: &str, id: &str) -> AppResult<Self> {
        let platform = platform.trim();
        let id = id.trim();
        if platform.is_empty() { return Err(AppError::missing_field("platform")); }
        if id.is_empty() { return Err(AppError::missing_field("id")); }
        if platform.contains(':') {
            return Err(AppError::user("invalid_external_ref".to_string(), format!("platform may not contain ':': {}", platform)));
        }
        Ok(Self { platform: platform.to_string(), id: id.to_string() })
    }

    /// Split at the first ':'; ids may themselves contain colons.
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.split_once(':') {
            Some((platform, id)) => Self::new(platform, id),
            None => Err(AppError::user(
                "invalid_external_ref".to_string(),
                format!("external_subject_ref must look like <platform>:<id>, got '{}'", raw),
            )),
        }
    }
}

impl std::fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entitlement {
    pub id: String,
    pub issuer_id: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub external_subject_ref: Option<String>,
    pub entitlement_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub data: JsonValue,
    pub status: EntitlementStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revocation_reason: Option<String>,
}

impl Entitlement {
    pub fn holder(&self) -> Option<Holder> {
        match (&self.subject_id, &self.external_subject_ref) {
            (Some(s), None) => Some(Holder::Subject(s.clone())),
            (None, Some(r)) => ExternalRef::parse(r).ok().map(Holder::External),
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == EntitlementStatus::Expired || self.expires_at.is_some_and(|exp| exp < now)
    }

    /// Revocation wins over expiry; neither is ever written back to `status`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> EntitlementStatus {
        if self.status == EntitlementStatus::Revoked {
            EntitlementStatus::Revoked
        } else if self.is_expired_at(now) {
            EntitlementStatus::Expired
        } else {
            EntitlementStatus::Active
        }
    }

    /// Listing view; issuer fields are filled when the issuer is known.
    pub fn summary(&self, issuer: Option<&Issuer>) -> JsonValue {
        json!({
            "id": self.id,
            "type": self.entitlement_type,
            "scope": self.scope,
            "data": self.data,
            "issuer": issuer.map(|i| json!({"id": i.id, "name": i.name, "class": i.class})),
            "issued_at": self.created_at,
            "expires_at": self.expires_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Issued,
    Verified,
    Revoked,
}

/// Append-only lifecycle record. Never mutated once pushed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitlementEvent {
    pub entitlement_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub actor_type: ActorType,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    NotFound,
    Revoked,
    Expired,
}

#[derive(Debug, Clone)]
pub enum Verification {
    Valid { entitlement: Entitlement, issuer: Option<Issuer> },
    Invalid { reason: InvalidReason, entitlement: Option<Entitlement> },
}

impl Verification {
    pub fn is_valid(&self) -> bool { matches!(self, Verification::Valid { .. }) }

    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            Verification::Valid { .. } => None,
            Verification::Invalid { reason, .. } => Some(*reason),
        }
    }

    /// Response body for the verify endpoint.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Verification::Valid { entitlement, issuer } => json!({
                "valid": true,
                "entitlement": entitlement.summary(issuer.as_ref()),
            }),
            Verification::Invalid { reason: InvalidReason::Revoked, entitlement: Some(e) } => json!({
                "valid": false,
                "reason": InvalidReason::Revoked,
                "revoked_at": e.revoked_at,
                "revocation_reason": e.revocation_reason,
            }),
            Verification::Invalid { reason: InvalidReason::Expired, entitlement: Some(e) } => json!({
                "valid": false,
                "reason": InvalidReason::Expired,
                "expires_at": e.expires_at,
            }),
            Verification::Invalid { reason, .. } => json!({ "valid": false, "reason": reason }),
        }
    }
}
