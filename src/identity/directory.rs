//! Subjects and their verified external identities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::storage::tables::{Datastore, StoreError, Tables};

use super::provider::ExternalIdentity;

/// Internal account anchor; one per linked account reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub linked_account_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectIdentity {
    pub id: String,
    pub subject_id: String,
    pub issuer_provider: String,
    pub external_id: String,
    pub external_username: String,
    pub verified_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingChange {
    Created,
    /// The pair was already bound to this subject; only `verified_at` moved.
    Refreshed,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub subject: Subject,
    pub identity: SubjectIdentity,
    pub change: BindingChange,
}

#[derive(Debug, Clone)]
pub enum Unbinding {
    Revoked(SubjectIdentity),
    AlreadyRevoked(SubjectIdentity),
}

impl Unbinding {
    pub fn identity(&self) -> &SubjectIdentity {
        match self {
            Unbinding::Revoked(i) | Unbinding::AlreadyRevoked(i) => i,
        }
    }
}

fn conflict(provider: &str) -> AppError {
    AppError::conflict(
        "identity_conflict".to_string(),
        format!("This {} account is already linked to another account.", provider),
    )
}

fn new_subject(user_id: &str) -> Subject {
    Subject { id: uuid::Uuid::new_v4().to_string(), linked_account_ref: user_id.to_string(), created_at: Utc::now() }
}

fn ensure_subject(t: &mut Tables, user_id: &str) -> Result<Subject, StoreError> {
    if let Some(s) = t.subject_for_account(user_id) {
        return Ok(s.clone());
    }
    let s = new_subject(user_id);
    t.insert_subject(s.clone())?;
    debug!(target: "trustlink::directory", subject_id = %s.id, "subject created");
    Ok(s)
}

#[derive(Clone)]
pub struct IdentityDirectory {
    store: Datastore,
}

impl IdentityDirectory {
    pub fn new(store: Datastore) -> Self { Self { store } }

    pub fn find_or_create_subject(&self, user_id: &str) -> AppResult<Subject> {
        Ok(self.store.write(|t| ensure_subject(t, user_id))?)
    }

    pub fn find_subject(&self, subject_id: &str) -> Option<Subject> {
        self.store.read(|t| t.subjects.get(subject_id).cloned())
    }

    pub fn subject_for_account(&self, user_id: &str) -> Option<Subject> {
        self.store.read(|t| t.subject_for_account(user_id).cloned())
    }

    /// The non-revoked binding for the pair.
    pub fn find_identity(&self, provider: &str, external_id: &str) -> Option<SubjectIdentity> {
        self.store.read(|t| t.active_identity(provider, external_id).cloned())
    }

    pub fn identities_for_subject(&self, subject_id: &str, include_revoked: bool) -> Vec<SubjectIdentity> {
        self.store.read(|t| {
            t.identities_for_subject(subject_id)
                .into_iter()
                .filter(|i| include_revoked || i.revoked_at.is_none())
                .cloned()
                .collect()
        })
    }

    /// Bind `identity` from `provider` to the subject of `user_id`, creating the subject
    /// if needed. One transaction: a conflict leaves both the subject table and the
    /// existing binding untouched.
    pub fn upsert_identity(&self, user_id: &str, provider: &str, identity: &ExternalIdentity) -> AppResult<Binding> {
        let binding = self.store.write(|t| -> AppResult<Binding> {
            if let Some(existing) = t.active_identity(provider, &identity.external_id) {
                let owner = t.subjects.get(&existing.subject_id).map(|s| s.linked_account_ref.as_str());
                if owner != Some(user_id) {
                    return Err(conflict(provider));
                }
            }
            let subject = ensure_subject(t, user_id)?;
            let now = Utc::now();
            if let Some(existing) = t.active_identity_mut(provider, &identity.external_id) {
                existing.verified_at = now;
                existing.external_username = identity.external_username.clone();
                existing.metadata = identity.metadata.clone();
                return Ok(Binding { subject, identity: existing.clone(), change: BindingChange::Refreshed });
            }
            let row = SubjectIdentity {
                id: uuid::Uuid::new_v4().to_string(),
                subject_id: subject.id.clone(),
                issuer_provider: provider.to_string(),
                external_id: identity.external_id.clone(),
                external_username: identity.external_username.clone(),
                verified_at: now,
                revoked_at: None,
                metadata: identity.metadata.clone(),
            };
            t.insert_identity(row.clone()).map_err(|e| match e {
                StoreError::UniqueViolation { .. } => conflict(provider),
                other => other.into(),
            })?;
            Ok(Binding { subject, identity: row, change: BindingChange::Created })
        })?;
        debug!(
            target: "trustlink::directory",
            provider,
            subject_id = %binding.subject.id,
            change = ?binding.change,
            "identity bound"
        );
        Ok(binding)
    }

    /// Revoke the binding for the pair. Revoking an already revoked pair is reported, not an error.
    pub fn revoke_identity(&self, provider: &str, external_id: &str) -> AppResult<Unbinding> {
        self.revoke_where(provider, external_id, None)
    }

    /// Like `revoke_identity`, but the pair must belong to the subject of `user_id`.
    /// Someone else's binding reads as not found.
    pub fn revoke_owned_identity(&self, user_id: &str, provider: &str, external_id: &str) -> AppResult<Unbinding> {
        self.revoke_where(provider, external_id, Some(user_id))
    }

    fn revoke_where(&self, provider: &str, external_id: &str, owner: Option<&str>) -> AppResult<Unbinding> {
        let not_found = || {
            AppError::not_found("identity_not_found".to_string(), format!("no {} identity {}", provider, external_id))
        };
        self.store.write(|t| -> AppResult<Unbinding> {
            let Some(latest) = t.latest_identity(provider, external_id) else { return Err(not_found()) };
            if let Some(user_id) = owner {
                let account = t.subjects.get(&latest.subject_id).map(|s| s.linked_account_ref.as_str());
                if account != Some(user_id) {
                    return Err(not_found());
                }
            }
            if latest.revoked_at.is_some() {
                return Ok(Unbinding::AlreadyRevoked(latest.clone()));
            }
            Ok(Unbinding::Revoked(t.revoke_identity(provider, external_id, Utc::now())?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ext(id: &str) -> ExternalIdentity {
        ExternalIdentity { external_id: id.into(), external_username: format!("name{}", id), metadata: json!({}) }
    }

    #[test]
    fn subject_is_created_once_per_account() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        let a = dir.find_or_create_subject("u1").unwrap();
        let b = dir.find_or_create_subject("u1").unwrap();
        assert_eq!(a, b);
        assert_ne!(dir.find_or_create_subject("u2").unwrap().id, a.id);
        assert_eq!(dir.find_subject(&a.id).unwrap().linked_account_ref, "u1");
    }

    #[test]
    fn relink_same_subject_is_idempotent() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        let first = dir.upsert_identity("u1", "github", &ext("42")).unwrap();
        assert_eq!(first.change, BindingChange::Created);
        let again = dir.upsert_identity("u1", "github", &ext("42")).unwrap();
        assert_eq!(again.change, BindingChange::Refreshed);
        assert_eq!(again.identity.id, first.identity.id);
        assert!(again.identity.verified_at >= first.identity.verified_at);
        assert_eq!(dir.identities_for_subject(&first.subject.id, true).len(), 1);
    }

    #[test]
    fn conflicting_link_mutates_nothing() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        let a = dir.upsert_identity("userA", "github", &ext("42")).unwrap();
        let err = dir.upsert_identity("userB", "github", &ext("42")).unwrap_err();
        assert_eq!(err.http_status(), 409);
        // userB's subject was not lazily created and A keeps the binding
        assert!(dir.subject_for_account("userB").is_none());
        let still = dir.find_identity("github", "42").unwrap();
        assert_eq!(still.subject_id, a.subject.id);
        assert_eq!(still.id, a.identity.id);
    }

    #[test]
    fn revoke_then_relink_elsewhere() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        dir.upsert_identity("userA", "github", &ext("42")).unwrap();
        assert!(matches!(dir.revoke_identity("github", "42").unwrap(), Unbinding::Revoked(_)));
        assert!(matches!(dir.revoke_identity("github", "42").unwrap(), Unbinding::AlreadyRevoked(_)));
        assert!(dir.find_identity("github", "42").is_none());

        let b = dir.upsert_identity("userB", "github", &ext("42")).unwrap();
        assert_eq!(b.change, BindingChange::Created);
        assert_eq!(dir.find_identity("github", "42").unwrap().subject_id, b.subject.id);
    }

    #[test]
    fn owned_revoke_hides_other_accounts() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        dir.upsert_identity("userA", "github", &ext("42")).unwrap();
        assert_eq!(dir.revoke_owned_identity("userB", "github", "42").unwrap_err().http_status(), 404);
        assert!(dir.find_identity("github", "42").is_some());
        assert!(matches!(dir.revoke_owned_identity("userA", "github", "42").unwrap(), Unbinding::Revoked(_)));
    }

    #[test]
    fn revoke_unknown_is_not_found() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        assert_eq!(dir.revoke_identity("github", "nope").unwrap_err().http_status(), 404);
    }

    #[test]
    fn at_most_one_active_binding_under_contention() {
        let dir = IdentityDirectory::new(Datastore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.clone();
                std::thread::spawn(move || dir.upsert_identity(&format!("user{}", i), "discord", &ext("7")).is_ok())
            })
            .collect();
        let ok = handles.into_iter().filter_map(|h| h.join().ok()).filter(|b| *b).count();
        assert_eq!(ok, 1);
        let bound = dir.find_identity("discord", "7").unwrap();
        assert_eq!(dir.identities_for_subject(&bound.subject_id, true).len(), 1);
    }
}
