//! Issue, verify, resolve and revoke entitlements.
//!
//! Every operation runs as one `Datastore` transaction, so a Revoke that has
//! returned is visible to every later Verify. Verify only appends an event; the
//! entitlement row is never touched by it.

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::audit::{ActorType, AuditAction, AuditLog, AuditLogEntry};
use crate::error::{AppError, AppResult};
use crate::storage::tables::{Datastore, Tables};

use super::issuer::Issuer;
use super::model::{
    Entitlement, EntitlementEvent, EntitlementStatus, EventType, ExternalRef, Holder, InvalidReason, Verification,
};

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub holder: Holder,
    pub entitlement_type: String,
    pub scope: String,
    pub data: JsonValue,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum ResolveQuery {
    Subject(String),
    External(ExternalRef),
}

impl ResolveQuery {
    /// `subject_id` wins when both forms are present.
    pub fn from_params(subject_id: Option<&str>, platform: Option<&str>, id: Option<&str>) -> AppResult<Self> {
        if let Some(s) = subject_id.map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(ResolveQuery::Subject(s.to_string()));
        }
        match (platform, id) {
            (Some(p), Some(i)) => Ok(ResolveQuery::External(ExternalRef::new(p, i)?)),
            _ => Err(AppError::missing_field("subject_id or platform+id")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Revocation {
    Revoked(Entitlement),
    /// Already revoked before this call; the original reason and time are kept.
    AlreadyRevoked(Entitlement),
}

impl Revocation {
    pub fn entitlement(&self) -> &Entitlement {
        match self {
            Revocation::Revoked(e) | Revocation::AlreadyRevoked(e) => e,
        }
    }
}

fn check_issuer<'a>(t: &'a Tables, issuer_id: &str) -> AppResult<&'a Issuer> {
    match t.issuers.get(issuer_id) {
        Some(i) if i.is_active => Ok(i),
        Some(_) => Err(AppError::auth("issuer_inactive".to_string(), format!("issuer {} is not active", issuer_id))),
        None => Err(AppError::auth("unknown_issuer".to_string(), format!("unknown issuer {}", issuer_id))),
    }
}

fn entitlement_not_found(id: &str) -> AppError {
    AppError::not_found("entitlement_not_found".to_string(), format!("entitlement {} not found", id))
}

#[derive(Clone)]
pub struct EntitlementLedger {
    store: Datastore,
    audit: AuditLog,
}

impl EntitlementLedger {
    pub fn new(store: Datastore, audit: AuditLog) -> Self { Self { store, audit } }

    /// Insert or replace issuers; used to seed reference data at startup.
    pub fn upsert_issuers(&self, issuers: impl IntoIterator<Item = Issuer>) -> usize {
        let issuers: Vec<Issuer> = issuers.into_iter().collect();
        let n = issuers.len();
        self.store.update(|t| {
            for i in issuers {
                t.issuers.insert(i.id.clone(), i);
            }
        });
        n
    }

    pub fn issuer_count(&self) -> usize { self.store.read(|t| t.issuers.len()) }

    pub fn get_issuer(&self, issuer_id: &str) -> AppResult<Issuer> {
        self.store
            .read(|t| t.issuers.get(issuer_id).cloned())
            .ok_or_else(|| AppError::not_found("issuer_not_found".to_string(), format!("issuer {} not found", issuer_id)))
    }

    pub fn get(&self, entitlement_id: &str) -> Option<Entitlement> {
        self.store.read(|t| t.entitlements.get(entitlement_id).cloned())
    }

    pub fn events(&self, entitlement_id: &str) -> Vec<EntitlementEvent> {
        self.store.read(|t| t.events_for(entitlement_id).into_iter().cloned().collect())
    }

    pub fn issue(&self, issuer_id: &str, req: IssueRequest) -> AppResult<Entitlement> {
        if req.entitlement_type.trim().is_empty() {
            return Err(AppError::missing_field("entitlement_type"));
        }
        let ent = self.store.write(|t| -> AppResult<Entitlement> {
            let issuer = check_issuer(t, issuer_id)?;
            if !issuer.permits_scope(&req.scope) {
                return Err(AppError::auth(
                    "scope_not_permitted".to_string(),
                    format!("issuer {} may not grant scope '{}'", issuer_id, req.scope),
                ));
            }
            let (subject_id, external_subject_ref) = match &req.holder {
                Holder::Subject(s) => {
                    if !t.subjects.contains_key(s) {
                        return Err(AppError::not_found("subject_not_found".to_string(), format!("subject {} not found", s)));
                    }
                    (Some(s.clone()), None)
                }
                Holder::External(r) => (None, Some(r.to_string())),
            };
            let now = Utc::now();
            let ent = Entitlement {
                id: uuid::Uuid::new_v4().to_string(),
                issuer_id: issuer_id.to_string(),
                subject_id,
                external_subject_ref,
                entitlement_type: req.entitlement_type.trim().to_string(),
                scope: req.scope.clone(),
                data: if req.data.is_null() { json!({}) } else { req.data.clone() },
                status: EntitlementStatus::Active,
                created_at: now,
                expires_at: req.expires_at,
                revoked_at: None,
                revocation_reason: None,
            };
            t.insert_entitlement(ent.clone())?;
            t.entitlement_events.push(EntitlementEvent {
                entitlement_id: ent.id.clone(),
                event_type: EventType::Issued,
                actor_id: Some(issuer_id.to_string()),
                actor_type: ActorType::Issuer,
                reason: None,
                timestamp: now,
            });
            Ok(ent)
        })?;
        self.audit.record(AuditLogEntry::success(
            AuditAction::IssueEntitlement,
            issuer_id,
            ActorType::Issuer,
            "entitlement",
            &ent.id,
            json!({
                "entitlement_type": ent.entitlement_type,
                "scope": ent.scope,
                "subject_id": ent.subject_id,
                "external_subject_ref": ent.external_subject_ref,
                "expires_at": ent.expires_at,
            }),
        ));
        info!(target: "trustlink::ledger", entitlement_id = %ent.id, issuer_id, kind = %ent.entitlement_type, "entitlement issued");
        Ok(ent)
    }

    /// Authoritative validity check. Only a valid result appends a `verified` event.
    pub fn verify(&self, entitlement_id: &str) -> Verification {
        let now = Utc::now();
        let verification = self.store.update(|t| {
            let Some(ent) = t.entitlements.get(entitlement_id).cloned() else {
                return Verification::Invalid { reason: InvalidReason::NotFound, entitlement: None };
            };
            match ent.effective_status(now) {
                EntitlementStatus::Revoked => {
                    return Verification::Invalid { reason: InvalidReason::Revoked, entitlement: Some(ent) }
                }
                EntitlementStatus::Expired => {
                    return Verification::Invalid { reason: InvalidReason::Expired, entitlement: Some(ent) }
                }
                EntitlementStatus::Active => {}
            }
            t.entitlement_events.push(EntitlementEvent {
                entitlement_id: ent.id.clone(),
                event_type: EventType::Verified,
                actor_id: None,
                actor_type: ActorType::System,
                reason: Some("API verification".to_string()),
                timestamp: now,
            });
            let issuer = t.issuers.get(&ent.issuer_id).cloned();
            Verification::Valid { entitlement: ent, issuer }
        });
        debug!(target: "trustlink::ledger", entitlement_id, valid = verification.is_valid(), reason = ?verification.reason(), "verify");
        verification
    }

    /// Entitlements whose stored status is `active`. Time expiry is not applied here;
    /// callers that need it call `verify` per entitlement.
    pub fn resolve(&self, query: &ResolveQuery) -> Vec<(Entitlement, Option<Issuer>)> {
        let key = match query {
            ResolveQuery::Subject(s) => s.clone(),
            ResolveQuery::External(r) => r.to_string(),
        };
        self.store.read(|t| {
            let mut out: Vec<(Entitlement, Option<Issuer>)> = t
                .entitlements
                .values()
                .filter(|e| e.status == EntitlementStatus::Active)
                .filter(|e| match query {
                    ResolveQuery::Subject(_) => e.subject_id.as_deref() == Some(key.as_str()),
                    ResolveQuery::External(_) => e.external_subject_ref.as_deref() == Some(key.as_str()),
                })
                .map(|e| (e.clone(), t.issuers.get(&e.issuer_id).cloned()))
                .collect();
            out.sort_by(|a, b| a.0.created_at.cmp(&b.0.created_at));
            out
        })
    }

    /// Revoke on behalf of the issuing issuer. A second revoke changes nothing.
    pub fn revoke(&self, issuer_id: &str, entitlement_id: &str, reason: &str) -> AppResult<Revocation> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::missing_field("reason"));
        }
        let revocation = self.store.write(|t| -> AppResult<Revocation> {
            check_issuer(t, issuer_id)?;
            let now = Utc::now();
            let ent = t.entitlements.get_mut(entitlement_id).ok_or_else(|| entitlement_not_found(entitlement_id))?;
            if ent.issuer_id != issuer_id {
                return Err(AppError::auth(
                    "issuer_mismatch".to_string(),
                    format!("entitlement {} was not issued by {}", entitlement_id, issuer_id),
                ));
            }
            if ent.status == EntitlementStatus::Revoked {
                return Ok(Revocation::AlreadyRevoked(ent.clone()));
            }
            ent.status = EntitlementStatus::Revoked;
            ent.revoked_at = Some(now);
            ent.revocation_reason = Some(reason.to_string());
            let snapshot = ent.clone();
            t.entitlement_events.push(EntitlementEvent {
                entitlement_id: entitlement_id.to_string(),
                event_type: EventType::Revoked,
                actor_id: Some(issuer_id.to_string()),
                actor_type: ActorType::Issuer,
                reason: Some(reason.to_string()),
                timestamp: now,
            });
            Ok(Revocation::Revoked(snapshot))
        })?;
        let status = match revocation {
            Revocation::Revoked(_) => "success",
            Revocation::AlreadyRevoked(_) => "noop",
        };
        self.audit.record(
            AuditLogEntry::success(
                AuditAction::RevokeEntitlement,
                issuer_id,
                ActorType::Issuer,
                "entitlement",
                entitlement_id,
                json!({"status": "revoked", "reason": reason}),
            )
            .with_status(status),
        );
        info!(target: "trustlink::ledger", entitlement_id, issuer_id, status, "entitlement revoked");
        Ok(revocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityDirectory, Subject};
    use chrono::Duration;

    fn issuer(id: &str, scopes: &[&str]) -> Issuer {
        Issuer {
            id: id.into(),
            name: format!("Issuer {}", id),
            class: "developer".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            public_key: None,
            is_active: true,
            metadata: json!({}),
        }
    }

    struct Fixture {
        ledger: EntitlementLedger,
        audit: AuditLog,
        subject: Subject,
    }

    fn fixture() -> Fixture {
        let store = Datastore::in_memory();
        let audit = AuditLog::new();
        let ledger = EntitlementLedger::new(store.clone(), audit.clone());
        let mut off = issuer("off", &[]);
        off.is_active = false;
        ledger.upsert_issuers([issuer("studio", &[]), issuer("narrow", &["game:1"]), off]);
        let subject = IdentityDirectory::new(store).find_or_create_subject("user-1").unwrap();
        Fixture { ledger, audit, subject }
    }

    fn req(holder: Holder, expires_at: Option<DateTime<Utc>>) -> IssueRequest {
        IssueRequest {
            holder,
            entitlement_type: "premium_pass".into(),
            scope: "game:1".into(),
            data: json!({"tier": "gold"}),
            expires_at,
        }
    }

    #[test]
    fn issue_verify_revoke_scenario() {
        let f = fixture();
        let e = f
            .ledger
            .issue("studio", req(Holder::Subject(f.subject.id.clone()), Some(Utc::now() + Duration::hours(1))))
            .unwrap();
        assert_eq!(e.status, EntitlementStatus::Active);
        assert!(f.ledger.verify(&e.id).is_valid());

        let r = f.ledger.revoke("studio", &e.id, "fraud").unwrap();
        assert!(matches!(r, Revocation::Revoked(_)));
        let v = f.ledger.verify(&e.id);
        assert_eq!(v.reason(), Some(InvalidReason::Revoked));
        assert_eq!(v.to_json()["revocation_reason"], "fraud");

        let actions: Vec<AuditAction> = f.audit.entries().into_iter().map(|a| a.action).collect();
        assert_eq!(actions, vec![AuditAction::IssueEntitlement, AuditAction::RevokeEntitlement]);
    }

    #[test]
    fn verify_is_idempotent_and_appends_events() {
        let f = fixture();
        let e = f.ledger.issue("studio", req(Holder::Subject(f.subject.id.clone()), None)).unwrap();
        for _ in 0..5 {
            assert!(f.ledger.verify(&e.id).is_valid());
        }
        let verified = f.ledger.events(&e.id).iter().filter(|ev| ev.event_type == EventType::Verified).count();
        assert_eq!(verified, 5);
        assert_eq!(f.ledger.get(&e.id).unwrap(), e);
    }

    #[test]
    fn past_expiry_is_invalid_without_write_back() {
        let f = fixture();
        let e = f
            .ledger
            .issue("studio", req(Holder::Subject(f.subject.id.clone()), Some(Utc::now() - Duration::minutes(1))))
            .unwrap();
        let v = f.ledger.verify(&e.id);
        assert_eq!(v.reason(), Some(InvalidReason::Expired));
        assert_eq!(f.ledger.get(&e.id).unwrap().status, EntitlementStatus::Active);
        // resolve lists by stored status only
        assert_eq!(f.ledger.resolve(&ResolveQuery::Subject(f.subject.id.clone())).len(), 1);
        assert!(f.ledger.events(&e.id).iter().all(|ev| ev.event_type != EventType::Verified));
    }

    #[test]
    fn unknown_entitlement_verifies_not_found() {
        let f = fixture();
        assert_eq!(f.ledger.verify("nope").reason(), Some(InvalidReason::NotFound));
    }

    #[test]
    fn resolve_external_reference_until_revoked() {
        let f = fixture();
        let ext = ExternalRef::parse("roblox:555").unwrap();
        let e = f.ledger.issue("studio", req(Holder::External(ext), None)).unwrap();
        assert_eq!(e.external_subject_ref.as_deref(), Some("roblox:555"));
        let q = ResolveQuery::from_params(None, Some("roblox"), Some("555")).unwrap();
        let found = f.ledger.resolve(&q);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id, e.id);
        assert_eq!(found[0].1.as_ref().unwrap().id, "studio");

        f.ledger.revoke("studio", &e.id, "refund").unwrap();
        assert!(f.ledger.resolve(&q).is_empty());
    }

    #[test]
    fn second_revoke_keeps_original_reason() {
        let f = fixture();
        let e = f.ledger.issue("studio", req(Holder::Subject(f.subject.id.clone()), None)).unwrap();
        let first = f.ledger.revoke("studio", &e.id, "fraud").unwrap();
        let second = f.ledger.revoke("studio", &e.id, "changed my mind").unwrap();
        assert!(matches!(second, Revocation::AlreadyRevoked(_)));
        assert_eq!(second.entitlement().revocation_reason.as_deref(), Some("fraud"));
        assert_eq!(second.entitlement().revoked_at, first.entitlement().revoked_at);
        let revoked_events = f.ledger.events(&e.id).iter().filter(|ev| ev.event_type == EventType::Revoked).count();
        assert_eq!(revoked_events, 1);
        assert_eq!(f.audit.entries().last().unwrap().status, "noop");
    }

    #[test]
    fn issuer_checks() {
        let f = fixture();
        let subj = || Holder::Subject(f.subject.id.clone());
        assert_eq!(f.ledger.issue("ghost", req(subj(), None)).unwrap_err().code_str(), "unknown_issuer");
        assert_eq!(f.ledger.issue("off", req(subj(), None)).unwrap_err().http_status(), 401);

        let mut wide = req(subj(), None);
        wide.scope = "game:2".into();
        assert_eq!(f.ledger.issue("narrow", wide).unwrap_err().code_str(), "scope_not_permitted");
        let e = f.ledger.issue("narrow", req(subj(), None)).unwrap();

        let err = f.ledger.revoke("studio", &e.id, "x").unwrap_err();
        assert_eq!(err.code_str(), "issuer_mismatch");
        assert!(f.ledger.verify(&e.id).is_valid());
        assert_eq!(f.ledger.revoke("narrow", "missing", "x").unwrap_err().http_status(), 404);
        assert_eq!(f.ledger.revoke("narrow", &e.id, " ").unwrap_err().http_status(), 400);
    }

    #[test]
    fn issue_requires_existing_subject_and_type() {
        let f = fixture();
        let err = f.ledger.issue("studio", req(Holder::Subject("ghost".into()), None)).unwrap_err();
        assert_eq!(err.http_status(), 404);
        let mut blank = req(Holder::Subject(f.subject.id.clone()), None);
        blank.entitlement_type = "".into();
        assert!(f.ledger.issue("studio", blank).unwrap_err().message().contains("entitlement_type"));
        assert!(f.audit.is_empty());
    }

    #[test]
    fn revoke_is_visible_to_concurrent_verifiers_after_commit() {
        let f = fixture();
        let e = f.ledger.issue("studio", req(Holder::Subject(f.subject.id.clone()), None)).unwrap();
        let ledger = f.ledger.clone();
        let id = e.id.clone();
        let verifiers: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                let id = id.clone();
                std::thread::spawn(move || (0..50).map(|_| ledger.verify(&id).is_valid()).collect::<Vec<bool>>())
            })
            .collect();
        f.ledger.revoke("studio", &e.id, "fraud").unwrap();
        // after revoke has returned, no verifier may see the entitlement as valid
        for _ in 0..10 {
            assert!(!f.ledger.verify(&e.id).is_valid());
        }
        // each verifier sees valid, valid, ..., invalid, invalid; never valid again after invalid
        for h in verifiers {
            let seen = h.join().unwrap();
            assert!(seen.windows(2).all(|w| w[0] || !w[1]));
        }
    }
}
