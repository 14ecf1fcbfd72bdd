//! In-process tables for the trust layer.
//!
//! All tables live behind one `RwLock`, so a closure passed to `Datastore::write`
//! runs as a single transaction and, with a data directory, is persisted before it commits. The `(provider, external_id)` uniqueness of
//! active identity bindings is enforced here by `Tables::insert_identity`, not by
//! callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::AppError;
use crate::identity::{Subject, SubjectIdentity};
use crate::ledger::{Entitlement, EntitlementEvent, Issuer};

const SNAPSHOT_FILE: &str = "trustlink.json";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}: {key}")]
    UniqueViolation { table: &'static str, key: String },
    #[error("{table} row not found: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { .. } => AppError::conflict("unique_violation".to_string(), err.to_string()),
            StoreError::NotFound { .. } => AppError::not_found("not_found".to_string(), err.to_string()),
            StoreError::Io(_) | StoreError::Serde(_) => AppError::internal("store_error".to_string(), err.to_string()),
        }
    }
}

/// Key of the active-binding index.
fn binding_key(provider: &str, external_id: &str) -> (String, String) {
    (provider.to_string(), external_id.to_string())
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub subjects: HashMap<String, Subject>,
    pub identities: HashMap<String, SubjectIdentity>,
    pub issuers: HashMap<String, Issuer>,
    pub entitlements: HashMap<String, Entitlement>,
    pub entitlement_events: Vec<EntitlementEvent>,
    /// linked_account_ref -> subject id
    #[serde(skip)]
    subject_by_account: HashMap<String, String>,
    /// (provider, external_id) -> id of the non-revoked identity
    #[serde(skip)]
    active_bindings: HashMap<(String, String), String>,
}

impl Tables {
    fn rebuild_indexes(&mut self) {
        self.subject_by_account = self
            .subjects
            .values()
            .map(|s| (s.linked_account_ref.clone(), s.id.clone()))
            .collect();
        self.active_bindings = self
            .identities
            .values()
            .filter(|i| i.revoked_at.is_none())
            .map(|i| (binding_key(&i.issuer_provider, &i.external_id), i.id.clone()))
            .collect();
    }

    pub fn subject_for_account(&self, account_ref: &str) -> Option<&Subject> {
        self.subject_by_account.get(account_ref).and_then(|id| self.subjects.get(id))
    }

    pub fn insert_subject(&mut self, subject: Subject) -> Result<(), StoreError> {
        if self.subject_by_account.contains_key(&subject.linked_account_ref) {
            return Err(StoreError::UniqueViolation { table: "subjects", key: subject.linked_account_ref });
        }
        self.subject_by_account.insert(subject.linked_account_ref.clone(), subject.id.clone());
        self.subjects.insert(subject.id.clone(), subject);
        Ok(())
    }

    /// The non-revoked identity bound to `(provider, external_id)`, if any.
    pub fn active_identity(&self, provider: &str, external_id: &str) -> Option<&SubjectIdentity> {
        self.active_bindings
            .get(&binding_key(provider, external_id))
            .and_then(|id| self.identities.get(id))
    }

    pub fn active_identity_mut(&mut self, provider: &str, external_id: &str) -> Option<&mut SubjectIdentity> {
        let id = self.active_bindings.get(&binding_key(provider, external_id))?.clone();
        self.identities.get_mut(&id)
    }

    /// Most recent identity row for the pair, revoked or not.
    pub fn latest_identity(&self, provider: &str, external_id: &str) -> Option<&SubjectIdentity> {
        self.active_identity(provider, external_id).or_else(|| {
            self.identities
                .values()
                .filter(|i| i.issuer_provider == provider && i.external_id == external_id)
                .max_by_key(|i| i.revoked_at)
        })
    }

    pub fn identities_for_subject(&self, subject_id: &str) -> Vec<&SubjectIdentity> {
        let mut out: Vec<&SubjectIdentity> = self.identities.values().filter(|i| i.subject_id == subject_id).collect();
        out.sort_by(|a, b| a.verified_at.cmp(&b.verified_at));
        out
    }

    /// Insert a new identity row. Fails if an active binding for the same pair exists.
    pub fn insert_identity(&mut self, identity: SubjectIdentity) -> Result<(), StoreError> {
        let key = binding_key(&identity.issuer_provider, &identity.external_id);
        if identity.revoked_at.is_none() {
            if self.active_bindings.contains_key(&key) {
                return Err(StoreError::UniqueViolation {
                    table: "subject_identities",
                    key: format!("{}:{}", key.0, key.1),
                });
            }
            self.active_bindings.insert(key, identity.id.clone());
        }
        self.identities.insert(identity.id.clone(), identity);
        Ok(())
    }

    /// Mark the active binding for the pair revoked and free the unique slot.
    pub fn revoke_identity(
        &mut self,
        provider: &str,
        external_id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SubjectIdentity, StoreError> {
        let key = binding_key(provider, external_id);
        let Some(id) = self.active_bindings.remove(&key) else {
            return Err(StoreError::NotFound { table: "subject_identities", key: format!("{}:{}", provider, external_id) });
        };
        let ident = self
            .identities
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound { table: "subject_identities", key: id.clone() })?;
        ident.revoked_at = Some(at);
        Ok(ident.clone())
    }

    pub fn insert_entitlement(&mut self, ent: Entitlement) -> Result<(), StoreError> {
        if self.entitlements.contains_key(&ent.id) {
            return Err(StoreError::UniqueViolation { table: "entitlements", key: ent.id });
        }
        self.entitlements.insert(ent.id.clone(), ent);
        Ok(())
    }

    pub fn events_for(&self, entitlement_id: &str) -> Vec<&EntitlementEvent> {
        self.entitlement_events.iter().filter(|e| e.entitlement_id == entitlement_id).collect()
    }
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    created_ms: i64,
    tables: Tables,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    created_ms: i64,
    tables: &'a Tables,
}

/// Serialize `tables` to `path` via a temp file and rename.
fn write_snapshot(path: &Path, tables: &Tables) -> Result<(), StoreError> {
    let snap = SnapshotRef { version: SNAPSHOT_VERSION, created_ms: chrono::Utc::now().timestamp_millis(), tables };
    let bytes = serde_json::to_vec(&snap)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Shared handle to the tables plus optional snapshot persistence under a data directory.
///
/// With a data directory every committed `write` is on disk before it becomes visible.
/// All disk writes happen under the write lock, so an older snapshot never replaces a newer one.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<parking_lot::RwLock<Tables>>,
    dir: Option<PathBuf>,
    /// Set when a best-effort `update` could not be persisted.
    dirty: Arc<AtomicBool>,
}

impl Default for Datastore {
    fn default() -> Self { Self::in_memory() }
}

impl Datastore {
    pub fn in_memory() -> Self {
        Self { inner: Arc::new(parking_lot::RwLock::new(Tables::default())), dir: None, dirty: Arc::default() }
    }

    /// Open a datastore persisted under `dir`, loading the last snapshot if one exists.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            inner: Arc::new(parking_lot::RwLock::new(Tables::default())),
            dir: Some(dir),
            dirty: Arc::default(),
        };
        store.load_snapshot()?;
        Ok(store)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let g = self.inner.read();
        f(&g)
    }

    /// Infallible variant of `write`. Persistence is best-effort: a failed snapshot is
    /// logged, the change stays in memory and the store is marked dirty for `flush`.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut g = self.inner.write();
        let out = f(&mut g);
        if let Some(path) = self.snapshot_path() {
            match write_snapshot(&path, &g) {
                Ok(()) => self.dirty.store(false, Ordering::Release),
                Err(e) => {
                    error!(target: "trustlink::storage", "snapshot after update failed: {}", e);
                    self.dirty.store(true, Ordering::Release);
                }
            }
        }
        out
    }

    /// Run `f` as one transaction under the write lock. When persisting, `f` runs on a
    /// copy that is written to disk and only then swapped in, so an `Err` from `f` or
    /// from the snapshot leaves both memory and disk unchanged.
    pub fn write<R, E>(&self, f: impl FnOnce(&mut Tables) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut g = self.inner.write();
        let Some(path) = self.snapshot_path() else { return f(&mut g) };
        let mut next = g.clone();
        let out = f(&mut next)?;
        write_snapshot(&path, &next)?;
        *g = next;
        self.dirty.store(false, Ordering::Release);
        Ok(out)
    }

    fn snapshot_path(&self) -> Option<PathBuf> { self.dir.as_ref().map(|d| d.join(SNAPSHOT_FILE)) }

    /// Write the tables to `<dir>/trustlink.json`. No-op when in memory.
    pub fn save_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path() else { return Ok(()) };
        let g = self.inner.write();
        write_snapshot(&path, &g)?;
        self.dirty.store(false, Ordering::Release);
        debug!(target: "trustlink::storage", path = %path.display(), "snapshot saved");
        Ok(())
    }

    /// Retry a snapshot that a previous `update` failed to write. Returns whether one was written.
    pub fn flush(&self) -> Result<bool, StoreError> {
        if !self.dirty.load(Ordering::Acquire) { return Ok(false); }
        self.save_snapshot()?;
        Ok(true)
    }

    fn load_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path() else { return Ok(()) };
        if !path.exists() { return Ok(()); }
        let bytes = std::fs::read(&path)?;
        let snap: Snapshot = serde_json::from_slice(&bytes)?;
        let mut tables = snap.tables;
        tables.rebuild_indexes();
        info!(
            target: "trustlink::storage",
            version = snap.version,
            created_ms = snap.created_ms,
            subjects = tables.subjects.len(),
            identities = tables.identities.len(),
            entitlements = tables.entitlements.len(),
            "snapshot loaded"
        );
        *self.inner.write() = tables;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ident(id: &str, subject: &str, provider: &str, ext: &str) -> SubjectIdentity {
        SubjectIdentity {
            id: id.into(),
            subject_id: subject.into(),
            issuer_provider: provider.into(),
            external_id: ext.into(),
            external_username: format!("user{}", ext),
            verified_at: Utc::now(),
            revoked_at: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn active_binding_is_unique() {
        let mut t = Tables::default();
        t.insert_identity(ident("i1", "s1", "github", "42")).unwrap();
        let err = t.insert_identity(ident("i2", "s2", "github", "42")).unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(t.active_identity("github", "42").unwrap().subject_id, "s1");
        // same external id on another provider is a different key
        t.insert_identity(ident("i3", "s2", "discord", "42")).unwrap();
    }

    #[test]
    fn revoking_frees_the_slot() {
        let mut t = Tables::default();
        t.insert_identity(ident("i1", "s1", "github", "42")).unwrap();
        let revoked = t.revoke_identity("github", "42", Utc::now()).unwrap();
        assert!(revoked.revoked_at.is_some());
        assert!(t.active_identity("github", "42").is_none());
        assert_eq!(t.latest_identity("github", "42").unwrap().id, "i1");
        t.insert_identity(ident("i2", "s2", "github", "42")).unwrap();
        assert_eq!(t.active_identity("github", "42").unwrap().id, "i2");
        assert!(matches!(t.revoke_identity("github", "nope", Utc::now()), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn rejected_insert_does_not_mutate() {
        let ds = Datastore::in_memory();
        let first: Result<(), StoreError> = ds.write(|t| t.insert_identity(ident("i1", "s1", "github", "1")));
        first.unwrap();
        let second: Result<(), StoreError> = ds.write(|t| t.insert_identity(ident("i2", "s2", "github", "1")));
        assert!(second.is_err());
        ds.read(|t| {
            assert_eq!(t.identities.len(), 1);
            assert_eq!(t.active_identity("github", "1").unwrap().subject_id, "s1");
        });
    }

    #[test]
    fn snapshot_round_trip_rebuilds_indexes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ds = Datastore::open(dir.path()).unwrap();
            ds.write(|t| {
                t.insert_subject(Subject { id: "s1".into(), linked_account_ref: "u1".into(), created_at: Utc::now() })?;
                t.insert_identity(ident("i1", "s1", "github", "42"))
            })
            .unwrap();
            ds.save_snapshot().unwrap();
        }
        let ds = Datastore::open(dir.path()).unwrap();
        ds.read(|t| {
            assert_eq!(t.subject_for_account("u1").unwrap().id, "s1");
            assert_eq!(t.active_identity("github", "42").unwrap().id, "i1");
        });
        let dup: Result<(), StoreError> = ds.write(|t| t.insert_identity(ident("i9", "s9", "github", "42")));
        assert!(dup.is_err());
    }

    #[test]
    fn committed_write_survives_without_explicit_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ds = Datastore::open(dir.path()).unwrap();
            let r: Result<(), StoreError> = ds.write(|t| t.insert_identity(ident("i1", "s1", "github", "42")));
            r.unwrap();
            let r: Result<SubjectIdentity, StoreError> = ds.write(|t| t.revoke_identity("github", "42", Utc::now()));
            r.unwrap();
            // dropped without save_snapshot
        }
        let ds = Datastore::open(dir.path()).unwrap();
        ds.read(|t| {
            assert!(t.identities["i1"].revoked_at.is_some());
            assert!(t.active_identity("github", "42").is_none());
        });
    }

    #[test]
    fn failed_persist_does_not_commit() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let ds = Datastore::open(&data).unwrap();
        std::fs::remove_dir_all(&data).unwrap();

        let r: Result<(), StoreError> = ds.write(|t| t.insert_identity(ident("i1", "s1", "github", "42")));
        assert!(matches!(r, Err(StoreError::Io(_))));
        ds.read(|t| assert!(t.identities.is_empty()));

        // best-effort updates stay in memory and are flushed once the directory is back
        ds.update(|t| t.entitlement_events.clear());
        std::fs::create_dir_all(&data).unwrap();
        assert!(ds.flush().unwrap());
        assert!(!ds.flush().unwrap());
        assert!(data.join(SNAPSHOT_FILE).exists());
    }

    #[test]
    fn in_memory_store_never_touches_disk() {
        let ds = Datastore::in_memory();
        ds.save_snapshot().unwrap();
        assert!(!ds.flush().unwrap());
    }
}
