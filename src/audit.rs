//! Append-only audit trail of trust-affecting mutations.
//!
//! Audit writes are best-effort: a failing sink never blocks or reverts the mutation
//! being described. Every failure is logged at error level with the full entry and
//! counted, so a gap in the trail is itself on record.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::error;

pub const AUDIT_FILE: &str = "audit.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Issuer,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LinkIdentity,
    UnlinkIdentity,
    IssueEntitlement,
    RevokeEntitlement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub action: AuditAction,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub resource_type: String,
    pub resource_id: String,
    pub changes: JsonValue,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn success(
        action: AuditAction,
        actor_id: &str,
        actor_type: ActorType,
        resource_type: &str,
        resource_id: &str,
        changes: JsonValue,
    ) -> Self {
        Self {
            action,
            actor_id: actor_id.to_string(),
            actor_type,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            changes,
            status: "success".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }
}

/// Durable destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditLogEntry) -> std::io::Result<()>;
}

/// One JSON object per line, appended and flushed per entry.
pub struct JsonlSink {
    path: PathBuf,
    file: parking_lot::Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() { std::fs::create_dir_all(dir)?; }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: parking_lot::Mutex::new(file) })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl AuditSink for JsonlSink {
    fn append(&self, entry: &AuditLogEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut f = self.file.lock();
        f.write_all(&line)?;
        f.flush()
    }
}

/// Entries kept in memory for inspection. The sinks hold the durable trail.
pub const RECENT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AuditLog {
    recent: Arc<parking_lot::RwLock<VecDeque<AuditLogEntry>>>,
    capacity: usize,
    sinks: Vec<Arc<dyn AuditSink>>,
    failures: Arc<AtomicU64>,
}

impl Default for AuditLog {
    fn default() -> Self { Self::with_capacity(RECENT_CAPACITY) }
}

impl AuditLog {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Arc::new(parking_lot::RwLock::new(VecDeque::with_capacity(capacity.min(RECENT_CAPACITY)))),
            capacity,
            sinks: Vec::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn record(&self, entry: AuditLogEntry) {
        for sink in &self.sinks {
            if let Err(e) = sink.append(&entry) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let json = serde_json::to_string(&entry).unwrap_or_default();
                error!(target: "trustlink::audit", error = %e, entry = %json, "audit write failed");
            }
        }
        if self.capacity == 0 { return; }
        let mut recent = self.recent.write();
        if recent.len() == self.capacity { recent.pop_front(); }
        recent.push_back(entry);
    }

    /// The most recent entries, oldest first.
    pub fn entries(&self) -> Vec<AuditLogEntry> { self.recent.read().iter().cloned().collect() }

    pub fn len(&self) -> usize { self.recent.read().len() }
    pub fn is_empty(&self) -> bool { self.recent.read().is_empty() }
    pub fn failures(&self) -> u64 { self.failures.load(Ordering::Relaxed) }
}
