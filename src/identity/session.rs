use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::storage::kv::KvStore;
use crate::tprintln;

use super::pkce;
use super::provider::ProviderRegistry;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A pending OAuth link. Single use: removed on first `consume` or when the TTL lapses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub state: String,
    pub user_id: String,
    pub provider: String,
    #[serde(default)]
    pub code_verifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What `create` hands back: the stored session plus the PKCE challenge derived from its verifier.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub code_challenge: Option<String>,
}

/// Returned for unknown, already consumed and expired states alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid or expired session")]
pub struct SessionNotFound;

impl From<SessionNotFound> for AppError {
    fn from(_: SessionNotFound) -> Self {
        AppError::user("invalid_session", "Invalid or expired state")
    }
}

/// Storage seam for linking sessions. An implementation shared by several server
/// instances must make `consume` an atomic check-and-delete.
pub trait SessionStore: Send + Sync {
    /// Store a session under its state. Returns false if that state is already live.
    fn insert(&self, session: &Session, ttl: Duration) -> bool;
    fn consume(&self, state: &str) -> Option<Session>;
    /// Drop expired sessions, returning how many were removed.
    fn sweep(&self) -> usize;
    fn len(&self) -> usize;
}

/// Session store over the in-process TTL KV store.
#[derive(Clone, Default)]
pub struct KvSessionStore {
    kv: KvStore<Session>,
}

impl SessionStore for KvSessionStore {
    fn insert(&self, session: &Session, ttl: Duration) -> bool {
        self.kv.set_if_absent(session.state.clone(), session.clone(), Some(ttl))
    }

    fn consume(&self, state: &str) -> Option<Session> { self.kv.take(state) }
    fn sweep(&self) -> usize { self.kv.sweep() }
    fn len(&self) -> usize { self.kv.len() }
}

/// Creates and consumes linking sessions against the provider allow-list.
#[derive(Clone)]
pub struct SessionManager {
    pub ttl: Duration,
    store: Arc<dyn SessionStore>,
    registry: Arc<ProviderRegistry>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, registry: Arc<ProviderRegistry>, ttl: Duration) -> Self {
        Self { ttl, store, registry }
    }

    /// Allocate a session for `user_id` linking `provider`. PKCE material is generated
    /// only when the provider's adapter asks for it.
    pub fn create(&self, user_id: &str, provider: &str) -> AppResult<IssuedSession> {
        let adapter = self.registry.get(provider)?;
        let (code_verifier, code_challenge) = if adapter.requires_pkce() {
            let verifier = pkce::generate_verifier()?;
            let challenge = pkce::challenge_s256(&verifier);
            (Some(verifier), Some(challenge))
        } else {
            (None, None)
        };
        // A collision on 256 random bits means the RNG is broken; retry a couple of times then give up.
        for _ in 0..3 {
            let session = Session {
                id: format!("link_{}", uuid::Uuid::new_v4().simple()),
                state: pkce::random_token(32)?,
                user_id: user_id.to_string(),
                provider: provider.to_string(),
                code_verifier: code_verifier.clone(),
                created_at: Utc::now(),
            };
            if self.store.insert(&session, self.ttl) {
                tprintln!("session.create user={} provider={} id={}", user_id, provider, session.id);
                return Ok(IssuedSession { session, code_challenge });
            }
        }
        Err(AppError::internal("session_collision", "could not allocate a unique state"))
    }

    pub fn consume(&self, state: &str) -> Result<Session, SessionNotFound> {
        if state.is_empty() { return Err(SessionNotFound); }
        self.store.consume(state).ok_or(SessionNotFound)
    }

    pub fn sweep(&self) -> usize { self.store.sweep() }
    pub fn active(&self) -> usize { self.store.len() }
}
