//!
//! trustlink storage
//! -----------------
//! Two stores back the service:
//! - `kv`: an in-process key/value store with per-key TTL, used for short-lived linking sessions.
//! - `tables`: the transactional tables for Subjects, identities, Issuers, Entitlements and
//!   their events, with optional JSON snapshot persistence under a data directory.

pub mod kv;
pub mod tables;

pub use kv::KvStore;
pub use tables::{Datastore, StoreError, Tables};
