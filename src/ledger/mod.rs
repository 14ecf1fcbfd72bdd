//! Issuers and the entitlements they grant.

mod issuer;
#[allow(clippy::module_inception)]
mod ledger;
mod model;

pub use issuer::{load_issuers, Issuer};
pub use ledger::{EntitlementLedger, IssueRequest, ResolveQuery, Revocation};
pub use model::{Entitlement, EntitlementEvent, EntitlementStatus, EventType, ExternalRef, Holder, InvalidReason, Verification};
