//! External identity linking: OAuth/PKCE sessions, provider adapters, and the
//! directory of Subjects and their verified identities.
//! Keep the public surface thin and split implementation across sub-modules.

mod adapters;
mod directory;
mod linking;
pub mod pkce;
mod provider;
mod request_context;
mod session;
mod transport;

pub use adapters::{builtin_adapter, BUILTIN_PROVIDERS};
pub use directory::{Binding, BindingChange, IdentityDirectory, Subject, SubjectIdentity, Unbinding};
pub use linking::{CallbackOutcome, FetchRetry, LinkStart, LinkingOrchestrator};
pub use provider::{ExternalIdentity, ProviderAdapter, ProviderConfig, ProviderError, ProviderRegistry, TokenResponse};
pub use request_context::RequestContext;
pub use session::{
    IssuedSession, KvSessionStore, Session, SessionManager, SessionNotFound, SessionStore, DEFAULT_SESSION_TTL,
    DEFAULT_SWEEP_INTERVAL,
};
pub use transport::{Headers, OAuthTransport, ReqwestTransport, TransportError, TransportResponse};
