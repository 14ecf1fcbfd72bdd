//! The start -> callback OAuth flow.
//!
//! Steps run strictly in order: consume the session, exchange the code, fetch the
//! identity, bind it in the directory, write the audit entry. A failure stops the
//! flow before any later step touches the directory.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::audit::{ActorType, AuditAction, AuditLog, AuditLogEntry};
use crate::error::{AppError, AppResult};

use super::directory::{Binding, BindingChange, IdentityDirectory, SubjectIdentity, Unbinding};
use super::provider::{ExternalIdentity, ProviderAdapter, ProviderError, ProviderRegistry};
use super::session::SessionManager;
use super::transport::OAuthTransport;

/// Retry policy for the identity GET. The token exchange is never retried.
#[derive(Debug, Clone, Copy)]
pub struct FetchRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for FetchRetry {
    fn default() -> Self { Self { attempts: 3, backoff: Duration::from_millis(200) } }
}

impl FetchRetry {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct LinkStart {
    pub linking_session_id: String,
    pub state: String,
    pub authorization_url: String,
}

/// What the browser-facing callback should do.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Send the browser back to the app; the URL carries `oauth=success|error`.
    Redirect { location: String, binding: Option<Binding> },
    /// Answer directly; the request never reached a provider (bad or replayed state, unknown provider).
    Reject(AppError),
}

/// Leading characters of a state token, enough to correlate log lines.
fn state_hint(state: &str) -> &str { state.get(..6).unwrap_or("") }

#[derive(Clone)]
pub struct LinkingOrchestrator {
    sessions: SessionManager,
    registry: Arc<ProviderRegistry>,
    directory: IdentityDirectory,
    audit: AuditLog,
    transport: Arc<dyn OAuthTransport>,
    public_url: String,
    app_base_url: String,
    retry: FetchRetry,
}

impl LinkingOrchestrator {
    pub fn new(
        sessions: SessionManager,
        registry: Arc<ProviderRegistry>,
        directory: IdentityDirectory,
        audit: AuditLog,
        transport: Arc<dyn OAuthTransport>,
        public_url: &str,
        app_base_url: &str,
    ) -> Self {
        Self {
            sessions,
            registry,
            directory,
            audit,
            transport,
            public_url: public_url.trim_end_matches('/').to_string(),
            app_base_url: app_base_url.trim_end_matches('/').to_string(),
            retry: FetchRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: FetchRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn sessions(&self) -> &SessionManager { &self.sessions }

    /// Callback URL registered with the provider.
    pub fn redirect_uri(&self, provider: &str) -> String {
        format!("{}/oauth/callback/{}", self.public_url, provider)
    }

    pub fn app_redirect(&self, provider: &str, outcome: Result<(), &AppError>) -> String {
        let provider = urlencoding::encode(provider);
        match outcome {
            Ok(()) => format!("{}/settings?oauth=success&provider={}", self.app_base_url, provider),
            Err(e) => {
                let reason = match e {
                    AppError::Conflict { .. } => "conflict",
                    AppError::Provider { .. } => "provider",
                    _ => "internal",
                };
                format!("{}/settings?oauth=error&provider={}&reason={}", self.app_base_url, provider, reason)
            }
        }
    }

    pub fn start(&self, user_id: &str, provider: &str) -> AppResult<LinkStart> {
        let adapter = self.registry.get(provider)?;
        let issued = self.sessions.create(user_id, provider)?;
        let authorization_url = adapter.build_authorization_url(
            &issued.session.state,
            issued.code_challenge.as_deref(),
            &self.redirect_uri(provider),
        );
        info!(
            target: "trustlink::linking",
            provider,
            session = %issued.session.id,
            state = state_hint(&issued.session.state),
            pkce = issued.code_challenge.is_some(),
            "link started"
        );
        Ok(LinkStart {
            linking_session_id: issued.session.id,
            state: issued.session.state,
            authorization_url,
        })
    }

    /// Finish a browser flow. `code` is None when the provider redirected back with an error.
    pub async fn callback(&self, provider: &str, code: Option<&str>, state: &str) -> AppResult<Binding> {
        let session = self.sessions.consume(state)?;
        if session.provider != provider {
            warn!(
                target: "trustlink::linking",
                provider,
                expected = %session.provider,
                state = state_hint(state),
                "callback provider does not match session"
            );
            return Err(AppError::user("provider_mismatch", "Invalid or expired state"));
        }
        let adapter = self.registry.get(provider)?;
        let Some(code) = code.filter(|c| !c.is_empty()) else {
            return Err(ProviderError::TokenExchange(format!("{} returned no authorization code", provider)).into());
        };

        let redirect_uri = self.redirect_uri(provider);
        let token = adapter
            .exchange_token(self.transport.as_ref(), code, &redirect_uri, session.code_verifier.as_deref())
            .await
            .map_err(|e| {
                warn!(target: "trustlink::linking", provider, error = %e, "token exchange failed");
                e
            })?;
        let identity = self.fetch_with_retry(adapter.as_ref(), &token.access_token).await.map_err(|e| {
            warn!(target: "trustlink::linking", provider, error = %e, "identity fetch failed");
            e
        })?;

        self.bind(&session.user_id, provider, &identity, "oauth")
    }

    /// Browser callback wrapper: every failure past session validation turns into an
    /// app redirect that tells conflicts apart from provider failures.
    pub async fn callback_outcome(&self, provider: &str, code: Option<&str>, state: &str) -> CallbackOutcome {
        match self.callback(provider, code, state).await {
            Ok(binding) => CallbackOutcome::Redirect { location: self.app_redirect(provider, Ok(())), binding: Some(binding) },
            Err(e @ AppError::UserInput { .. }) => CallbackOutcome::Reject(e),
            Err(e) => CallbackOutcome::Redirect { location: self.app_redirect(provider, Err(&e)), binding: None },
        }
    }

    /// Non-redirect variant: the caller already holds the provider's identity.
    pub fn complete(&self, user_id: &str, provider: &str, external_id: &str, external_username: &str) -> AppResult<Binding> {
        self.registry.get(provider)?;
        let identity = ExternalIdentity {
            external_id: external_id.to_string(),
            external_username: external_username.to_string(),
            metadata: json!({}),
        };
        self.bind(user_id, provider, &identity, "complete")
    }

    pub fn unlink(&self, user_id: &str, provider: &str, external_id: &str) -> AppResult<Unbinding> {
        let unbinding = self.directory.revoke_owned_identity(user_id, provider, external_id)?;
        let identity = unbinding.identity();
        let status = match unbinding {
            Unbinding::Revoked(_) => "success",
            Unbinding::AlreadyRevoked(_) => "noop",
        };
        self.audit.record(
            AuditLogEntry::success(
                AuditAction::UnlinkIdentity,
                user_id,
                ActorType::User,
                "subject_identity",
                &identity.id,
                json!({
                    "provider": provider,
                    "external_id": external_id,
                    "revoked_at": identity.revoked_at,
                }),
            )
            .with_status(status),
        );
        info!(target: "trustlink::linking", provider, identity_id = %identity.id, status, "identity unlinked");
        Ok(unbinding)
    }

    /// Active identities of the caller's subject; empty before the first link.
    pub fn identities(&self, user_id: &str) -> Vec<SubjectIdentity> {
        match self.directory.subject_for_account(user_id) {
            Some(s) => self.directory.identities_for_subject(&s.id, false),
            None => Vec::new(),
        }
    }

    fn bind(&self, user_id: &str, provider: &str, identity: &ExternalIdentity, via: &str) -> AppResult<Binding> {
        let binding = self.directory.upsert_identity(user_id, provider, identity).map_err(|e| {
            if let AppError::Conflict { .. } = e {
                warn!(target: "trustlink::linking", provider, "external identity already linked to another subject");
            }
            e
        })?;
        let change = match binding.change {
            BindingChange::Created => "created",
            BindingChange::Refreshed => "refreshed",
        };
        self.audit.record(AuditLogEntry::success(
            AuditAction::LinkIdentity,
            user_id,
            ActorType::User,
            "subject_identity",
            &binding.identity.id,
            json!({
                "subject_id": binding.subject.id,
                "provider": provider,
                "external_id": binding.identity.external_id,
                "external_username": binding.identity.external_username,
                "change": change,
                "via": via,
            }),
        ));
        info!(
            target: "trustlink::linking",
            provider,
            subject_id = %binding.subject.id,
            identity_id = %binding.identity.id,
            change,
            "identity linked"
        );
        Ok(binding)
    }

    async fn fetch_with_retry(&self, adapter: &dyn ProviderAdapter, access_token: &str) -> Result<ExternalIdentity, ProviderError> {
        let mut attempt = 0;
        loop {
            match adapter.fetch_identity(self.transport.as_ref(), access_token).await {
                Err(e) if e.is_transient() && attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::debug!(
                        target: "trustlink::linking",
                        provider = adapter.id(),
                        "identity fetch retry {}/{} after {:?}: {}",
                        attempt + 1,
                        self.retry.attempts - 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
