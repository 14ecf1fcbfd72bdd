use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};

use super::transport::{Headers, OAuthTransport, TransportError};

/// Static OAuth settings for one provider. `client_secret` never leaves the process.
#[derive(Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub scope: String,
    pub requires_pkce: bool,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("user_info_url", &self.user_info_url)
            .field("scope", &self.scope)
            .field("requires_pkce", &self.requires_pkce)
            .finish()
    }
}

/// Canonical identity triple every provider response is normalized into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub external_id: String,
    pub external_username: String,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    Unknown(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("identity fetch failed: {0}")]
    IdentityFetch(String),
    /// Worth retrying: timeouts, network errors, 5xx/429 on the identity GET.
    #[error("identity fetch failed (transient): {0}")]
    Transient(String),
    #[error("unexpected {provider} identity shape: {detail}")]
    Mapping { provider: String, detail: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool { matches!(self, ProviderError::Transient(_)) }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unknown(p) => AppError::user("unknown_provider".to_string(), format!("Invalid provider: {}", p)),
            ProviderError::TokenExchange(_) => AppError::provider("token_exchange_failed".to_string(), err.to_string()),
            ProviderError::IdentityFetch(_) | ProviderError::Transient(_) => {
                AppError::provider("identity_fetch_failed".to_string(), err.to_string())
            }
            ProviderError::Mapping { .. } => AppError::provider("identity_mapping_failed".to_string(), err.to_string()),
        }
    }
}

fn encode_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// One OAuth provider. Implementations supply their config and the response mapping;
/// URL building and the two network calls have shared defaults that variants may override.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    /// Normalize the provider's user-info JSON.
    fn map_identity(&self, raw: &JsonValue) -> Result<ExternalIdentity, ProviderError>;

    fn id(&self) -> &str { &self.config().id }
    fn requires_pkce(&self) -> bool { self.config().requires_pkce }

    fn build_authorization_url(&self, state: &str, challenge: Option<&str>, redirect_uri: &str) -> String {
        let cfg = self.config();
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", cfg.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("state", state),
            ("scope", cfg.scope.as_str()),
        ];
        if cfg.requires_pkce {
            if let Some(c) = challenge {
                params.push(("code_challenge", c));
                params.push(("code_challenge_method", "S256"));
            }
        }
        format!("{}?{}", cfg.auth_url, encode_query(&params))
    }

    fn token_form(&self, code: &str, redirect_uri: &str, code_verifier: Option<&str>) -> Vec<(String, String)> {
        let cfg = self.config();
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("client_id".to_string(), cfg.client_id.clone()),
            ("client_secret".to_string(), cfg.client_secret.clone()),
        ];
        if cfg.requires_pkce {
            if let Some(v) = code_verifier {
                form.push(("code_verifier".to_string(), v.to_string()));
            }
        }
        form
    }

    fn user_info_headers(&self, access_token: &str) -> Headers {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", access_token)),
            ("Accept".to_string(), "application/json".to_string()),
        ]
    }

    /// Single attempt; an authorization code must not be replayed.
    async fn exchange_token(
        &self,
        transport: &dyn OAuthTransport,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, ProviderError> {
        let form = self.token_form(code, redirect_uri, code_verifier);
        let headers: Headers = vec![("Accept".to_string(), "application/json".to_string())];
        let resp = transport
            .post_form(&self.config().token_url, &form, &headers)
            .await
            .map_err(|e| ProviderError::TokenExchange(e.to_string()))?;
        if !resp.is_success() {
            return Err(ProviderError::TokenExchange(format!("{} returned HTTP {}", self.id(), resp.status)));
        }
        let token: TokenResponse = serde_json::from_str(&resp.body)
            .map_err(|_| ProviderError::TokenExchange(format!("{} token response had no access_token", self.id())))?;
        if token.access_token.is_empty() {
            return Err(ProviderError::TokenExchange(format!("{} returned an empty access_token", self.id())));
        }
        Ok(token)
    }

    async fn fetch_identity(&self, transport: &dyn OAuthTransport, access_token: &str) -> Result<ExternalIdentity, ProviderError> {
        let headers = self.user_info_headers(access_token);
        let resp = transport.get(&self.config().user_info_url, &headers).await.map_err(|e| match e {
            TransportError::Timeout | TransportError::Network(_) => ProviderError::Transient(e.to_string()),
        })?;
        if resp.is_transient() {
            return Err(ProviderError::Transient(format!("{} user info returned HTTP {}", self.id(), resp.status)));
        }
        if !resp.is_success() {
            return Err(ProviderError::IdentityFetch(format!("Failed to fetch {} user info (HTTP {})", self.id(), resp.status)));
        }
        let raw: JsonValue = serde_json::from_str(&resp.body)
            .map_err(|e| ProviderError::IdentityFetch(format!("{} user info was not JSON: {}", self.id(), e)))?;
        self.map_identity(&raw)
    }
}

/// Lookup table of registered adapters; membership is the provider allow-list.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, provider: &str) -> AppResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown(provider.to_string()).into())
    }

    pub fn contains(&self, provider: &str) -> bool { self.adapters.contains_key(provider) }
    pub fn ids(&self) -> Vec<String> { self.adapters.keys().cloned().collect() }
    pub fn len(&self) -> usize { self.adapters.len() }
    pub fn is_empty(&self) -> bool { self.adapters.is_empty() }
}
