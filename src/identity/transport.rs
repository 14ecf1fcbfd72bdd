//! Outbound HTTP used by provider adapters. Kept behind a trait so the linking flow
//! can run against a scripted provider in tests.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }
    /// 5xx and 429 are worth another attempt for idempotent calls.
    pub fn is_transient(&self) -> bool { self.status >= 500 || self.status == 429 }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

pub type Headers = Vec<(String, String)>;

#[async_trait]
pub trait OAuthTransport: Send + Sync {
    async fn post_form(&self, url: &str, form: &[(String, String)], headers: &Headers) -> Result<TransportResponse, TransportError>;
    async fn get(&self, url: &str, headers: &Headers) -> Result<TransportResponse, TransportError>;
}

/// `reqwest` client with a per-request timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("trustlink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn finish(resp: Result<reqwest::Response, reqwest::Error>) -> Result<TransportResponse, TransportError> {
        let resp = resp.map_err(map_reqwest_err)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_err)?;
        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() { TransportError::Timeout } else { TransportError::Network(e.to_string()) }
}

#[async_trait]
impl OAuthTransport for ReqwestTransport {
    async fn post_form(&self, url: &str, form: &[(String, String)], headers: &Headers) -> Result<TransportResponse, TransportError> {
        let mut req = self.client.post(url).form(form);
        for (k, v) in headers { req = req.header(k.as_str(), v.as_str()); }
        Self::finish(req.send().await).await
    }

    async fn get(&self, url: &str, headers: &Headers) -> Result<TransportResponse, TransportError> {
        let mut req = self.client.get(url);
        for (k, v) in headers { req = req.header(k.as_str(), v.as_str()); }
        Self::finish(req.send().await).await
    }
}
