//!
//! trustlink configuration
//! -----------------------
//! Settings are resolved as CLI flag > environment variable > default. Provider
//! credentials only come from the environment; a provider is allow-listed only when
//! both its client id and secret are set.

use std::path::PathBuf;
use std::time::Duration;

use crate::identity::{FetchRetry, BUILTIN_PROVIDERS, DEFAULT_SESSION_TTL, DEFAULT_SWEEP_INTERVAL};

pub const DEFAULT_HTTP_PORT: u16 = 5000;

#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub provider: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    /// Enables snapshot persistence and the audit JSONL file.
    pub data_dir: Option<PathBuf>,
    /// Externally reachable base of this service; provider redirect URIs hang off it.
    pub public_url: String,
    /// Where browsers land after the OAuth callback.
    pub app_base_url: String,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub http_timeout: Duration,
    pub fetch_retry: FetchRetry,
    pub snapshot_interval: Duration,
    pub issuers_file: Option<PathBuf>,
    pub providers: Vec<ProviderCredentials>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let base = format!("http://localhost:{}", DEFAULT_HTTP_PORT);
        Self {
            http_port: DEFAULT_HTTP_PORT,
            data_dir: None,
            public_url: base.clone(),
            app_base_url: base,
            session_ttl: DEFAULT_SESSION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            http_timeout: Duration::from_secs(10),
            fetch_retry: FetchRetry::default(),
            snapshot_interval: Duration::from_secs(30),
            issuers_file: None,
            providers: Vec::new(),
        }
    }
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    arg_value(args, flag).and_then(|v| v.parse::<u16>().ok())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

pub const USAGE: &str = "trustlink\n\nUSAGE:\n  trustlink [--http-port N] [--data-dir PATH]\n\nOPTIONS:\n  --http-port N      HTTP API port (env: TRUSTLINK_HTTP_PORT, default 5000)\n  --data-dir PATH    Snapshot and audit folder (env: TRUSTLINK_DATA_DIR, default: in-memory only)\n\nENVIRONMENT:\n  TRUSTLINK_PUBLIC_URL, TRUSTLINK_APP_BASE_URL, TRUSTLINK_SESSION_TTL_SECS, TRUSTLINK_SESSION_SWEEP_SECS,\n  TRUSTLINK_HTTP_TIMEOUT_SECS, TRUSTLINK_FETCH_RETRIES, TRUSTLINK_FETCH_BACKOFF_MS, TRUSTLINK_SNAPSHOT_SECS,\n  TRUSTLINK_ISSUERS_FILE, <PROVIDER>_CLIENT_ID / <PROVIDER>_CLIENT_SECRET\n";

impl ServerConfig {
    /// Resolve from process arguments and environment.
    pub fn from_env_and_args(args: &[String]) -> anyhow::Result<Self> {
        Self::resolve(args, |name| std::env::var(name).ok())
    }

    /// Resolve against an arbitrary variable lookup. Malformed numbers are errors, not defaults.
    pub fn resolve(args: &[String], env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let d = Self::default();
        let env = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |name: &str| -> anyhow::Result<Option<u64>> {
            match env(name) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", name, v)),
                None => Ok(None),
            }
        };

        let env_port = match env("TRUSTLINK_HTTP_PORT") {
            Some(v) => Some(v.parse::<u16>().map_err(|_| anyhow::anyhow!("TRUSTLINK_HTTP_PORT is not a port: '{}'", v))?),
            None => None,
        };
        let http_port = parse_port_arg(args, "--http-port").or(env_port).unwrap_or(d.http_port);
        let data_dir = arg_value(args, "--data-dir").or_else(|| env("TRUSTLINK_DATA_DIR")).map(PathBuf::from);

        let local = format!("http://localhost:{}", http_port);
        let public_url = env("TRUSTLINK_PUBLIC_URL").unwrap_or_else(|| local.clone());
        let app_base_url = env("TRUSTLINK_APP_BASE_URL").unwrap_or(local);

        let secs = |name: &str, default: Duration| -> anyhow::Result<Duration> {
            Ok(num(name)?.map(Duration::from_secs).unwrap_or(default))
        };
        let nonzero = |name: &str, default: Duration| -> anyhow::Result<Duration> {
            let v = secs(name, default)?;
            if v.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
            Ok(v)
        };
        let session_ttl = nonzero("TRUSTLINK_SESSION_TTL_SECS", d.session_ttl)?;
        let fetch_retry = FetchRetry {
            attempts: num("TRUSTLINK_FETCH_RETRIES")?.map(|n| n.clamp(1, 10) as u32).unwrap_or(d.fetch_retry.attempts),
            backoff: num("TRUSTLINK_FETCH_BACKOFF_MS")?.map(Duration::from_millis).unwrap_or(d.fetch_retry.backoff),
        };

        let providers = BUILTIN_PROVIDERS
            .iter()
            .filter_map(|p| {
                let upper = p.to_ascii_uppercase();
                let client_id = env(&format!("{}_CLIENT_ID", upper))?;
                let client_secret = env(&format!("{}_CLIENT_SECRET", upper))?;
                Some(ProviderCredentials { provider: p.to_string(), client_id, client_secret })
            })
            .collect();

        Ok(Self {
            http_port,
            data_dir,
            public_url,
            app_base_url,
            session_ttl,
            sweep_interval: nonzero("TRUSTLINK_SESSION_SWEEP_SECS", d.sweep_interval)?,
            http_timeout: secs("TRUSTLINK_HTTP_TIMEOUT_SECS", d.http_timeout)?,
            fetch_retry,
            snapshot_interval: nonzero("TRUSTLINK_SNAPSHOT_SECS", d.snapshot_interval)?,
            issuers_file: env("TRUSTLINK_ISSUERS_FILE").map(PathBuf::from),
            providers,
        })
    }

    pub fn provider_ids(&self) -> Vec<&str> { self.providers.iter().map(|p| p.provider.as_str()).collect() }
}
