//!
//! trustlink HTTP server
//! ---------------------
//! Axum-based HTTP API over the linking orchestrator and the entitlement ledger.
//!
//! Responsibilities:
//! - Wiring the stores, provider registry, audit log and ledger from `ServerConfig`.
//! - Mounting the link, entitlement and issuer routes plus `/health`.
//! - Background session sweeper and snapshot ticker.
//! - Graceful shutdown with a final snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{FromRequest, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::{AuditLog, JsonlSink, AUDIT_FILE};
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::identity::{
    builtin_adapter, IdentityDirectory, KvSessionStore, LinkingOrchestrator, OAuthTransport, ProviderRegistry,
    ReqwestTransport, SessionManager,
};
use crate::ledger::{load_issuers, EntitlementLedger};
use crate::storage::Datastore;

pub mod entitlements;
pub mod issuers;
pub mod link;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub linking: LinkingOrchestrator,
    pub ledger: EntitlementLedger,
    pub audit: AuditLog,
    pub store: Datastore,
    pub providers: Arc<Vec<String>>,
    pub started_at: DateTime<Utc>,
}

/// `Json` extractor whose rejections are rendered as `AppError` bodies.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub(crate) struct JsonBody<T>(pub T);

/// Trimmed, non-empty value of an optional request field, or a validation error naming it.
pub(crate) fn required<'a>(value: &'a Option<String>, field: &str) -> AppResult<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::missing_field(field))
}

/// Assemble the service from configuration. The transport is injected so tests can
/// script provider responses.
pub fn build_state(config: &ServerConfig, transport: Arc<dyn OAuthTransport>) -> anyhow::Result<AppState> {
    let store = match &config.data_dir {
        Some(dir) => Datastore::open(dir).with_context(|| format!("opening data dir {}", dir.display()))?,
        None => Datastore::in_memory(),
    };

    let mut audit = AuditLog::new();
    if let Some(dir) = &config.data_dir {
        let sink = JsonlSink::open(dir.join(AUDIT_FILE)).with_context(|| format!("opening audit log in {}", dir.display()))?;
        audit = audit.with_sink(Arc::new(sink));
    }

    let mut registry = ProviderRegistry::default();
    for creds in &config.providers {
        match builtin_adapter(&creds.provider, &creds.client_id, &creds.client_secret) {
            Some(adapter) => registry.register(adapter),
            None => warn!(target: "trustlink::server", provider = %creds.provider, "no adapter for configured provider"),
        }
    }
    let registry = Arc::new(registry);
    let providers = Arc::new(registry.ids());

    let sessions = SessionManager::new(Arc::new(KvSessionStore::default()), registry.clone(), config.session_ttl);
    let directory = IdentityDirectory::new(store.clone());
    let linking = LinkingOrchestrator::new(
        sessions,
        registry,
        directory,
        audit.clone(),
        transport,
        &config.public_url,
        &config.app_base_url,
    )
    .with_retry(config.fetch_retry);

    let ledger = EntitlementLedger::new(store.clone(), audit.clone());
    if let Some(path) = &config.issuers_file {
        let issuers = load_issuers(path)?;
        let n = ledger.upsert_issuers(issuers);
        info!(target: "trustlink::server", count = n, path = %path.display(), "issuers loaded");
    }

    Ok(AppState { linking, ledger, audit, store, providers, started_at: Utc::now() })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "active_sessions": state.linking.sessions().active(),
        "audit_failures": state.audit.failures(),
        "providers": state.providers.as_slice(),
        "issuers": state.ledger.issuer_count(),
    }))
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(link::router())
        .merge(entitlements::router())
        .merge(issuers::router())
        .with_state(state)
}

fn log_startup(config: &ServerConfig, state: &AppState) {
    info!(
        target: "startup",
        http_port = config.http_port,
        data_dir = ?config.data_dir,
        public_url = %config.public_url,
        app_base_url = %config.app_base_url,
        session_ttl_secs = config.session_ttl.as_secs(),
        providers = ?state.providers,
        issuers = state.ledger.issuer_count(),
        "trustlink starting"
    );
    if state.providers.is_empty() {
        warn!(target: "startup", "no OAuth providers configured; set <PROVIDER>_CLIENT_ID and <PROVIDER>_CLIENT_SECRET");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Start the HTTP server and its background tasks, returning after a graceful shutdown.
pub async fn run_with_config(config: ServerConfig) -> anyhow::Result<()> {
    let transport = ReqwestTransport::new(config.http_timeout)?;
    let state = build_state(&config, Arc::new(transport))?;
    log_startup(&config, &state);

    // Background session sweeper
    let sweeper = {
        let sessions = state.linking.sessions().clone();
        let every = config.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let removed = sessions.sweep();
                if removed > 0 { tracing::debug!(removed = removed, "session_sweep"); }
            }
        })
    };

    // Writes persist on commit; this only retries snapshots that a best-effort update missed.
    let snapshotter = config.data_dir.as_ref().map(|_| {
        let store = state.store.clone();
        let every = config.snapshot_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                match store.flush() {
                    Ok(true) => info!(target: "trustlink::storage", "pending snapshot written"),
                    Ok(false) => {}
                    Err(e) => error!(target: "trustlink::storage", "snapshot retry failed: {}", e),
                }
            }
        })
    });

    let store = state.store.clone();
    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    if let Some(h) = snapshotter { h.abort(); }
    store.save_snapshot().context("final snapshot")?;
    info!("Shut down cleanly");
    Ok(())
}
