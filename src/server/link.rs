//! Account linking routes. The caller is identified by `x-user-id`.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::AppResult;
use crate::identity::{CallbackOutcome, RequestContext, Unbinding};

use super::{required, AppState, JsonBody};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/link/start", post(start))
        .route("/oauth/callback/{provider}", get(callback))
        .route("/link/complete", post(complete))
        .route("/link/unlink", post(unlink))
        .route("/link/identities", get(identities))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartPayload {
    provider: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    /// Set by the provider when the user declined.
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompletePayload {
    provider: Option<String>,
    external_id: Option<String>,
    external_username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UnlinkPayload {
    provider: Option<String>,
    external_id: Option<String>,
}

async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<StartPayload>,
) -> AppResult<Json<JsonValue>> {
    let ctx = RequestContext::from_headers(&headers);
    let provider = required(&payload.provider, "provider")?;
    let user_id = ctx.require_user()?;
    let started = state.linking.start(user_id, provider)?;
    Ok(Json(json!({
        "linking_session_id": started.linking_session_id,
        "state": started.state,
        "redirect_url": started.authorization_url,
    })))
}

async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(q): Query<CallbackQuery>,
) -> Response {
    let oauth_state = match required(&q.state, "state") {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    if let Some(err) = &q.error {
        tracing::info!(target: "trustlink::linking", provider = %provider, error = %err, "provider returned an authorization error");
    }
    let code = q.code.as_deref().filter(|_| q.error.is_none());
    match state.linking.callback_outcome(&provider, code, oauth_state).await {
        CallbackOutcome::Redirect { location, .. } => Redirect::to(&location).into_response(),
        CallbackOutcome::Reject(e) => e.into_response(),
    }
}

async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<CompletePayload>,
) -> AppResult<Json<JsonValue>> {
    let ctx = RequestContext::from_headers(&headers);
    let provider = required(&payload.provider, "provider")?;
    let external_id = required(&payload.external_id, "external_id")?;
    let external_username = required(&payload.external_username, "external_username")?;
    let user_id = ctx.require_user()?;
    let binding = state.linking.complete(user_id, provider, external_id, external_username)?;
    Ok(Json(json!({ "success": true, "identity": binding.identity })))
}

async fn unlink(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<UnlinkPayload>,
) -> AppResult<Json<JsonValue>> {
    let ctx = RequestContext::from_headers(&headers);
    let provider = required(&payload.provider, "provider")?;
    let external_id = required(&payload.external_id, "external_id")?;
    let user_id = ctx.require_user()?;
    let message = match state.linking.unlink(user_id, provider, external_id)? {
        Unbinding::Revoked(_) => "Identity unlinked",
        Unbinding::AlreadyRevoked(_) => "Identity already unlinked",
    };
    Ok(Json(json!({ "success": true, "message": message })))
}

async fn identities(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<JsonValue>> {
    let ctx = RequestContext::from_headers(&headers);
    let user_id = ctx.require_user()?;
    Ok(Json(json!({ "identities": state.linking.identities(user_id) })))
}
