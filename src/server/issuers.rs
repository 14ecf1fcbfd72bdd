use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value as JsonValue;

use crate::error::AppResult;

use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/issuers/{id}", get(get_issuer))
}

async fn get_issuer(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<JsonValue>> {
    Ok(Json(state.ledger.get_issuer(&id)?.profile()))
}
