//! Issuer-facing entitlement routes. Issue and revoke require `x-issuer-id`.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::{AppError, AppResult};
use crate::identity::RequestContext;
use crate::ledger::{Holder, InvalidReason, IssueRequest, ResolveQuery, Revocation};

use super::{required, AppState, JsonBody};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/entitlements/issue", post(issue))
        .route("/entitlements/verify", post(verify))
        .route("/entitlements/resolve", get(resolve))
        .route("/entitlements/revoke", post(revoke))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IssuePayload {
    subject_id: Option<String>,
    external_subject_ref: Option<String>,
    entitlement_type: Option<String>,
    scope: Option<String>,
    data: Option<JsonValue>,
    expires_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifyPayload {
    entitlement_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResolveParams {
    subject_id: Option<String>,
    platform: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RevokePayload {
    entitlement_id: Option<String>,
    reason: Option<String>,
}

fn parse_expiry(raw: Option<&str>) -> AppResult<Option<DateTime<Utc>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s).map(|d| Some(d.with_timezone(&Utc))).map_err(|_| {
            AppError::user("invalid_field".to_string(), format!("expires_at must be an RFC 3339 timestamp, got '{}'", s))
        }),
    }
}

async fn issue(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<IssuePayload>,
) -> AppResult<Json<JsonValue>> {
    let ctx = RequestContext::from_headers(&headers);
    let holder = Holder::from_refs(payload.subject_id.as_deref(), payload.external_subject_ref.as_deref())?;
    let entitlement_type = required(&payload.entitlement_type, "entitlement_type")?;
    let expires_at = parse_expiry(payload.expires_at.as_deref())?;
    let issuer_id = ctx.require_issuer()?;
    let ent = state.ledger.issue(
        issuer_id,
        IssueRequest {
            holder,
            entitlement_type: entitlement_type.to_string(),
            scope: payload.scope.unwrap_or_default(),
            data: payload.data.unwrap_or_else(|| json!({})),
            expires_at,
        },
    )?;
    Ok(Json(json!({
        "success": true,
        "entitlement": {
            "id": ent.id,
            "type": ent.entitlement_type,
            "scope": ent.scope,
            "created_at": ent.created_at,
        },
    })))
}

async fn verify(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<VerifyPayload>,
) -> AppResult<(StatusCode, Json<JsonValue>)> {
    let id = required(&payload.entitlement_id, "entitlement_id")?;
    let v = state.ledger.verify(id);
    let status = match v.reason() {
        Some(InvalidReason::NotFound) => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((status, Json(v.to_json())))
}

async fn resolve(State(state): State<AppState>, Query(params): Query<ResolveParams>) -> AppResult<Json<JsonValue>> {
    let query = ResolveQuery::from_params(params.subject_id.as_deref(), params.platform.as_deref(), params.id.as_deref())?;
    let listed: Vec<JsonValue> = state
        .ledger
        .resolve(&query)
        .iter()
        .map(|(ent, issuer)| ent.summary(issuer.as_ref()))
        .collect();
    Ok(Json(json!({ "entitlements": listed })))
}

async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<RevokePayload>,
) -> AppResult<Json<JsonValue>> {
    let ctx = RequestContext::from_headers(&headers);
    let id = required(&payload.entitlement_id, "entitlement_id")?;
    let reason = required(&payload.reason, "reason")?;
    let issuer_id = ctx.require_issuer()?;
    let message = match state.ledger.revoke(issuer_id, id, reason)? {
        Revocation::Revoked(_) => "Entitlement revoked",
        Revocation::AlreadyRevoked(_) => "Entitlement already revoked",
    };
    Ok(Json(json!({ "success": true, "message": message })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_parsing() {
        assert_eq!(parse_expiry(None).unwrap(), None);
        assert_eq!(parse_expiry(Some(" ")).unwrap(), None);
        let t = parse_expiry(Some("2030-01-01T00:00:00+02:00")).unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2029-12-31T22:00:00+00:00");
        let err = parse_expiry(Some("tomorrow")).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.message().contains("expires_at"));
    }
}
