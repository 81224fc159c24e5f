use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, Response};
use axum::middleware::Next;
use axum::Json;
use governance::{AuditEvent, ProviderHealth, Session};
use orchestrator::{CancelSignal, InboundRequest, TurnOutcome};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_AUDIT_LIMIT: usize = 1000;

#[derive(Deserialize)]
pub struct CloseRequest {
    pub identity: String,
    #[serde(default)]
    pub token: Option<String>,
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub identity: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub identity: String,
    pub token: String,
}

pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response<Body>, AppError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(AppError::unauthorized("admin token not configured"));
    };
    if extract_bearer_token(req.headers()).as_deref() != Some(expected) {
        return Err(AppError::unauthorized("invalid admin token"));
    }
    Ok(next.run(req).await)
}

pub async fn submit_turn(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut request): Json<InboundRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    if request.token.is_none() {
        request.token = extract_bearer_token(&headers);
    }
    // A dropped connection drops this future, which refunds the reservation.
    let outcome = state
        .gateway
        .handle(request, CancelSignal::never())
        .await?;
    Ok(Json(outcome))
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CloseRequest>,
) -> Result<Json<Session>, AppError> {
    let token = payload.token.or_else(|| extract_bearer_token(&headers));
    let session = state
        .gateway
        .close_session(&payload.identity, token.as_deref(), &payload.session_id)
        .await?;
    Ok(Json(session))
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEvent>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .min(MAX_AUDIT_LIMIT);
    Json(state.gateway.recent_audit(limit))
}

pub async fn provider_health(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderHealth>> {
    Json(state.gateway.provider_health())
}

pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let ttl = payload.ttl_secs.map(Duration::from_secs);
    let token = state.gateway.issue_token(&payload.identity, ttl)?;
    Ok(Json(TokenResponse {
        identity: payload.identity,
        token,
    }))
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
