use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::AppState;
use crate::auth;
use crate::errors::AppError;
use crate::models::trace::{TraceDetailResponse, TraceListFilters, TraceListResponse};
use crate::reconstruction;

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthenticated)?;
    raw.strip_prefix("Bearer ").ok_or(AppError::Unauthenticated)
}

/// `GET /api/v1/traces` (§4.8 "Listing surface").
pub async fn list_traces(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filters): Query<TraceListFilters>,
) -> Result<Json<TraceListResponse>, AppError> {
    let token = bearer_token(&headers)?;
    let credential = auth::resolve_credential(token, &state.credential_secret, &state.oltp).await?;

    let (traces, total) = state.oltp.list_traces(credential.tenant_id, &filters)?;
    Ok(Json(TraceListResponse { traces, total }))
}

/// `GET /api/v1/traces/:trace_id` (§4.8 steps 1-7).
pub async fn get_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(trace_id): Path<Uuid>,
) -> Result<Json<TraceDetailResponse>, AppError> {
    let token = bearer_token(&headers)?;
    let credential = auth::resolve_credential(token, &state.credential_secret, &state.oltp).await?;

    let rows = state.event_store.fetch_trace_events(credential.tenant_id, trace_id).await?;
    let detail = reconstruction::build_trace_detail(credential.tenant_id, credential.project_id, trace_id, rows)
        .ok_or(AppError::NotFound)?;

    Ok(Json(detail))
}
