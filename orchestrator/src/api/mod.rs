//! HTTP surface: input validation and dispatch into the managers.
//!
//! Routes are declared statically in [`router`]; every handler receives the
//! shared state and returns either a JSON body or an [`Error`] that maps to
//! a status code.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use shared_types::Tier;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::auth::KeyIdentity;
use crate::db::SandboxRow;
use crate::error::{Error, Result};
use crate::state::AppState;

pub mod ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sandbox/create", post(create_sandbox))
        .route("/sandbox/execute", post(execute))
        .route("/sandbox/quota/usage", get(quota_usage))
        .route("/sandbox/{id}/destroy", post(destroy_sandbox))
        .route("/sandbox/{id}/status", get(sandbox_status))
        .route("/sandbox/{id}/expose", post(expose_port))
        .route("/sandbox/{id}/ports", get(list_ports))
        .route("/sandbox/{id}/stats", get(sandbox_stats))
        .route("/agent/{id}", get(ws::agent_ws))
        .route("/client/{id}", get(ws::client_ws))
        .route("/health", get(health))
        .fallback(ws::fallback)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the caller's API key from `X-API-Key`.
async fn api_key_identity(state: &AppState, headers: &HeaderMap) -> Result<KeyIdentity> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthenticated("missing API key".into()))?;
    state.auth.verify_api_key(key).await
}

/// Key auth plus ownership of the addressed sandbox.
async fn owned_sandbox(
    state: &AppState,
    headers: &HeaderMap,
    sandbox_id: Uuid,
) -> Result<(KeyIdentity, SandboxRow)> {
    let identity = api_key_identity(state, headers).await?;
    let row = state
        .sandboxes
        .get_owned(sandbox_id, identity.user_id)
        .await?;
    Ok((identity, row))
}

fn parse_tier(tier: Option<String>) -> Result<Tier> {
    match tier {
        None => Ok(Tier::default()),
        Some(s) => {
            Tier::parse(&s).ok_or_else(|| Error::InvalidInput(format!("unknown tier: {s}")))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateBody {
    tier: Option<String>,
}

async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse> {
    let identity = api_key_identity(&state, &headers).await?;
    // The body is optional; an empty POST means default tier.
    let body: CreateBody = if body.trim().is_empty() {
        CreateBody::default()
    } else {
        serde_json::from_str(&body)
            .map_err(|e| Error::InvalidInput(format!("invalid request body: {e}")))?
    };
    let tier = parse_tier(body.tier)?;
    let response = state.sandboxes.create(&identity, tier, false).await?;
    Ok(Json(response))
}

async fn destroy_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    owned_sandbox(&state, &headers, sandbox_id).await?;
    state.sandboxes.destroy(sandbox_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn sandbox_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let (_, row) = owned_sandbox(&state, &headers, sandbox_id).await?;
    Ok(Json(state.sandboxes.status(&row).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExposeBody {
    container_port: u16,
}

async fn expose_port(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
    Json(body): Json<ExposeBody>,
) -> Result<impl IntoResponse> {
    if body.container_port == 0 {
        return Err(Error::InvalidInput("containerPort must be nonzero".into()));
    }
    owned_sandbox(&state, &headers, sandbox_id).await?;
    let response = state.sandboxes.expose(sandbox_id, body.container_port).await?;
    Ok(Json(response))
}

async fn list_ports(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let (_, row) = owned_sandbox(&state, &headers, sandbox_id).await?;
    let ports = state.sandboxes.list_ports(&row).await?;
    Ok(Json(json!({ "ports": ports })))
}

async fn sandbox_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(sandbox_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let (_, row) = owned_sandbox(&state, &headers, sandbox_id).await?;
    Ok(Json(state.sandboxes.stats(&row).await?))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    tier: Option<String>,
}

async fn quota_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse> {
    let identity = api_key_identity(&state, &headers).await?;
    let tier = parse_tier(query.tier)?;
    let usage = state
        .quota
        .usage(identity.user_id, identity.credential_id)
        .await?;
    Ok(Json(json!({
        "usage": usage,
        "limits": state.quota.caps(tier),
        "tier": tier,
    })))
}

const MAX_CODE_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    code: String,
    language: String,
    timeout: Option<u64>,
    tier: Option<String>,
}

async fn execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse> {
    if body.code.is_empty() {
        return Err(Error::InvalidInput("code must not be empty".into()));
    }
    if body.code.len() > MAX_CODE_BYTES {
        return Err(Error::InvalidInput("code exceeds maximum size".into()));
    }
    let identity = api_key_identity(&state, &headers).await?;
    let tier = parse_tier(body.tier)?;
    let response = state
        .sandboxes
        .execute(&identity, &body.language, &body.code, body.timeout, tier)
        .await?;
    Ok(Json(response))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pg = state.db.ping().await.is_ok();
    let redis = state.cache.ping().await.is_ok();
    let docker = state.containers.ping().await.is_ok();
    let healthy = pg && redis && docker;

    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "services": {
            "pg": if pg { "up" } else { "down" },
            "redis": if redis { "up" } else { "down" },
            "docker": if docker { "up" } else { "down" },
        },
    }));
    if healthy {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}
