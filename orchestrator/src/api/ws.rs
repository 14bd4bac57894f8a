//! WebSocket endpoints for the RPC fabric.
//!
//! `/agent/<id>?token=<jwt>`  — the in-container agent.
//! `/client/<id>?apiKey=...`  — SDK clients; bearer JWTs via the
//! `Authorization` header also work.
//!
//! Auth failures close the accepted socket with 1008; unknown WS paths
//! close with 1003. Each socket gets a writer task fed by an unbounded
//! channel so the hub never awaits a send while holding its lock.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use shared_types::{CLOSE_POLICY_VIOLATION, CLOSE_UNSUPPORTED};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::rpc::ClientSubject;
use crate::state::AppState;

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .ok();
}

#[derive(Debug, Deserialize)]
pub(crate) struct AgentQuery {
    token: Option<String>,
}

pub async fn agent_ws(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<Uuid>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent(state, sandbox_id, query.token, socket))
}

async fn handle_agent(
    state: Arc<AppState>,
    sandbox_id: Uuid,
    token: Option<String>,
    socket: WebSocket,
) {
    let authorized = token
        .as_deref()
        .is_some_and(|t| state.auth.verify_agent_token(t, sandbox_id).is_ok());
    if !authorized {
        debug!(sandbox_id = %sandbox_id, "agent connection rejected");
        close_with(socket, CLOSE_POLICY_VIOLATION, "invalid agent token").await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let pong_tx = tx.clone();
    let session_id = state.hub.register_agent(sandbox_id, tx).await;
    info!(sandbox_id = %sandbox_id, "agent connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => state.hub.agent_frame(sandbox_id, text.as_str()).await,
            Message::Ping(payload) => {
                pong_tx.send(Message::Pong(payload)).ok();
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister_agent(sandbox_id, session_id).await;
    info!(sandbox_id = %sandbox_id, "agent disconnected");
    writer.abort();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientQuery {
    api_key: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn client_ws(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<Uuid>,
    Query(query): Query<ClientQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = bearer_token(&headers).map(str::to_string);
    ws.on_upgrade(move |socket| handle_client(state, sandbox_id, query.api_key, bearer, socket))
}

async fn handle_client(
    state: Arc<AppState>,
    sandbox_id: Uuid,
    api_key: Option<String>,
    bearer: Option<String>,
    socket: WebSocket,
) {
    // Establish identity first: a bad credential closes 1008 even before
    // the sandbox lookup.
    let subject = if let Some(key) = api_key {
        match state.auth.verify_api_key(&key).await {
            Ok(identity) => Some(ClientSubject::ApiKey {
                user_id: identity.user_id,
                credential_id: identity.credential_id,
            }),
            Err(_) => {
                close_with(socket, CLOSE_POLICY_VIOLATION, "invalid API key").await;
                return;
            }
        }
    } else if let Some(token) = bearer {
        match state.auth.verify_user_bearer(&token).await {
            Ok(identity) => Some(ClientSubject::Bearer {
                user_id: identity.user_id,
            }),
            Err(_) => {
                close_with(socket, CLOSE_POLICY_VIOLATION, "invalid bearer token").await;
                return;
            }
        }
    } else {
        None
    };

    let live = match state.cache.get_live(sandbox_id).await {
        Ok(Some(live)) => live,
        _ => {
            close_with(socket, CLOSE_POLICY_VIOLATION, "unknown sandbox").await;
            return;
        }
    };

    let subject = match subject {
        Some(subject) => {
            let owner = match &subject {
                ClientSubject::ApiKey { user_id, .. } => *user_id,
                ClientSubject::Bearer { user_id } => *user_id,
                ClientSubject::Unauthenticated => unreachable!(),
            };
            if owner != live.user_id {
                close_with(socket, CLOSE_POLICY_VIOLATION, "not the sandbox owner").await;
                return;
            }
            subject
        }
        None if live.allow_unauthenticated => ClientSubject::Unauthenticated,
        None => {
            close_with(socket, CLOSE_POLICY_VIOLATION, "credentials required").await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let pong_tx = tx.clone();
    let session_id = state.hub.register_client(sandbox_id, subject, tx).await;
    debug!(sandbox_id = %sandbox_id, session_id = %session_id, "client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                state
                    .hub
                    .client_frame(sandbox_id, session_id, text.as_str())
                    .await
            }
            Message::Ping(payload) => {
                pong_tx.send(Message::Pong(payload)).ok();
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister_client(sandbox_id, session_id).await;
    debug!(sandbox_id = %sandbox_id, session_id = %session_id, "client disconnected");
    writer.abort();
}

/// Unmatched paths: WebSocket upgrades are accepted then closed 1003 so the
/// peer sees a protocol-level answer; plain HTTP gets a JSON 404.
pub async fn fallback(req: axum::extract::Request) -> Response {
    let is_ws = req
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_ws {
        use axum::extract::FromRequest;
        return match WebSocketUpgrade::from_request(req, &()).await {
            Ok(ws) => ws.on_upgrade(|socket| async {
                close_with(socket, CLOSE_UNSUPPORTED, "unknown path").await;
            }),
            Err(_) => StatusCode::BAD_REQUEST.into_response(),
        };
    }

    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found" })),
    )
        .into_response()
}
