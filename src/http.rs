//! HTTP layer: the router and the websocket upgrade glue.
//!
//! Three endpoints:
//! - `POST /jsonrpc` — request/response dispatch (see `jsonrpc`)
//! - `GET /ws` — browser-facing websocket, subject to an origin check and,
//!   when `ws.auth_required` is set, to session authentication
//! - `GET /wsrpc` — service-to-service websocket; mutual TLS terminates in
//!   front of this process, so sessions here carry the user `"rpc"`
//!
//! The session core never touches the socket directly: this module pumps
//! inbound text frames into [`SessionHandle::receive`] and drains the
//! session's outbound channel into the socket.

use crate::server::Server;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Authentication seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    pub message: String,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        AuthError { message: message.into() }
    }
}

/// Maps request headers to an authenticated user name.  The session layer
/// hosting this process decides what "authenticated" means; the host only
/// requires the seam.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError>;
}

/// Token-in-Authorization-header authenticator: `Bearer <token>` maps to a
/// fixed user name.
pub struct BearerAuthenticator {
    token: String,
    user: String,
}

impl BearerAuthenticator {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Self {
        BearerAuthenticator { token: token.into(), user: user.into() }
    }
}

impl Authenticator for BearerAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) if token == self.token => Ok(self.user.clone()),
            Some(_) => Err(AuthError::new("unknown token")),
            None => Err(AuthError::new("missing Authorization header")),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/jsonrpc", post(crate::jsonrpc::jsonrpc_handler))
        .route("/ws", get(ws_handler))
        .route("/wsrpc", get(wsrpc_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

// ---------------------------------------------------------------------------
// Upgrade handlers
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&headers) {
        return (StatusCode::FORBIDDEN, "cross-origin websocket rejected").into_response();
    }
    let user = if server.config.ws.auth_required {
        match server.authenticate(&headers) {
            Ok(user) => Some(user),
            Err(e) => {
                return (
                    StatusCode::UNAUTHORIZED,
                    format!("You must be logged in to establish a websocket connection: {e}"),
                )
                    .into_response();
            }
        }
    } else {
        server.authenticate(&headers).ok()
    };
    ws.on_upgrade(move |socket| handle_socket(socket, server, user))
}

async fn wsrpc_handler(ws: WebSocketUpgrade, State(server): State<Arc<Server>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, server, Some("rpc".to_owned())))
}

/// Browser-origin check: when an Origin header is present, its host must
/// match the Host header.  Non-browser clients send no Origin and pass.
fn origin_allowed(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let origin_host = origin.split("://").nth(1).unwrap_or(origin);
    origin_host == host
}

// ---------------------------------------------------------------------------
// Socket pump
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, server: Arc<Server>, user: Option<String>) {
    let (session, mut outbound) = server.open_session(user);
    info!(socket = %session.id(), user = ?session.user(), "websocket connected");

    let (mut sink, mut source) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(WsFrame::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = server.lifecycle.stopped.wait() => break,
            frame = source.next() => match frame {
                Some(Ok(WsFrame::Text(text))) => session.receive(&text),
                Some(Ok(WsFrame::Close(_))) | None => {
                    debug!(socket = %session.id(), "peer closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(socket = %session.id(), error = %e, "websocket read error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    session.close();
    writer.abort();
    info!(socket = %session.id(), "websocket session ended");
}
