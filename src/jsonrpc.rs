//! JSON-RPC over HTTP POST, sharing the registry and dispatch path with
//! the websocket transport.
//!
//! Inbound: `POST /jsonrpc` with a JSON body `{id?, method, params?}`.
//! Outbound: [`JsonRpcProxy`], the synchronous-only proxy registered under
//! the jsonrpc namespace for every remote service.

use crate::config::TlsMaterial;
use crate::registry::Resolved;
use crate::server::Server;
use crate::upstream::UpstreamError;
use axum::Json;
use axum::extract::State;
use sb_protocol::jsonrpc_codes::{
    ERR_FUNC_EXCEPTION, ERR_INVALID_JSON, ERR_INVALID_PARAMS, ERR_INVALID_RPC, ERR_MISSING_FUNC,
};
use sb_protocol::{Params, canonical_json};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

fn error_body(id: Value, code: i64, message: impl Into<String>) -> Json<Value> {
    let body = json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message.into()}});
    warn!("returning error message: {body}");
    Json(body)
}

fn success_body(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

/// `POST /jsonrpc`.  Accepts any textual content type whose body is a
/// JSON object of shape `{id?, method, params?}`.
pub async fn jsonrpc_handler(State(server): State<Arc<Server>>, body: String) -> Json<Value> {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return error_body(Value::Null, ERR_INVALID_JSON, format!("invalid json input {body:?}"));
    };
    let Some(request) = value.as_object() else {
        return error_body(Value::Null, ERR_INVALID_RPC, "jsonrpc request must be a json object");
    };
    debug!("jsonrpc request body: {value}");

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return error_body(id, ERR_INVALID_RPC, "\"method\" field required for jsonrpc request");
    };

    let raw_params = request.get("params").cloned();
    match &raw_params {
        None | Some(Value::Array(_) | Value::Object(_)) => {}
        Some(other) => {
            return error_body(id, ERR_INVALID_PARAMS, format!("invalid parameter list: {other}"));
        }
    }
    let params = Params::from_value(raw_params);

    let resolved = match server.registry.resolve(method) {
        Ok(resolved) => resolved,
        Err(e) => return error_body(id, ERR_MISSING_FUNC, e.to_string()),
    };

    // `websocket_client` marks the originating client so that any notify
    // fired during the call skips that client's subscriptions.
    let ctx = crate::context::Context {
        originating_client: request
            .get("websocket_client")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        ..crate::context::Context::default()
    };

    match resolved {
        Resolved::Local(local) => match server.invoke(&local, params, ctx).await {
            Ok(result) => success_body(id, result),
            Err(e) => {
                error!(method = %method, error = %e.message, "unexpected jsonrpc error");
                let message = if server.config.debug {
                    format!("unexpected error: {}", e.render(true))
                } else {
                    "unexpected error".to_owned()
                };
                error_body(id, ERR_FUNC_EXCEPTION, message)
            }
        },
        Resolved::Remote(upstream) => match upstream.call(method, params.to_value()).await {
            Ok(result) => success_body(id, result),
            Err(e) => {
                error!(method = %method, error = %e, "unexpected jsonrpc error");
                error_body(id, ERR_FUNC_EXCEPTION, e.to_string())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Outbound proxy
// ---------------------------------------------------------------------------

/// Synchronous-only proxy to a remote host's `/jsonrpc` endpoint,
/// registered under the jsonrpc namespace for each remote service.
pub struct JsonRpcProxy {
    url: String,
    service: String,
    client: reqwest::Client,
}

impl JsonRpcProxy {
    pub fn new(
        url: impl Into<String>,
        service: impl Into<String>,
        tls: &TlsMaterial,
    ) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca) = &tls.ca {
            let pem = std::fs::read(ca)
                .map_err(|e| UpstreamError::Tls(format!("reading ca '{ca}': {e}")))?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| UpstreamError::Tls(format!("parsing ca '{ca}': {e}")))?
            {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
            let mut pem = std::fs::read(cert)
                .map_err(|e| UpstreamError::Tls(format!("reading client cert '{cert}': {e}")))?;
            pem.extend(
                std::fs::read(key)
                    .map_err(|e| UpstreamError::Tls(format!("reading client key '{key}': {e}")))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| UpstreamError::Tls(e.to_string()))?;
            builder = builder.identity(identity);
        }
        let client = builder.build().map_err(|e| UpstreamError::Tls(e.to_string()))?;
        Ok(JsonRpcProxy { url: url.into(), service: service.into(), client })
    }

    /// Call a method on the remote service.  A bare method name is
    /// qualified with this proxy's service name.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let qualified = if method.contains('.') {
            method.to_owned()
        } else {
            format!("{}.{}", self.service, method)
        };
        let mut body = Map::new();
        body.insert("jsonrpc".to_owned(), json!("2.0"));
        body.insert("id".to_owned(), json!(1));
        body.insert("method".to_owned(), Value::String(qualified));
        if !params.is_null() {
            body.insert("params".to_owned(), params);
        }

        let response = self
            .client
            .post(&self.url)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let envelope: Value =
            response.json().await.map_err(|e| UpstreamError::Connect(e.to_string()))?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| canonical_json(error), ToOwned::to_owned);
            return Err(UpstreamError::Remote(message));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}
