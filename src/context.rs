//! Per-invocation call context.
//!
//! Every handling step (a responder worker picking up a message, a
//! broadcaster worker re-firing a subscription, the JSON-RPC handler) gets
//! a fresh `Context`; nothing is ambient and nested reads never cross
//! steps.  The one deliberately sticky piece is `client_data`: a
//! per-subscription scratch map whose snapshot is captured when a
//! subscription is cached and re-installed before every trigger
//! re-invocation.

use crate::session::SessionHandle;
use sb_protocol::Message;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

pub type ClientData = Arc<Mutex<Map<String, Value>>>;

#[derive(Clone, Default)]
pub struct Context {
    /// Authenticated user for the connection, if any.
    pub user: Option<String>,
    /// Subscription id of the request being handled.
    pub client: Option<String>,
    /// Reply-slot id of the request being handled.
    pub callback: Option<String>,
    /// The session the request arrived on; absent on the JSON-RPC path.
    pub websocket: Option<SessionHandle>,
    /// Sticky per-subscription scratch map.
    pub client_data: ClientData,
    /// The raw inbound message; present on the initial call but not on
    /// trigger re-invocations.
    pub message: Option<Message>,
    /// Trigger label when invoked from the broadcast path.
    pub trigger: Option<String>,
    /// Client id to exclude from notification fan-out.
    pub originating_client: Option<String>,
}

impl Context {
    /// The client id for this step: the explicit field, or the one carried
    /// by the inbound message.
    pub fn client_id(&self) -> Option<String> {
        self.client
            .clone()
            .or_else(|| self.message.as_ref().and_then(|m| m.client.clone()))
    }

    /// Read a value out of the client-data scratch map.
    pub fn client_data_get(&self, key: &str) -> Option<Value> {
        self.client_data.lock().expect("client data lock").get(key).cloned()
    }

    /// Write a value into the client-data scratch map.
    pub fn client_data_set(&self, key: impl Into<String>, value: Value) {
        self.client_data.lock().expect("client data lock").insert(key.into(), value);
    }

    /// Copy of the current client-data map, captured into cached queries.
    pub fn client_data_snapshot(&self) -> Map<String, Value> {
        self.client_data.lock().expect("client data lock").clone()
    }

    /// A context carrying a restored client-data snapshot, used by the
    /// trigger path.
    pub fn with_client_data(snapshot: Map<String, Value>) -> Self {
        Context { client_data: Arc::new(Mutex::new(snapshot)), ..Context::default() }
    }
}
