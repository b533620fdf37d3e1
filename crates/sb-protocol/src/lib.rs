// sb-protocol: RPC wire types and canonical encoding.
//
// Both transports (the JSON-RPC endpoint and the WebSocket endpoint) speak
// plain JSON objects; the types here model the inbound message shape, the
// positional/keyword parameter split, and the outbound frame shape.  The
// canonical encoding (sorted keys, tightest separators) lives here too
// because the payload fingerprint is defined over it.

use serde::Deserialize;
use serde_json::{Map, Value};

pub mod serialize;

pub use serialize::{Serializer, SerializerError, canonical_json, fingerprint, fingerprint_hex};

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// An inbound websocket frame, after JSON parsing.
///
/// Every field is optional on the wire; unknown keys are tolerated and
/// ignored.  `id` is only meaningful on the JSON-RPC transport, where it is
/// echoed back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Message {
    /// Qualified `service.method` name.
    pub method: Option<String>,
    /// Raw params value; see [`Params::from_value`] for the split rules.
    pub params: Option<Value>,
    /// Peer-chosen subscription id.
    pub client: Option<String>,
    /// Peer-chosen reply-slot id.
    pub callback: Option<String>,
    /// Connection-level action; currently only `"unsubscribe"`.
    pub action: Option<String>,
    /// Opaque JSON-RPC request id.
    pub id: Option<Value>,
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// Call parameters as a tagged positional/keyword split.
///
/// The source protocol conflates lists, objects and scalars in one `params`
/// field; handlers here always see one of these three shapes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// Split a raw `params` value using the websocket rules: omitted or
    /// null means no arguments, an array is positional, an object is
    /// keyword, and any other scalar becomes a single positional argument.
    pub fn from_value(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) => Params::None,
            Some(Value::Array(items)) => Params::Positional(items),
            Some(Value::Object(map)) => Params::Named(map),
            Some(scalar) => Params::Positional(vec![scalar]),
        }
    }

    /// Reassemble the wire value, for re-sending a stored call upstream.
    pub fn to_value(&self) -> Value {
        match self {
            Params::None => Value::Null,
            Params::Positional(items) => Value::Array(items.clone()),
            Params::Named(map) => Value::Object(map.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(items) => items.is_empty(),
            Params::Named(map) => map.is_empty(),
        }
    }

    /// Positional argument by index, if present.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Params::Positional(items) => items.get(index),
            _ => None,
        }
    }

    /// Keyword argument by name, if present.
    pub fn name(&self, key: &str) -> Option<&Value> {
        match self {
            Params::Named(map) => map.get(key),
            _ => None,
        }
    }

    /// First positional argument deserialized to a concrete type.
    pub fn one<T: serde::de::DeserializeOwned>(&self) -> Result<T, ParamsError> {
        let value = self.get(0).ok_or(ParamsError::Missing(0))?;
        serde_json::from_value(value.clone()).map_err(|e| ParamsError::Invalid(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("missing positional argument {0}")]
    Missing(usize),
    #[error("invalid argument: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Outbound frame
// ---------------------------------------------------------------------------

/// An outbound frame.  Null-valued keys are stripped before
/// serialization: an absent member and a member carrying JSON null
/// produce the same wire object, so a method returning null yields a
/// frame with no `data` key at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub data: Option<Value>,
    pub error: Option<Value>,
    pub client: Option<String>,
    pub callback: Option<String>,
    pub trigger: Option<String>,
}

impl Frame {
    pub fn data(data: Value) -> Self {
        Frame { data: Some(data), ..Frame::default() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame { error: Some(Value::String(message.into())), ..Frame::default() }
    }

    pub fn client(mut self, client: Option<String>) -> Self {
        self.client = client;
        self
    }

    pub fn callback(mut self, callback: Option<String>) -> Self {
        self.callback = callback;
        self
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// The payload, when one is present and non-null.  Fingerprint dedup
    /// applies only to frames with an actual payload.
    pub fn payload(&self) -> Option<&Value> {
        self.data.as_ref().filter(|data| !data.is_null())
    }

    /// Build the wire object, dropping absent and null members.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(data) = self.payload() {
            map.insert("data".to_owned(), data.clone());
        }
        if let Some(error) = self.error.as_ref().filter(|error| !error.is_null()) {
            map.insert("error".to_owned(), error.clone());
        }
        if let Some(client) = &self.client {
            map.insert("client".to_owned(), Value::String(client.clone()));
        }
        if let Some(callback) = &self.callback {
            map.insert("callback".to_owned(), Value::String(callback.clone()));
        }
        if let Some(trigger) = &self.trigger {
            map.insert("trigger".to_owned(), Value::String(trigger.clone()));
        }
        Value::Object(map)
    }

    /// Canonical wire text for this frame.
    pub fn encode(&self) -> String {
        canonical_json(&self.to_value())
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC error codes
// ---------------------------------------------------------------------------

/// Error codes used by the `POST /jsonrpc` endpoint.
pub mod jsonrpc_codes {
    pub const ERR_INVALID_JSON: i64 = -32700;
    pub const ERR_INVALID_RPC: i64 = -32600;
    pub const ERR_MISSING_FUNC: i64 = -32601;
    pub const ERR_INVALID_PARAMS: i64 = -32602;
    pub const ERR_FUNC_EXCEPTION: i64 = -32603;
}
