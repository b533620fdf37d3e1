//! Canonical JSON encoding, payload fingerprints, and the pluggable
//! type-to-encoder registry.
//!
//! The canonical encoding sorts object keys lexicographically and uses the
//! tightest separators (no whitespace).  Fingerprints are the 128-bit MD5
//! digest of that encoding and are used only for equality, never for
//! security.

use chrono::{NaiveDate, NaiveDateTime};
use md5::{Digest, Md5};
use serde_json::Value;
use std::any::{Any, TypeId, type_name};
use std::collections::BTreeSet;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Canonical encoding
// ---------------------------------------------------------------------------

/// Encode a JSON value with sorted object keys and minimal separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; serde_json handles escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// 128-bit fingerprint of a payload: the MD5 digest of its canonical JSON
/// encoding.  String payloads hash the raw string, so that textual data
/// fingerprints identically whether or not it passed through JSON first.
pub fn fingerprint(value: &Value) -> [u8; 16] {
    let mut md5 = Md5::new();
    match value {
        Value::String(s) => md5.update(s.as_bytes()),
        other => md5.update(canonical_json(other).as_bytes()),
    }
    md5.finalize().into()
}

/// Hex rendering of [`fingerprint`], for logs and tests.
pub fn fingerprint_hex(value: &Value) -> String {
    hex::encode(fingerprint(value))
}

// ---------------------------------------------------------------------------
// Serializer registry
// ---------------------------------------------------------------------------

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Option<Value> + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerializerError {
    #[error("{0} already has an encoder registered")]
    DuplicateType(&'static str),
    #[error("no encoder registered for {0}")]
    UnsupportedType(&'static str),
}

/// Pluggable registry mapping concrete types to JSON encoders.
///
/// Plugins register encoders for their own domain types; the base set
/// covers dates (`YYYY-MM-DD`), date-times (`YYYY-MM-DD HH:MM:SS.ffffff`)
/// and string sets (sorted arrays).  Registering the same type twice is an
/// error, as is encoding a type with no registered encoder.
pub struct Serializer {
    encoders: Vec<(TypeId, &'static str, EncodeFn)>,
}

impl Serializer {
    const DATETIME_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S%.6f";

    /// A registry pre-loaded with the base encoders.
    pub fn new() -> Self {
        let mut serializer = Serializer { encoders: Vec::new() };
        serializer
            .register::<NaiveDate>(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .expect("base date encoder registers once");
        serializer
            .register::<NaiveDateTime>(|dt| {
                Value::String(dt.format(Self::DATETIME_FORMAT).to_string())
            })
            .expect("base datetime encoder registers once");
        serializer
            .register::<BTreeSet<String>>(|s| {
                Value::Array(s.iter().cloned().map(Value::String).collect())
            })
            .expect("base set encoder registers once");
        serializer
    }

    /// Register an encoder for `T`.  Fails if `T` already has one.
    pub fn register<T: Any>(
        &mut self,
        encode: impl Fn(&T) -> Value + Send + Sync + 'static,
    ) -> Result<(), SerializerError> {
        let id = TypeId::of::<T>();
        if self.encoders.iter().any(|(existing, _, _)| *existing == id) {
            return Err(SerializerError::DuplicateType(type_name::<T>()));
        }
        let encode: EncodeFn =
            Arc::new(move |any| any.downcast_ref::<T>().map(&encode));
        self.encoders.push((id, type_name::<T>(), encode));
        Ok(())
    }

    /// Encode a value of a registered type to JSON.
    pub fn encode<T: Any>(&self, value: &T) -> Result<Value, SerializerError> {
        self.encode_any(value)
            .map_err(|_| SerializerError::UnsupportedType(type_name::<T>()))
    }

    /// Dynamic variant of [`Serializer::encode`].  The static variant
    /// reports the offending type by name; this one cannot.
    pub fn encode_any(&self, value: &dyn Any) -> Result<Value, SerializerError> {
        let id = value.type_id();
        self.encoders
            .iter()
            .find(|(registered, _, _)| *registered == id)
            .and_then(|(_, _, encode)| encode(value))
            .ok_or(SerializerError::UnsupportedType("unregistered type"))
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_and_uses_minimal_separators() {
        let value = json!({"b": 2, "a": {"y": 4, "x": 3}});
        assert_eq!(canonical_json(&value), r#"{"a":{"x":3,"y":4},"b":2}"#);
    }

    #[test]
    fn canonical_json_round_trips_to_an_equal_value() {
        let value = json!({"z": [1, 2.5, null, "s"], "a": {"k": true}});
        let encoded = canonical_json(&value);
        let decoded: Value = serde_json::from_str(&encoded).expect("canonical text parses");
        assert_eq!(decoded, value);
    }

    // Golden digests pinned against the original implementation.
    #[test]
    fn fingerprint_matches_known_digests() {
        assert_eq!(fingerprint_hex(&Value::Null), "37a6259cc0c1dae299a7866489dff0bd");
        assert_eq!(fingerprint_hex(&json!("test")), "098f6bcd4621d373cade4e832627b4f6");
        assert_eq!(fingerprint_hex(&json!({"key": "value"})), "a7353f7cddce808de0032747a0b7be50");
        assert_eq!(fingerprint_hex(&json!({"a": 1, "b": 2})), "608de49a4600dbb5b173492759792e4a");
        assert_eq!(
            fingerprint_hex(&json!({"a": {"x": 3, "y": 4}, "b": 2})),
            "2c22e445e9278c66dd7ea78b757defe6"
        );
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let left = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let right = json!({"b": {"d": 3, "c": 2}, "a": 1});
        assert_eq!(fingerprint(&left), fingerprint(&right));
    }

    #[test]
    fn serializer_encodes_base_types() {
        let serializer = Serializer::new();

        let date = NaiveDate::from_ymd_opt(2014, 5, 13).expect("valid date");
        assert_eq!(serializer.encode(&date).expect("date encodes"), json!("2014-05-13"));

        let datetime = date.and_hms_micro_opt(10, 1, 2, 300).expect("valid datetime");
        assert_eq!(
            serializer.encode(&datetime).expect("datetime encodes"),
            json!("2014-05-13 10:01:02.000300")
        );

        let set: BTreeSet<String> = ["b", "a"].iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(serializer.encode(&set).expect("set encodes"), json!(["a", "b"]));
    }

    #[test]
    fn serializer_rejects_duplicate_and_unknown_types() {
        struct Custom(u32);
        let mut serializer = Serializer::new();

        serializer
            .register::<Custom>(|c| json!(c.0))
            .expect("first registration succeeds");
        assert!(matches!(
            serializer.register::<Custom>(|c| json!(c.0)),
            Err(SerializerError::DuplicateType(_))
        ));

        struct Unregistered;
        assert!(matches!(
            serializer.encode(&Unregistered),
            Err(SerializerError::UnsupportedType(_))
        ));
    }

    #[test]
    fn registered_encoder_round_trips_through_canonical_json() {
        struct Point {
            x: i64,
            y: i64,
        }
        let mut serializer = Serializer::new();
        serializer
            .register::<Point>(|p| json!({"x": p.x, "y": p.y}))
            .expect("point encoder registers");

        let encoded = serializer.encode(&Point { x: 1, y: 2 }).expect("point encodes");
        let text = canonical_json(&encoded);
        let decoded: Value = serde_json::from_str(&text).expect("canonical text parses");
        assert_eq!(decoded, encoded);
    }
}
