//! Wire codec: JSON text encoding plus the versioned message envelope.
//!
//! Every outbound message is wrapped as
//! `{"oslo.version": "2.0", "oslo.message": "<json text>"}`; inbound
//! messages must carry both keys and a compatible version.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, RpcError};

/// Envelope version this crate writes.
pub const ENVELOPE_VERSION: &str = "2.0";

pub const VERSION_KEY: &str = "oslo.version";
pub const MESSAGE_KEY: &str = "oslo.message";

/// Serialize a value to JSON text.
///
/// Values that have no JSON form (maps with non-string keys, for example)
/// fail instead of being coerced.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Parse JSON text.
pub fn deserialize<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Wrap a message in the versioned envelope.
pub fn serialize_msg(msg: &Value) -> Result<Value> {
    let mut envelope = Map::new();
    envelope.insert(VERSION_KEY.to_string(), Value::String(ENVELOPE_VERSION.to_string()));
    envelope.insert(MESSAGE_KEY.to_string(), Value::String(serialize(msg)?));
    Ok(Value::Object(envelope))
}

/// Check that `raw` is an envelope this crate can read.
pub fn verify_envelope(raw: &Value) -> Result<()> {
    let envelope = raw
        .as_object()
        .ok_or_else(|| RpcError::Envelope("envelope is not an object".to_string()))?;

    let version = match envelope.get(VERSION_KEY) {
        Some(Value::String(version)) => version,
        Some(_) => {
            return Err(RpcError::Envelope(format!("{} is not a string", VERSION_KEY)));
        }
        None => return Err(RpcError::Envelope(format!("missing {}", VERSION_KEY))),
    };

    match envelope.get(MESSAGE_KEY) {
        Some(Value::String(_)) => {}
        Some(_) => {
            return Err(RpcError::Envelope(format!("{} is not a string", MESSAGE_KEY)));
        }
        None => return Err(RpcError::Envelope(format!("missing {}", MESSAGE_KEY))),
    }

    if !version_is_compatible(ENVELOPE_VERSION, version) {
        return Err(RpcError::UnsupportedEnvelopeVersion(version.clone()));
    }
    Ok(())
}

/// Verify the envelope and return the message it carries.
pub fn deserialize_msg(raw: &Value) -> Result<Value> {
    verify_envelope(raw)?;
    match raw.get(MESSAGE_KEY) {
        Some(Value::String(text)) => deserialize(text),
        _ => Err(RpcError::Envelope(format!("missing {}", MESSAGE_KEY))),
    }
}

/// `requested` is compatible when the major versions match and its minor
/// version is not newer than `implemented`.
pub fn version_is_compatible(implemented: &str, requested: &str) -> bool {
    match (parse_version(implemented), parse_version(requested)) {
        (Some((imp_major, imp_minor)), Some((req_major, req_minor))) => {
            imp_major == req_major && req_minor <= imp_minor
        }
        _ => false,
    }
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    // a patch component is allowed and ignored
    if let Some(patch) = parts.next() {
        patch.parse::<u32>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_roundtrip_nested_payload() {
        let payload = json!({
            "method": "create",
            "args": {"id": 42, "tags": ["a", "b"], "limits": {"ram": 2048, "ratio": 0.5}, "note": null},
        });
        let text = serialize(&payload).unwrap();
        let back: Value = deserialize(&text).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_serialize_rejects_non_string_keys() {
        let mut map = HashMap::new();
        map.insert(vec![1u8, 2], "value");
        assert!(matches!(serialize(&map), Err(RpcError::Serialization(_))));
    }

    #[test]
    fn test_deserialize_malformed() {
        assert!(matches!(
            deserialize::<Value>("{\"method\": "),
            Err(RpcError::Serialization(_))
        ));
    }

    #[test]
    fn test_envelope_wraps_and_unwraps() {
        let msg = json!({"method": "get", "args": {"id": 1}});
        let envelope = serialize_msg(&msg).unwrap();
        assert_eq!(envelope[VERSION_KEY], json!("2.0"));
        assert!(envelope[MESSAGE_KEY].is_string());
        assert_eq!(deserialize_msg(&envelope).unwrap(), msg);
    }

    #[test]
    fn test_verify_envelope_fails_closed() {
        assert!(matches!(verify_envelope(&json!([1, 2])), Err(RpcError::Envelope(_))));
        assert!(matches!(
            verify_envelope(&json!({"method": "get", "args": {}})),
            Err(RpcError::Envelope(_))
        ));
        assert!(matches!(
            verify_envelope(&json!({VERSION_KEY: "2.0"})),
            Err(RpcError::Envelope(_))
        ));
        assert!(matches!(
            verify_envelope(&json!({VERSION_KEY: 2, MESSAGE_KEY: "{}"})),
            Err(RpcError::Envelope(_))
        ));
        assert!(matches!(
            verify_envelope(&json!({VERSION_KEY: "3.0", MESSAGE_KEY: "{}"})),
            Err(RpcError::UnsupportedEnvelopeVersion(v)) if v == "3.0"
        ));
        assert!(matches!(
            verify_envelope(&json!({VERSION_KEY: "2.1", MESSAGE_KEY: "{}"})),
            Err(RpcError::UnsupportedEnvelopeVersion(_))
        ));
    }

    #[test]
    fn test_version_compatibility() {
        assert!(version_is_compatible("2.0", "2.0"));
        assert!(version_is_compatible("2.3", "2.1"));
        assert!(version_is_compatible("2.3", "2"));
        assert!(version_is_compatible("1.1.0", "1.0.5"));
        assert!(!version_is_compatible("2.0", "2.1"));
        assert!(!version_is_compatible("2.0", "1.0"));
        assert!(!version_is_compatible("2.0", "two"));
        assert!(!version_is_compatible("2.0", "2.0.0.1"));
    }
}
