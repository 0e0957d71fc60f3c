//! Application handler seam and the remote failure format.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codec;
use crate::envelope::{Reply, RpcContext};
use crate::error::{Result, RpcError};

/// Application code behind a consumer.
///
/// Implementations decide what `method` and `version` mean. A failure
/// is sent back to the caller when a reply is expected, and only logged
/// otherwise.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        ctx: &RpcContext,
        version: Option<&str>,
        method: &str,
        args: Map<String, Value>,
    ) -> std::result::Result<Reply, HandlerError>;
}

/// Failure raised by a `Dispatcher`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub class: String,
    pub module: String,
    pub message: String,
    pub traceback: Vec<String>,
    /// Caused by the caller (bad input, missing object); logged quietly
    pub expected: bool,
}

impl HandlerError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            module: "topicwire".to_string(),
            message: message.into(),
            traceback: Vec::new(),
            expected: false,
        }
    }

    /// A client-caused failure.
    pub fn expected(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expected: true,
            ..Self::new(class, message)
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::expected("UnsupportedRpcVersion", format!("unknown method {}", method))
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Serialized form of a handler failure, carried as `{"exc": "<json>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub class: String,
    pub module: String,
    pub message: String,
    #[serde(default)]
    pub tb: Vec<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RemoteFailure {
    pub fn to_reply_value(&self) -> Result<Value> {
        Ok(json!({ "exc": codec::serialize(self)? }))
    }

    /// `Some` when `value` is a failure marker.
    pub fn from_reply_value(value: &Value) -> Option<Result<Self>> {
        match value.get("exc")? {
            Value::String(text) => Some(codec::deserialize(text)),
            _ => Some(Err(RpcError::Envelope("exc is not serialized text".to_string()))),
        }
    }

    pub fn into_error(self) -> RpcError {
        RpcError::Remote {
            exc_type: self.class,
            value: self.message,
            traceback: self.tb.join("\n"),
        }
    }
}

impl From<&HandlerError> for RemoteFailure {
    fn from(err: &HandlerError) -> Self {
        Self {
            class: err.class.clone(),
            module: err.module.clone(),
            message: err.message.clone(),
            tb: err.traceback.clone(),
            args: vec![Value::String(err.message.clone())],
            kwargs: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_marker_roundtrip() {
        let err = HandlerError::new("ValueError", "bad id")
            .with_module("orders.api")
            .with_traceback(vec!["frame 1".to_string(), "frame 2".to_string()]);
        assert!(!err.expected);
        assert_eq!(err.to_string(), "ValueError: bad id");

        let marker = RemoteFailure::from(&err).to_reply_value().unwrap();
        assert!(marker["exc"].is_string());

        let failure = RemoteFailure::from_reply_value(&marker).unwrap().unwrap();
        assert_eq!(failure.module, "orders.api");
        match failure.into_error() {
            RpcError::Remote { exc_type, value, traceback } => {
                assert_eq!(exc_type, "ValueError");
                assert_eq!(value, "bad id");
                assert_eq!(traceback, "frame 1\nframe 2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_values_are_not_failures() {
        assert!(RemoteFailure::from_reply_value(&json!({"status": "ok"})).is_none());
        assert!(RemoteFailure::from_reply_value(&json!(3)).is_none());
        assert!(matches!(
            RemoteFailure::from_reply_value(&json!({"exc": 1})),
            Some(Err(RpcError::Envelope(_)))
        ));
    }

    #[test]
    fn test_expected_errors() {
        let err = HandlerError::unknown_method("frobnicate");
        assert!(err.expected);
        assert!(err.message.contains("frobnicate"));
    }
}
