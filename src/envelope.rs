//! Wire frames, request context and the tagged message type.
//!
//! A transport message is four frames: `[msg_id, topic, style, body]`,
//! where `body` is the JSON text of `[marshaled_context, envelope]`.
//! The message inside the envelope decodes to one of the `Message`
//! variants; names starting with `-` are reserved for internal control.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::codec;
use crate::error::{Result, RpcError};
use crate::transport;

/// Method carrying a wrapped call that expects a reply.
pub const REPLY_METHOD: &str = "-reply";

/// Method carrying the reply back to the caller.
pub const PROCESS_REPLY_METHOD: &str = "-process_reply";

/// The only delivery style on the wire; calls are casts of `-reply`.
pub const CAST_STYLE: &str = "cast";

/// Message id of messages that expect no reply.
pub const NO_REPLY_ID: &str = "0";

/// The four wire frames of one transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frames {
    pub msg_id: String,
    pub topic: String,
    pub style: String,
    pub body: String,
}

impl Frames {
    pub fn new(msg_id: impl Into<String>, topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            topic: topic.into(),
            style: CAST_STYLE.to_string(),
            body: body.into(),
        }
    }

    /// Build frames from a context and an already enveloped message.
    pub fn encode(msg_id: &str, topic: &str, ctx: &RpcContext, envelope: &Value) -> Result<Self> {
        let body = codec::serialize(&(ctx.marshal()?, envelope))?;
        Ok(Self::new(msg_id, topic, body))
    }

    /// Split the body into the marshaled context and the raw envelope.
    pub fn decode_body(&self) -> Result<(String, Value)> {
        let body: Value = codec::deserialize(&self.body)?;
        match body {
            Value::Array(mut parts) if parts.len() == 2 => {
                let envelope = parts.pop().unwrap_or(Value::Null);
                match parts.pop() {
                    Some(Value::String(ctx)) => Ok((ctx, envelope)),
                    _ => Err(RpcError::Envelope("context is not marshaled text".to_string())),
                }
            }
            _ => Err(RpcError::Envelope(
                "body must be a [context, message] pair".to_string(),
            )),
        }
    }

    pub fn into_multipart(self) -> Vec<Vec<u8>> {
        vec![
            self.msg_id.into_bytes(),
            self.topic.into_bytes(),
            self.style.into_bytes(),
            self.body.into_bytes(),
        ]
    }

    pub fn from_multipart(frames: Vec<Vec<u8>>) -> Result<Self> {
        let [msg_id, topic, style, body]: [Vec<u8>; 4] =
            frames.try_into().map_err(|frames: Vec<Vec<u8>>| {
                RpcError::Envelope(format!("expected 4 frames, got {}", frames.len()))
            })?;
        Ok(Self {
            msg_id: frame_text(msg_id)?,
            topic: frame_text(topic)?,
            style: frame_text(style)?,
            body: frame_text(body)?,
        })
    }

    /// Topic segment local routing keys on.
    pub fn routing_key(&self) -> &str {
        transport::base_topic(&self.topic)
    }

    pub fn expects_reply(&self) -> bool {
        !self.msg_id.is_empty() && self.msg_id != NO_REPLY_ID
    }
}

fn frame_text(frame: Vec<u8>) -> Result<String> {
    String::from_utf8(frame).map_err(|e| RpcError::Envelope(format!("frame is not utf-8: {}", e)))
}

/// Caller context travelling with every message.
///
/// Values are arbitrary string-keyed JSON (user, project, request id).
/// Handlers may push replies onto the context to stream several values
/// back for one call.
#[derive(Debug, Default)]
pub struct RpcContext {
    values: Map<String, Value>,
    replies: Mutex<Vec<Value>>,
}

impl RpcContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Map<String, Value>) -> Self {
        Self {
            values,
            replies: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Append one streamed reply.
    pub fn reply(&self, value: Value) {
        self.replies.lock().push(value);
    }

    pub fn take_replies(&self) -> Vec<Value> {
        std::mem::take(&mut *self.replies.lock())
    }

    /// Context as JSON text. Accumulated replies are not marshaled.
    pub fn marshal(&self) -> Result<String> {
        codec::serialize(&self.values)
    }

    pub fn unmarshal(text: &str) -> Result<Self> {
        match codec::deserialize::<Value>(text)? {
            Value::Object(values) => Ok(Self::from_values(values)),
            _ => Err(RpcError::Envelope("context is not an object".to_string())),
        }
    }
}

impl Clone for RpcContext {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            replies: Mutex::new(self.replies.lock().clone()),
        }
    }
}

/// An application method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationCall {
    pub method: String,
    pub version: Option<String>,
    pub args: Map<String, Value>,
}

/// A call wrapped so the receiver sends its result back to `reply_topic`.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalReply {
    pub msg_id: String,
    pub reply_topic: String,
    /// Caller context, marshaled
    pub context: String,
    /// The wrapped application message
    pub request: Value,
}

/// Decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Application(ApplicationCall),
    Reply(InternalReply),
    ProcessReply { msg_id: String, response: Vec<Value> },
}

impl Message {
    pub fn call(method: impl Into<String>, args: Map<String, Value>) -> Self {
        Self::Application(ApplicationCall {
            method: method.into(),
            version: None,
            args,
        })
    }

    pub fn decode(data: &Value) -> Result<Self> {
        let object = data
            .as_object()
            .ok_or_else(|| RpcError::Envelope("message is not an object".to_string()))?;

        let method = match object.get("method") {
            Some(Value::String(method)) if !method.is_empty() => method.as_str(),
            _ => return Err(RpcError::Envelope("message did not include method".to_string())),
        };

        let args = match object.get("args") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => return Err(RpcError::Envelope("args is not an object".to_string())),
        };

        match method {
            REPLY_METHOD => {
                let msg_id = required_str(&args, "msg_id")?;
                let reply_topic = required_str(&args, "topic")?;
                let (context, request) = match args.get("msg") {
                    Some(Value::Array(parts)) if parts.len() == 2 => match &parts[0] {
                        Value::String(ctx) => (ctx.clone(), parts[1].clone()),
                        _ => {
                            return Err(RpcError::Envelope(
                                "wrapped context is not marshaled text".to_string(),
                            ))
                        }
                    },
                    _ => {
                        return Err(RpcError::Envelope(
                            "reply request without [context, message]".to_string(),
                        ))
                    }
                };
                Ok(Self::Reply(InternalReply {
                    msg_id,
                    reply_topic,
                    context,
                    request,
                }))
            }
            PROCESS_REPLY_METHOD => {
                let msg_id = required_str(&args, "msg_id")?;
                let response = match args.get("response") {
                    Some(Value::Array(values)) => values.clone(),
                    _ => return Err(RpcError::Envelope("reply without response list".to_string())),
                };
                Ok(Self::ProcessReply { msg_id, response })
            }
            internal if internal.starts_with('-') => Err(RpcError::Envelope(format!(
                "unknown internal method {}",
                internal
            ))),
            _ => {
                let version = match object.get("version") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(version)) => Some(version.clone()),
                    Some(_) => return Err(RpcError::Envelope("version is not a string".to_string())),
                };
                Ok(Self::Application(ApplicationCall {
                    method: method.to_string(),
                    version,
                    args,
                }))
            }
        }
    }

    pub fn encode(&self) -> Value {
        match self {
            Self::Application(call) => {
                let mut object = Map::new();
                object.insert("method".to_string(), Value::String(call.method.clone()));
                if let Some(version) = &call.version {
                    object.insert("version".to_string(), Value::String(version.clone()));
                }
                object.insert("args".to_string(), Value::Object(call.args.clone()));
                Value::Object(object)
            }
            Self::Reply(reply) => json!({
                "method": REPLY_METHOD,
                "args": {
                    "msg_id": reply.msg_id,
                    "context": reply.context,
                    "topic": reply.reply_topic,
                    "msg": [reply.context, reply.request],
                },
            }),
            Self::ProcessReply { msg_id, response } => json!({
                "method": PROCESS_REPLY_METHOD,
                "args": {"msg_id": msg_id, "response": response},
            }),
        }
    }
}

fn required_str(args: &Map<String, Value>, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        _ => Err(RpcError::Envelope(format!("control message without {}", key))),
    }
}

/// Handler result before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing to return; the caller sees `null`
    Empty,
    Value(Value),
    /// Several values, returned in order
    Stream(Vec<Value>),
}

impl Reply {
    /// Ordered reply list sent back to the caller.
    ///
    /// A stream is taken as is; otherwise replies the handler pushed onto
    /// the context win; otherwise the single value.
    pub fn normalize(self, replies: Vec<Value>) -> Vec<Value> {
        match self {
            Reply::Stream(values) => values,
            _ if !replies.is_empty() => replies,
            Reply::Value(value) => vec![value],
            Reply::Empty => vec![Value::Null],
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}
