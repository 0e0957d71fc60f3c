//! Client-side helper bound to one topic and API version.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::envelope::{Message, RpcContext};
use crate::error::{Result, RpcError};
use crate::rpc::ZmqTransport;

/// Per-request overrides for `RpcProxy`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Send to this topic instead of the proxy's
    pub topic: Option<String>,
    pub version: Option<String>,
    /// Replaces the configured response or cast timeout
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Calls a remote API served on `topic`.
///
/// Every message is stamped with the API version: the override from
/// `CallOptions` when given, the proxy's default otherwise.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use serde_json::{json, Map};
/// # use topicwire::{CallOptions, RpcConfig, RpcContext, RpcProxy, ZmqTransport};
/// # async fn demo() -> topicwire::Result<()> {
/// let transport = Arc::new(ZmqTransport::new(RpcConfig::default()));
/// let orders = RpcProxy::new(transport, "orders", "1.0");
///
/// let mut args = Map::new();
/// args.insert("id".into(), json!(42));
/// let msg = RpcProxy::make_msg("get", args);
/// let order = orders.call(&RpcContext::new(), msg, CallOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcProxy {
    transport: Arc<ZmqTransport>,
    topic: String,
    default_version: String,
}

impl RpcProxy {
    pub fn new(
        transport: Arc<ZmqTransport>,
        topic: impl Into<String>,
        default_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            default_version: default_version.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn make_msg(method: impl Into<String>, args: Map<String, Value>) -> Value {
        Message::call(method, args).encode()
    }

    pub async fn call(&self, ctx: &RpcContext, msg: Value, options: CallOptions) -> Result<Value> {
        let topic = options.topic.as_deref().unwrap_or(&self.topic);
        let msg = self.stamp(msg, options.version.as_deref());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.transport.config().rpc.response_timeout());
        self.transport
            .call_with_timeout(ctx, topic, &msg, timeout)
            .await
            .map_err(|e| annotate_timeout(e, topic, &msg))
    }

    pub async fn multicall(
        &self,
        ctx: &RpcContext,
        msg: Value,
        options: CallOptions,
    ) -> Result<Vec<Value>> {
        let topic = options.topic.as_deref().unwrap_or(&self.topic);
        let msg = self.stamp(msg, options.version.as_deref());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.transport.config().rpc.response_timeout());
        self.transport
            .multicall_with_timeout(ctx, topic, &msg, timeout)
            .await
            .map_err(|e| annotate_timeout(e, topic, &msg))
    }

    pub async fn cast(&self, ctx: &RpcContext, msg: Value, options: CallOptions) -> Result<()> {
        let topic = options.topic.as_deref().unwrap_or(&self.topic);
        let msg = self.stamp(msg, options.version.as_deref());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.transport.config().rpc.cast_timeout());
        self.transport
            .cast_with_timeout(ctx, topic, &msg, timeout)
            .await
            .map_err(|e| annotate_timeout(e, topic, &msg))
    }

    /// Broadcast to every consumer of the proxy's topic.
    pub async fn fanout_cast(&self, ctx: &RpcContext, msg: Value, version: Option<&str>) -> Result<()> {
        let msg = self.stamp(msg, version);
        self.transport
            .fanout_cast(ctx, &self.topic, &msg)
            .await
            .map_err(|e| annotate_timeout(e, &self.topic, &msg))
    }

    fn stamp(&self, mut msg: Value, version: Option<&str>) -> Value {
        if let Value::Object(object) = &mut msg {
            let version = version.unwrap_or(&self.default_version);
            object.insert("version".to_string(), Value::String(version.to_string()));
        }
        msg
    }
}

fn annotate_timeout(err: RpcError, topic: &str, msg: &Value) -> RpcError {
    match err {
        RpcError::Timeout(message) => {
            let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
            RpcError::Timeout(format!(
                "{} - Topic: \"{}\" - RPC Method: \"{}\"",
                message, topic, method
            ))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::matchmaker::{MatchMaker, QueueTarget};
    use async_trait::async_trait;
    use serde_json::json;

    struct Nobody;

    #[async_trait]
    impl MatchMaker for Nobody {
        async fn queues(&self, _topic: &str) -> Result<Vec<QueueTarget>> {
            Ok(Vec::new())
        }
    }

    fn proxy() -> RpcProxy {
        let transport = ZmqTransport::with_matchmaker(RpcConfig::default(), Arc::new(Nobody));
        RpcProxy::new(Arc::new(transport), "orders", "1.0")
    }

    fn args(id: i64) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("id".to_string(), json!(id));
        args
    }

    #[test]
    fn test_make_msg_and_version_stamp() {
        let proxy = proxy();
        let msg = RpcProxy::make_msg("get", args(42));
        assert_eq!(msg, json!({"method": "get", "args": {"id": 42}}));

        assert_eq!(proxy.stamp(msg.clone(), None)["version"], "1.0");
        assert_eq!(proxy.stamp(msg, Some("1.3"))["version"], "1.3");
    }

    #[tokio::test]
    async fn test_timeout_names_topic_and_method() {
        let proxy = proxy();
        let ctx = RpcContext::new();
        let msg = RpcProxy::make_msg("get", args(42));

        match proxy.call(&ctx, msg.clone(), CallOptions::default()).await {
            Err(RpcError::Timeout(message)) => {
                assert_eq!(
                    message,
                    "No match from matchmaker. - Topic: \"orders\" - RPC Method: \"get\""
                );
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        let err = proxy
            .cast(&ctx, msg.clone(), CallOptions::default().topic("billing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Topic: \"billing\""));

        let err = proxy.fanout_cast(&ctx, msg, None).await.unwrap_err();
        assert!(err.to_string().contains("Topic: \"orders\""));
    }

    #[test]
    fn test_other_errors_pass_through() {
        let err = annotate_timeout(RpcError::Envelope("bad".to_string()), "orders", &json!({}));
        assert!(matches!(err, RpcError::Envelope(_)));
    }
}
