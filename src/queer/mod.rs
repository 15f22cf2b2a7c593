//! The broker-agnostic client contract.
//!
//! Callers depend on [`MessageQueer`], which bundles five capabilities:
//! consuming, publishing, handler registration, stop and graceful stop. Each
//! transport client ([`KafkaClient`](crate::kafka::KafkaClient),
//! [`AmqpClient`](crate::amqp::AmqpClient),
//! [`RocketMqClient`](crate::rocketmq::RocketMqClient)) implements all of them.

mod dispatch;
mod factory;

pub(crate) use dispatch::{consume_with, HandlerSlot};
pub use factory::create_message_queer;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;

use crate::context::Context;
use crate::error::Result;
use crate::message::{Message, RespMessage};

/// Business callback invoked once per delivered message.
///
/// The handler decides the message's fate with [`Message::ack`] or
/// [`Message::nack`]. Returning an error nacks a still-unresolved message.
pub type Handler = Arc<dyn Fn(Context, Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, msg| f(ctx, msg).boxed())
}

/// What a client is configured to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Publish,
    Consume,
    #[default]
    Both,
}

impl RunMode {
    pub fn can_publish(self) -> bool {
        matches!(self, RunMode::Publish | RunMode::Both)
    }

    pub fn can_consume(self) -> bool {
        matches!(self, RunMode::Consume | RunMode::Both)
    }
}

/// Per-call consume options.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Topics to subscribe instead of the configured ones (Kafka-style only)
    pub topics: Vec<String>,
    /// Ack messages the handler left unresolved after returning `Ok`
    pub auto_ack_on_success: bool,
}

impl ConsumeOptions {
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack_on_success = true;
        self
    }
}

/// Per-call publish options. Fields a transport has no use for are ignored.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Partitioning key (Kafka-style)
    pub key: Option<String>,
    /// Explicit partition, honored by the `manual` partitioner
    pub partition: Option<i32>,
    /// Routing key overriding the publish target (AMQP-style)
    pub routing_key: Option<String>,
    /// Message tag used by selectors (RocketMQ-style)
    pub tags: Option<String>,
    /// Business keys (RocketMQ-style)
    pub keys: Vec<String>,
    /// Delay level for scheduled delivery (RocketMQ-style)
    pub delay_level: Option<u32>,
    /// Overrides the configured publish timeout
    pub timeout: Option<Duration>,
    /// Extra headers merged over the message's own
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn delay_level(mut self, level: u32) -> Self {
        self.delay_level = Some(level);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Message headers with the per-call headers merged on top.
    pub(crate) fn merged_headers(&self, msg: &Message) -> HashMap<String, String> {
        let mut headers = msg.header.clone();
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Block delivering messages to the registered handler until the stream
    /// ends, the client stops, `ctx` is cancelled or the handler fails.
    async fn consume(&self, ctx: &Context, opts: ConsumeOptions) -> Result<()>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        ctx: &Context,
        target: &str,
        msg: Message,
        opts: PublishOptions,
    ) -> Result<RespMessage>;
}

pub trait HandlerRegistrar: Send + Sync {
    /// Install the business callback; must happen before `consume`.
    fn register_handler(&self, handler: Handler) -> Result<()>;
}

#[async_trait]
pub trait Stopper: Send + Sync {
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
pub trait GracefulStopper: Send + Sync {
    /// Stop and wait for every in-flight handler invocation to finish.
    async fn graceful_stop(&self) -> Result<()>;
}

/// The full client contract.
pub trait MessageQueer: Consumer + Publisher + HandlerRegistrar + Stopper + GracefulStopper {
    /// Transport label used in logs and metrics.
    fn transport(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_capabilities() {
        assert!(RunMode::Both.can_publish() && RunMode::Both.can_consume());
        assert!(RunMode::Publish.can_publish() && !RunMode::Publish.can_consume());
        assert!(!RunMode::Consume.can_publish() && RunMode::Consume.can_consume());
    }

    #[test]
    fn test_run_mode_deserializes_lowercase() {
        let mode: RunMode = serde_json::from_str("\"consume\"").unwrap();
        assert_eq!(mode, RunMode::Consume);
    }

    #[test]
    fn test_publish_headers_override_message_headers() {
        let msg = Message::new("x").with_header("a", "1").with_header("b", "2");
        let opts = PublishOptions::default().header("b", "3");

        let headers = opts.merged_headers(&msg);
        assert_eq!(headers.get("a").map(String::as_str), Some("1"));
        assert_eq!(headers.get("b").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_handler_fn_wraps_closure() {
        let handler = handler_fn(|_ctx, msg: Message| async move {
            msg.ack();
            Ok(())
        });
        let msg = Message::new("x");

        handler(Context::background(), msg.clone()).await.unwrap();
        assert!(msg.is_acked());
    }
}
