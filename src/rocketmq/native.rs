//! Driver seam for RocketMQ-style brokers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::config::{ConsumeFrom, Selector};

/// Broker verdict on a synchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

/// Listener verdict for a delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    ConsumeSuccess,
    /// Hand the batch back to the broker for a later retry
    ReconsumeLater,
}

/// A message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct MessageExt {
    pub msg_id: String,
    pub topic: String,
    pub tags: Option<String>,
    pub keys: Vec<String>,
    pub queue_id: i32,
    pub queue_offset: i64,
    /// Broker-side retries so far
    pub reconsume_times: u32,
    pub properties: HashMap<String, String>,
    pub body: Vec<u8>,
    pub born_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub tags: Option<String>,
    pub keys: Vec<String>,
    /// Scheduled delivery level (1-based), `None` for immediate delivery
    pub delay_level: Option<u32>,
    pub properties: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub status: SendStatus,
    pub msg_id: String,
    pub queue_id: i32,
    pub queue_offset: i64,
}

/// Callback the push consumer invokes per delivered batch.
pub type PushListener = Arc<dyn Fn(Vec<MessageExt>) -> BoxFuture<'static, ConsumeResult> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PushConsumerOptions {
    pub group: String,
    pub instance_name: String,
    pub consume_from: ConsumeFrom,
    pub max_reconsume_times: u32,
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub group: String,
    pub instance_name: String,
    pub retry_times: u32,
}

#[async_trait]
pub trait PushConsumer: Send + Sync {
    async fn subscribe(&self, topic: &str, selector: &Selector, listener: PushListener) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn send_sync(&self, message: OutgoingMessage, timeout: Duration) -> Result<SendResult>;

    async fn shutdown(&self) -> Result<()>;
}

/// Builds native consumers and producers.
pub trait RocketMqNative: Send + Sync {
    fn push_consumer(&self, options: PushConsumerOptions) -> Result<Box<dyn PushConsumer>>;

    fn producer(&self, options: ProducerOptions) -> Result<Box<dyn Producer>>;
}
