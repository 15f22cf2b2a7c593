//! Driver seam for AMQP 0.9.1 brokers.
//!
//! The transport client only talks to these traits; [`memory`](super::memory)
//! and the `lapin` feature provide implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

use super::config::ExchangeConfig;

/// Opens native connections to one broker address.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>>;

    fn is_closed(&self) -> bool;

    /// Close notification: completes once the connection is gone.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<()>;

    async fn queue_declare(&self, queue: &str, durable: bool, exclusive: bool) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Put the channel into publisher-confirm mode.
    async fn confirm_select(&self) -> Result<()>;

    /// Publish one message. In confirm mode the returned confirm is awaited.
    async fn publish(&self, publishing: Publishing) -> Result<PublishConfirm>;

    /// Start consuming; deliveries arrive on the receiver until the channel
    /// or connection closes.
    async fn consume(&self, request: ConsumeRequest) -> Result<mpsc::Receiver<AmqpDelivery>>;

    async fn close(&self) -> Result<()>;
}

/// Native acknowledgment for one delivery.
#[async_trait]
pub trait AmqpAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub headers: HashMap<String, String>,
    pub content_type: String,
    pub persistent: bool,
    pub message_id: String,
    pub body: Vec<u8>,
}

/// Outcome of a publish on the native channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirm {
    /// The channel is not in confirm mode
    NotRequested,
    Ack,
    Nack,
}

#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub queue: String,
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub args: HashMap<String, String>,
}

pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub acker: Box<dyn AmqpAcker>,
}

impl std::fmt::Debug for AmqpDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}
