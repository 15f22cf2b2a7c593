//! The in-flight message envelope shared by every transport.
//!
//! A [`Message`] carries a header map and a raw body across the abstraction
//! boundary, plus the ack/nack decision the handler makes about it. Clones are
//! handles onto the same delivery: resolving one resolves all of them. Use
//! [`Message::copy`] to get a new, unresolved identity for a redelivery.

mod ack;

pub use ack::AckState;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::context::Context;

use ack::AckCell;

/// A message delivered to, or published by, a transport client.
#[derive(Debug, Clone)]
pub struct Message {
    /// Application headers
    pub header: HashMap<String, String>,
    /// Raw payload
    pub body: Vec<u8>,
    /// Transport-assigned id (message id, or `topic/partition/offset`)
    pub id: Option<String>,
    /// Topic or queue the message was delivered from
    pub topic: Option<String>,
    /// Whether the broker or adapter has delivered this payload before
    pub redelivered: bool,
    /// Delivery attempt, starting at 1 for a fresh delivery
    pub attempt: u32,
    /// When the message was created or received
    pub timestamp: DateTime<Utc>,
    ctx: Context,
    ack: Arc<AckCell>,
}

impl Message {
    /// Create a message with the given body and no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
            id: None,
            topic: None,
            redelivered: false,
            attempt: 1,
            timestamp: Utc::now(),
            ctx: Context::background(),
            ack: Arc::new(AckCell::new()),
        }
    }

    /// Create a message whose body is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let mut message = Self::new(serde_json::to_vec(value)?);
        message
            .header
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(message)
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Mark the message as successfully processed.
    ///
    /// Returns `false` only when the message was already nacked.
    pub fn ack(&self) -> bool {
        self.ack.resolve(AckState::Acked)
    }

    /// Mark the message as not processed, asking for redelivery.
    ///
    /// Returns `false` only when the message was already acked.
    pub fn nack(&self) -> bool {
        self.ack.resolve(AckState::Nacked)
    }

    pub fn state(&self) -> AckState {
        self.ack.state()
    }

    pub fn is_acked(&self) -> bool {
        self.state() == AckState::Acked
    }

    pub fn is_nacked(&self) -> bool {
        self.state() == AckState::Nacked
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    /// Completes once the message is acked. Never completes if it is nacked.
    pub async fn acked(&self) {
        self.ack.wait_for(|s| s == AckState::Acked).await;
    }

    /// Completes once the message is nacked. Never completes if it is acked.
    pub async fn nacked(&self) {
        self.ack.wait_for(|s| s == AckState::Nacked).await;
    }

    /// Completes on either terminal state and returns it.
    pub async fn resolved(&self) -> AckState {
        self.ack.wait_for(AckState::is_terminal).await
    }

    /// Same payload and headers under a fresh, unresolved identity.
    pub fn copy(&self) -> Self {
        Self {
            header: self.header.clone(),
            body: self.body.clone(),
            id: self.id.clone(),
            topic: self.topic.clone(),
            redelivered: self.redelivered,
            attempt: self.attempt,
            timestamp: self.timestamp,
            ctx: self.ctx.clone(),
            ack: Arc::new(AckCell::new()),
        }
    }

    /// `copy()` marked as the next delivery attempt.
    pub(crate) fn redelivery(&self) -> Self {
        let mut next = self.copy();
        next.redelivered = true;
        next.attempt = self.attempt.saturating_add(1);
        next
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn set_context(&mut self, ctx: Context) {
        self.ctx = ctx;
    }

    /// Whether two handles refer to the same in-flight delivery.
    pub fn same_delivery(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.ack, &other.ack)
    }
}

/// Publish acknowledgment returned by [`Publisher::publish`](crate::queer::Publisher::publish).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespMessage {
    /// Transport-assigned id
    pub id: String,
    /// Topic, exchange or queue the message was published to
    pub topic: String,
    /// Partition or queue id, where the transport has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    /// Offset within the partition, where the transport has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub timestamp: DateTime<Utc>,
}
