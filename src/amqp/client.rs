use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{MqError, Result};
use crate::infrastructure::backoff::BackoffConfig;
use crate::message::{AckState, Message, RespMessage};
use crate::metrics::{ConsumeMetrics, PublishMetrics};
use crate::queer::{
    consume_with, ConsumeOptions, Consumer, GracefulStopper, Handler, HandlerRegistrar,
    HandlerSlot, MessageQueer, PublishOptions, Publisher, Stopper,
};
use crate::shutdown::Lifecycle;
use crate::supervisor::Subscription;

use super::config::AmqpConfig;
use super::native::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpDelivery, ConsumeRequest, PublishConfirm,
    Publishing,
};
use super::pool::{ConnectionPool, Dialer, PoolStats};

const TRANSPORT: &str = "amqp";

/// Dials native connections round-robin over the configured addresses.
pub struct AmqpDialer {
    connector: Arc<dyn AmqpConnector>,
    addresses: Vec<String>,
    next: AtomicUsize,
}

impl AmqpDialer {
    pub fn new(connector: Arc<dyn AmqpConnector>, addresses: Vec<String>) -> Self {
        let addresses = addresses
            .into_iter()
            .filter(|a| !a.trim().is_empty())
            .collect();
        Self {
            connector,
            addresses,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    type Conn = Arc<dyn AmqpConnection>;

    async fn dial(&self) -> Result<Self::Conn> {
        let mut last_error = MqError::transport("no broker address configured");

        for _ in 0..self.addresses.len() {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
            let address = &self.addresses[index];
            match self.connector.connect(address).await {
                Ok(conn) => {
                    tracing::debug!(address = %redact(address), "AMQP connection established");
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(address = %redact(address), error = %e, "AMQP dial failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn close(&self, conn: Self::Conn) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Error closing AMQP connection");
        }
    }

    fn is_alive(&self, conn: &Self::Conn) -> bool {
        !conn.is_closed()
    }
}

/// Strip credentials from an AMQP URI before logging it.
fn redact(address: &str) -> String {
    match (address.find("://"), address.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &address[..scheme_end], &address[at + 1..])
        }
        _ => address.to_string(),
    }
}

/// AMQP-style transport client.
pub struct AmqpClient {
    config: Arc<AmqpConfig>,
    pool: Arc<ConnectionPool<AmqpDialer>>,
    lifecycle: Lifecycle,
    handler: HandlerSlot,
    exchange_checked: AtomicBool,
}

impl AmqpClient {
    /// Validate `config` and build a client over `connector`. No connection is
    /// opened until the first consume or publish.
    pub fn new(config: AmqpConfig, connector: Arc<dyn AmqpConnector>) -> Result<Self> {
        config.validate()?;

        let dialer = AmqpDialer::new(connector, config.addresses.clone());
        let pool = ConnectionPool::new(TRANSPORT, dialer, config.pool.clone());

        tracing::info!(
            addresses = config.addresses.len(),
            mode = ?config.mode,
            queue = %config.consumer.queue,
            exchange = %config.exchange.name,
            "AMQP client created"
        );

        Ok(Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            lifecycle: Lifecycle::new(),
            handler: HandlerSlot::default(),
            exchange_checked: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    async fn publish_on(
        &self,
        conn: &Arc<dyn AmqpConnection>,
        target: &str,
        msg: &Message,
        opts: &PublishOptions,
    ) -> Result<RespMessage> {
        let channel = conn.open_channel().await?;
        let result = self.publish_on_channel(channel.as_ref(), target, msg, opts).await;
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "Error closing publish channel");
        }
        result
    }

    async fn publish_on_channel(
        &self,
        channel: &dyn AmqpChannel,
        target: &str,
        msg: &Message,
        opts: &PublishOptions,
    ) -> Result<RespMessage> {
        let exchange = &self.config.exchange;
        let producer = &self.config.producer;

        if exchange.declare
            && !exchange.name.is_empty()
            && !self.exchange_checked.load(Ordering::Acquire)
        {
            channel.exchange_declare(exchange).await?;
            self.exchange_checked.store(true, Ordering::Release);
            tracing::info!(exchange = %exchange.name, kind = exchange.kind.as_str(), "Exchange declared");
        }

        if producer.confirm {
            channel.confirm_select().await?;
        }

        let routing_key = match &opts.routing_key {
            Some(key) => key.clone(),
            None if !target.is_empty() => target.to_string(),
            None => producer.routing_key.clone(),
        };
        let id = msg.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let publishing = Publishing {
            exchange: exchange.name.clone(),
            routing_key: routing_key.clone(),
            mandatory: producer.mandatory,
            immediate: producer.immediate,
            headers: opts.merged_headers(msg),
            content_type: msg
                .header
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| producer.content_type.clone()),
            persistent: producer.persistent,
            message_id: id.clone(),
            body: msg.body.clone(),
        };

        let confirm = if producer.confirm {
            let limit = opts
                .timeout
                .unwrap_or(Duration::from_millis(producer.confirm_timeout_ms));
            timeout(limit, channel.publish(publishing))
                .await
                .map_err(|_| MqError::Timeout(limit))??
        } else {
            channel.publish(publishing).await?
        };

        if confirm == PublishConfirm::Nack {
            return Err(MqError::ConfirmNacked);
        }

        let topic = if exchange.name.is_empty() {
            routing_key
        } else {
            exchange.name.clone()
        };
        Ok(RespMessage {
            id,
            topic,
            partition: None,
            offset: None,
            timestamp: Utc::now(),
        })
    }
}

/// One consume session: a pooled connection with a consuming channel.
struct AmqpSubscription {
    config: Arc<AmqpConfig>,
    pool: Arc<ConnectionPool<AmqpDialer>>,
}

impl AmqpSubscription {
    async fn declare_topology(&self, channel: &dyn AmqpChannel) -> Result<()> {
        let exchange = &self.config.exchange;
        let consumer = &self.config.consumer;

        if exchange.declare && !exchange.name.is_empty() {
            channel.exchange_declare(exchange).await?;
        }
        if consumer.declare_queue {
            channel
                .queue_declare(&consumer.queue, consumer.durable, consumer.exclusive)
                .await?;
        }
        for key in &consumer.binding_keys {
            channel.queue_bind(&consumer.queue, &exchange.name, key).await?;
        }
        Ok(())
    }

    async fn consume_on(
        &self,
        conn: &Arc<dyn AmqpConnection>,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let channel = conn.open_channel().await?;
        let result = self
            .consume_channel(conn, channel.as_ref(), ctx, closing, out)
            .await;
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "Error closing consume channel");
        }
        result
    }

    async fn consume_channel(
        &self,
        conn: &Arc<dyn AmqpConnection>,
        channel: &dyn AmqpChannel,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let consumer = &self.config.consumer;

        if consumer.prefetch_count > 0 {
            channel.qos(consumer.prefetch_count).await?;
        }
        self.declare_topology(channel).await?;

        let mut deliveries = channel
            .consume(ConsumeRequest {
                queue: consumer.queue.clone(),
                consumer_tag: consumer.consumer_tag.clone(),
                auto_ack: consumer.auto_ack,
                exclusive: consumer.exclusive,
                no_local: consumer.no_local,
                no_wait: consumer.no_wait,
                args: consumer.args.clone(),
            })
            .await?;

        tracing::info!(queue = %consumer.queue, "AMQP consumer subscribed");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = closing.cancelled() => return Ok(()),
                _ = ctx.cancelled() => return Ok(()),
                _ = conn.closed() => {
                    return Err(MqError::transport("connection closed by broker"));
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => delivery,
                    None => return Err(MqError::transport("delivery stream closed")),
                },
            };

            if !self.deliver(delivery, ctx, closing, out).await? {
                return Ok(());
            }
        }
    }

    /// Hand one delivery to the handler and settle it natively. Returns
    /// `false` when the session should end without settling.
    async fn deliver(
        &self,
        delivery: AmqpDelivery,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<bool> {
        let consumer = &self.config.consumer;

        let mut msg = Message::new(delivery.body.clone());
        msg.header = delivery.headers.clone();
        msg.id = Some(
            delivery
                .message_id
                .clone()
                .unwrap_or_else(|| format!("{}/{}", consumer.queue, delivery.delivery_tag)),
        );
        msg.topic = Some(consumer.queue.clone());
        msg.redelivered = delivery.redelivered;
        msg.set_context(ctx.child());
        if delivery.redelivered {
            msg.attempt = 2;
            ConsumeMetrics::record_redelivered(TRANSPORT);
        }

        let pushed = tokio::select! {
            biased;
            _ = closing.cancelled() => false,
            _ = ctx.cancelled() => false,
            sent = out.send(msg.clone()) => sent.is_ok(),
        };
        if !pushed {
            // Left unacked; the broker requeues it once the connection closes
            return Ok(false);
        }

        let state = tokio::select! {
            biased;
            state = msg.resolved() => state,
            _ = ctx.cancelled() => return Ok(false),
        };

        match state {
            AckState::Acked => {
                if !consumer.auto_ack {
                    delivery.acker.ack().await?;
                }
                ConsumeMetrics::record_acked(TRANSPORT);
            }
            AckState::Nacked => {
                if !consumer.auto_ack {
                    delivery.acker.nack(consumer.requeue_on_reject).await?;
                }
                ConsumeMetrics::record_nacked(TRANSPORT);
                tracing::debug!(
                    delivery_tag = delivery.delivery_tag,
                    requeue = consumer.requeue_on_reject,
                    "Delivery rejected"
                );
            }
            AckState::Unresolved => {}
        }
        Ok(true)
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn run_session(
        &self,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        let result = self.consume_on(&conn, ctx, closing, out).await;
        // A connection that carried a consumer is never reused
        self.pool.put(conn, true).await;
        result
    }
}

#[async_trait]
impl Consumer for AmqpClient {
    async fn consume(&self, ctx: &Context, opts: ConsumeOptions) -> Result<()> {
        self.lifecycle.ensure_open()?;
        if !self.config.mode.can_consume() {
            return Err(MqError::ModeDisabled("consume"));
        }
        let handler = self.handler.get()?;

        let subscription = AmqpSubscription {
            config: Arc::clone(&self.config),
            pool: Arc::clone(&self.pool),
        };
        consume_with(
            TRANSPORT,
            subscription,
            BackoffConfig::fixed(self.config.reconnect_backoff_ms),
            ctx,
            &self.lifecycle,
            handler,
            opts.auto_ack_on_success,
        )
        .await
    }
}

#[async_trait]
impl Publisher for AmqpClient {
    async fn publish(
        &self,
        ctx: &Context,
        target: &str,
        msg: Message,
        opts: PublishOptions,
    ) -> Result<RespMessage> {
        self.lifecycle.ensure_open()?;
        if !self.config.mode.can_publish() {
            return Err(MqError::ModeDisabled("publish"));
        }
        if ctx.is_cancelled() {
            return Err(MqError::Cancelled);
        }

        let started = Instant::now();
        let conn = self.pool.get().await?;
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(MqError::Cancelled),
            result = self.publish_on(&conn, target, &msg, &opts) => result,
        };
        self.pool.put(conn, result.is_err()).await;

        match &result {
            Ok(resp) => {
                PublishMetrics::record_success(TRANSPORT, started.elapsed());
                tracing::debug!(id = %resp.id, topic = %resp.topic, "Message published");
            }
            Err(MqError::Timeout(limit)) => {
                PublishMetrics::record_timeout(TRANSPORT);
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Publish confirm timed out");
            }
            Err(e) => {
                PublishMetrics::record_failure(TRANSPORT);
                tracing::warn!(error = %e, "Publish failed");
            }
        }
        result
    }
}

impl HandlerRegistrar for AmqpClient {
    fn register_handler(&self, handler: Handler) -> Result<()> {
        self.handler.set(handler);
        Ok(())
    }
}

#[async_trait]
impl Stopper for AmqpClient {
    async fn stop(&self) -> Result<()> {
        self.lifecycle.signal_close();
        self.pool.close().await;
        tracing::info!("AMQP client stopped");
        Ok(())
    }
}

#[async_trait]
impl GracefulStopper for AmqpClient {
    async fn graceful_stop(&self) -> Result<()> {
        self.lifecycle.close_gracefully().await;
        self.pool.close().await;
        tracing::info!("AMQP client stopped gracefully");
        Ok(())
    }
}

impl MessageQueer for AmqpClient {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}
