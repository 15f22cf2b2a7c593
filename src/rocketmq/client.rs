use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::OnceCell;

use crate::context::Context;
use crate::error::{MqError, Result};
use crate::message::{Message, RespMessage};
use crate::metrics::{ConsumeMetrics, PublishMetrics};
use crate::queer::{
    ConsumeOptions, Consumer, GracefulStopper, Handler, HandlerRegistrar, HandlerSlot,
    MessageQueer, PublishOptions, Publisher, Stopper,
};
use crate::shutdown::{InFlight, Lifecycle};

use super::config::RocketMqConfig;
use super::native::{
    ConsumeResult, MessageExt, OutgoingMessage, Producer, ProducerOptions, PushConsumerOptions,
    PushListener, RocketMqNative, SendStatus,
};

const TRANSPORT: &str = "rocketmq";

/// RocketMQ-style push-consumer transport client.
pub struct RocketMqClient {
    config: Arc<RocketMqConfig>,
    native: Arc<dyn RocketMqNative>,
    producer: Option<Box<dyn Producer>>,
    producer_started: OnceCell<()>,
    lifecycle: Lifecycle,
    handler: HandlerSlot,
}

impl RocketMqClient {
    pub fn new(config: RocketMqConfig, native: Arc<dyn RocketMqNative>) -> Result<Self> {
        config.validate()?;

        let producer = if config.mode.can_publish() {
            Some(native.producer(ProducerOptions {
                group: config.group.clone(),
                instance_name: config.instance_name.clone(),
                retry_times: config.producer.retry_times,
            })?)
        } else {
            None
        };

        tracing::info!(
            name_servers = ?config.name_servers,
            group = %config.group,
            mode = ?config.mode,
            topic = %config.consumer.topic,
            "RocketMQ client created"
        );

        Ok(Self {
            config: Arc::new(config),
            native,
            producer,
            producer_started: OnceCell::new(),
            lifecycle: Lifecycle::new(),
            handler: HandlerSlot::default(),
        })
    }

    pub fn config(&self) -> &RocketMqConfig {
        &self.config
    }

    /// The producer, started on first use.
    async fn started_producer(&self) -> Result<&dyn Producer> {
        let Some(producer) = self.producer.as_deref() else {
            return Err(MqError::ModeDisabled("publish"));
        };
        self.producer_started
            .get_or_try_init(|| async {
                producer.start().await?;
                tracing::info!(group = %self.config.group, "RocketMQ producer started");
                Ok::<(), MqError>(())
            })
            .await?;
        Ok(producer)
    }

    async fn shutdown_producer(&self) -> Result<()> {
        if let (Some(producer), Some(())) = (&self.producer, self.producer_started.get()) {
            producer.shutdown().await?;
        }
        Ok(())
    }
}

/// Shared state behind the push listener.
struct ListenerState {
    handler: Handler,
    in_flight: Arc<InFlight>,
    closing: Context,
    ctx: Context,
    async_handler: bool,
}

impl ListenerState {
    fn wrap(&self, ext: MessageExt) -> Message {
        let mut msg = Message::new(ext.body);
        msg.header = ext.properties;
        if let Some(tags) = ext.tags {
            msg.header.insert("tags".to_string(), tags);
        }
        if !ext.keys.is_empty() {
            msg.header.insert("keys".to_string(), ext.keys.join(" "));
        }
        msg.id = Some(ext.msg_id);
        msg.topic = Some(ext.topic);
        msg.redelivered = ext.reconsume_times > 0;
        msg.attempt = ext.reconsume_times.saturating_add(1);
        msg.timestamp = ext.born_timestamp;
        msg.set_context(self.ctx.child());
        msg
    }

    async fn on_messages(self: Arc<Self>, batch: Vec<MessageExt>) -> ConsumeResult {
        if self.closing.is_cancelled() || self.ctx.is_cancelled() {
            return ConsumeResult::ReconsumeLater;
        }

        let mut result = ConsumeResult::ConsumeSuccess;
        for ext in batch {
            let msg = self.wrap(ext);
            ConsumeMetrics::record_delivered(TRANSPORT);
            if msg.redelivered {
                ConsumeMetrics::record_redelivered(TRANSPORT);
            }

            if self.async_handler {
                let guard = self.in_flight.enter();
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = invoke_guarded(&handler, &msg).await {
                        tracing::error!(id = ?msg.id, error = %e, "Async handler failed");
                    }
                });
                continue;
            }

            let outcome = {
                let _guard = self.in_flight.enter();
                invoke_guarded(&self.handler, &msg).await
            };

            match outcome {
                Ok(()) if !msg.is_nacked() => {
                    msg.ack();
                    ConsumeMetrics::record_acked(TRANSPORT);
                }
                Ok(()) => {
                    ConsumeMetrics::record_nacked(TRANSPORT);
                    result = ConsumeResult::ReconsumeLater;
                }
                Err(e) => {
                    msg.nack();
                    ConsumeMetrics::record_nacked(TRANSPORT);
                    tracing::warn!(id = ?msg.id, attempt = msg.attempt, error = %e, "Handler failed, message will be reconsumed");
                    result = ConsumeResult::ReconsumeLater;
                }
            }
        }
        result
    }
}

/// Run the handler behind a panic boundary; a panic becomes an error.
async fn invoke_guarded(handler: &Handler, msg: &Message) -> anyhow::Result<()> {
    match AssertUnwindSafe(handler(msg.context().clone(), msg.clone()))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            ConsumeMetrics::record_handler_error(TRANSPORT);
            Err(e)
        }
        Err(panic) => {
            ConsumeMetrics::record_handler_panic(TRANSPORT);
            Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl Consumer for RocketMqClient {
    async fn consume(&self, ctx: &Context, _opts: ConsumeOptions) -> Result<()> {
        self.lifecycle.ensure_open()?;
        if !self.config.mode.can_consume() {
            return Err(MqError::ModeDisabled("consume"));
        }
        let handler = self.handler.get()?;
        let _consumer_guard = self.lifecycle.consumers().enter();

        let consumer = self.native.push_consumer(PushConsumerOptions {
            group: self.config.group.clone(),
            instance_name: self.config.instance_name.clone(),
            consume_from: self.config.consumer.consume_from,
            max_reconsume_times: self.config.consumer.max_reconsume_times,
        })?;

        let state = Arc::new(ListenerState {
            handler,
            in_flight: Arc::clone(self.lifecycle.in_flight()),
            closing: self.lifecycle.closing().clone(),
            ctx: ctx.clone(),
            async_handler: self.config.consumer.async_handler,
        });
        let listener: PushListener =
            Arc::new(move |batch| Arc::clone(&state).on_messages(batch).boxed());

        let topic = &self.config.consumer.topic;
        consumer
            .subscribe(topic, &self.config.consumer.selector, listener)
            .await?;
        consumer.start().await?;
        tracing::info!(
            group = %self.config.group,
            topic = %topic,
            selector = %self.config.consumer.selector.expression,
            async_handler = self.config.consumer.async_handler,
            "Push consumer started"
        );

        tokio::select! {
            _ = self.lifecycle.closing().cancelled() => {}
            _ = ctx.cancelled() => {}
        }

        consumer.shutdown().await?;
        tracing::info!(group = %self.config.group, "Push consumer shut down");
        Ok(())
    }
}

#[async_trait]
impl Publisher for RocketMqClient {
    async fn publish(
        &self,
        ctx: &Context,
        topic: &str,
        msg: Message,
        opts: PublishOptions,
    ) -> Result<RespMessage> {
        self.lifecycle.ensure_open()?;
        if ctx.is_cancelled() {
            return Err(MqError::Cancelled);
        }
        let producer = self.started_producer().await?;

        let started = Instant::now();
        let limit = opts
            .timeout
            .unwrap_or(Duration::from_millis(self.config.producer.send_timeout_ms));
        let outgoing = OutgoingMessage {
            topic: topic.to_string(),
            tags: opts.tags.clone(),
            keys: opts.keys.clone(),
            delay_level: opts.delay_level,
            properties: opts.merged_headers(&msg),
            body: msg.body,
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(MqError::Cancelled),
            sent = producer.send_sync(outgoing, limit) => sent,
            _ = tokio::time::sleep(limit) => Err(MqError::Timeout(limit)),
        };

        let sent = match result {
            Ok(sent) if sent.status == SendStatus::SendOk => sent,
            Ok(sent) => {
                PublishMetrics::record_failure(TRANSPORT);
                tracing::warn!(topic = %topic, msg_id = %sent.msg_id, status = ?sent.status, "Send did not complete");
                return Err(MqError::SendStatus(sent.status));
            }
            Err(e) => {
                if matches!(e, MqError::Timeout(_)) {
                    PublishMetrics::record_timeout(TRANSPORT);
                } else {
                    PublishMetrics::record_failure(TRANSPORT);
                }
                tracing::warn!(topic = %topic, error = %e, "Send failed");
                return Err(e);
            }
        };

        PublishMetrics::record_success(TRANSPORT, started.elapsed());
        Ok(RespMessage {
            id: sent.msg_id,
            topic: topic.to_string(),
            partition: Some(sent.queue_id),
            offset: Some(sent.queue_offset),
            timestamp: chrono::Utc::now(),
        })
    }
}

impl HandlerRegistrar for RocketMqClient {
    fn register_handler(&self, handler: Handler) -> Result<()> {
        self.handler.set(handler);
        Ok(())
    }
}

#[async_trait]
impl Stopper for RocketMqClient {
    async fn stop(&self) -> Result<()> {
        // Push deliveries already handed to the listener cannot be pulled back,
        // so stop drains them like a graceful stop does.
        self.lifecycle.close_gracefully().await;
        self.shutdown_producer().await?;
        tracing::info!("RocketMQ client stopped");
        Ok(())
    }
}

#[async_trait]
impl GracefulStopper for RocketMqClient {
    async fn graceful_stop(&self) -> Result<()> {
        self.lifecycle.close_gracefully().await;
        self.shutdown_producer().await?;
        tracing::info!("RocketMQ client stopped gracefully");
        Ok(())
    }
}

impl MessageQueer for RocketMqClient {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}
