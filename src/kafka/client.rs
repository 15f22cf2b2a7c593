use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

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

use super::config::{InitialOffset, KafkaConfig};
use super::native::{KafkaNative, OffsetCommitter, PartitionClaim, ProducerRecord, Record, RecordMetadata};
use super::partitioner::Partitioner;

const TRANSPORT: &str = "kafka";

/// Kafka-style transport client.
pub struct KafkaClient {
    config: Arc<KafkaConfig>,
    native: Arc<dyn KafkaNative>,
    partitioner: Partitioner,
    lifecycle: Lifecycle,
    handler: HandlerSlot,
}

impl KafkaClient {
    pub fn new(config: KafkaConfig, native: Arc<dyn KafkaNative>) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            brokers = ?config.brokers,
            client_id = %config.client_id,
            mode = ?config.mode,
            group_id = %config.consumer.group_id,
            "Kafka client created"
        );

        Ok(Self {
            partitioner: Partitioner::new(config.producer.partitioner),
            config: Arc::new(config),
            native,
            lifecycle: Lifecycle::new(),
            handler: HandlerSlot::default(),
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        let acks = self.config.producer.required_acks;
        if self.config.producer.sync {
            return self.native.produce(record, acks).await;
        }

        self.native
            .produce_async(record, acks)
            .await
            .map_err(|_| MqError::transport("async producer dropped the delivery report"))?
    }
}

/// Consumer-group adapter for one session.
struct KafkaSubscription {
    native: Arc<dyn KafkaNative>,
    group_id: String,
    topics: Vec<String>,
    initial_offset: InitialOffset,
    redelivery_delay: Duration,
}

impl KafkaSubscription {
    fn wrap(&self, record: Record, ctx: &Context) -> Message {
        let mut msg = Message::new(record.value);
        msg.header = record.headers;
        msg.id = Some(format!("{}/{}/{}", record.topic, record.partition, record.offset));
        msg.topic = Some(record.topic);
        msg.timestamp = record.timestamp;
        msg.set_context(ctx.child());
        msg
    }

    /// Drain one claim: every record is resolved before its offset is
    /// committed and before the next record is handed out.
    async fn drain_claim(
        &self,
        mut claim: PartitionClaim,
        committer: &dyn OffsetCommitter,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<()> {
        loop {
            let record = tokio::select! {
                biased;
                _ = closing.cancelled() => return Ok(()),
                _ = ctx.cancelled() => return Ok(()),
                next = claim.records.recv() => match next {
                    Some(record) => record,
                    None => return Ok(()),
                },
            };
            let (partition, offset) = (record.partition, record.offset);
            let mut msg = self.wrap(record, ctx);

            loop {
                let pushed = tokio::select! {
                    biased;
                    _ = closing.cancelled() => false,
                    _ = ctx.cancelled() => false,
                    sent = out.send(msg.clone()) => sent.is_ok(),
                };
                if !pushed {
                    return Ok(());
                }

                let state = tokio::select! {
                    biased;
                    state = msg.resolved() => state,
                    _ = ctx.cancelled() => return Ok(()),
                };

                match state {
                    AckState::Acked => {
                        committer.mark_offset(&claim.topic, partition, offset + 1).await?;
                        ConsumeMetrics::record_acked(TRANSPORT);
                        break;
                    }
                    AckState::Nacked => {
                        ConsumeMetrics::record_nacked(TRANSPORT);
                        ConsumeMetrics::record_redelivered(TRANSPORT);
                        msg = msg.redelivery();
                        tracing::debug!(
                            topic = %claim.topic,
                            partition = partition,
                            offset = offset,
                            attempt = msg.attempt,
                            "Message nacked, redelivering"
                        );

                        tokio::select! {
                            biased;
                            _ = closing.cancelled() => return Ok(()),
                            _ = ctx.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(self.redelivery_delay) => {}
                        }
                    }
                    AckState::Unresolved => break,
                }
            }
        }
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn run_session(
        &self,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<()> {
        let session = self
            .native
            .join_group(&self.group_id, &self.topics, self.initial_offset)
            .await?;

        tracing::info!(
            group_id = %self.group_id,
            generation = session.generation,
            claims = session.claims.len(),
            "Consumer group session started"
        );

        let committer = session.committer;
        let drains = session
            .claims
            .into_iter()
            .map(|claim| self.drain_claim(claim, committer.as_ref(), ctx, closing, out));

        // The session is over once every claim has drained
        for result in futures::future::join_all(drains).await {
            result?;
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for KafkaClient {
    async fn consume(&self, ctx: &Context, opts: ConsumeOptions) -> Result<()> {
        self.lifecycle.ensure_open()?;
        if !self.config.mode.can_consume() {
            return Err(MqError::ModeDisabled("consume"));
        }
        let handler = self.handler.get()?;

        let topics = if opts.topics.is_empty() {
            self.config.consumer.topics.clone()
        } else {
            opts.topics.clone()
        };

        let subscription = KafkaSubscription {
            native: Arc::clone(&self.native),
            group_id: self.config.consumer.group_id.clone(),
            topics,
            initial_offset: self.config.consumer.initial_offset,
            redelivery_delay: Duration::from_millis(self.config.consumer.redelivery_delay_ms),
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
impl Publisher for KafkaClient {
    async fn publish(
        &self,
        ctx: &Context,
        topic: &str,
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
        let partitions = self.native.partition_count(topic).await?;
        let partition = self
            .partitioner
            .select(opts.key.as_deref(), opts.partition, partitions)?;

        let record = ProducerRecord {
            topic: topic.to_string(),
            partition,
            key: opts.key.clone(),
            headers: opts.merged_headers(&msg),
            value: msg.body,
        };

        let limit = opts
            .timeout
            .unwrap_or(Duration::from_millis(self.config.producer.timeout_ms));
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(MqError::Cancelled),
            report = self.send(record) => report,
            _ = tokio::time::sleep(limit) => Err(MqError::Timeout(limit)),
        };

        match result {
            Ok(meta) => {
                PublishMetrics::record_success(TRANSPORT, started.elapsed());
                let id = match meta.offset {
                    Some(offset) => format!("{}/{}/{}", meta.topic, meta.partition, offset),
                    None => format!("{}/{}", meta.topic, meta.partition),
                };
                tracing::debug!(id = %id, "Record produced");
                Ok(RespMessage {
                    id,
                    topic: meta.topic,
                    partition: Some(meta.partition),
                    offset: meta.offset,
                    timestamp: meta.timestamp,
                })
            }
            Err(e) => {
                if matches!(e, MqError::Timeout(_)) {
                    PublishMetrics::record_timeout(TRANSPORT);
                } else {
                    PublishMetrics::record_failure(TRANSPORT);
                }
                tracing::warn!(topic = %topic, error = %e, "Produce failed");
                Err(e)
            }
        }
    }
}

impl HandlerRegistrar for KafkaClient {
    fn register_handler(&self, handler: Handler) -> Result<()> {
        self.handler.set(handler);
        Ok(())
    }
}

#[async_trait]
impl Stopper for KafkaClient {
    async fn stop(&self) -> Result<()> {
        self.lifecycle.signal_close();
        self.native.close().await?;
        tracing::info!("Kafka client stopped");
        Ok(())
    }
}

#[async_trait]
impl GracefulStopper for KafkaClient {
    async fn graceful_stop(&self) -> Result<()> {
        self.lifecycle.close_gracefully().await;
        self.native.close().await?;
        tracing::info!("Kafka client stopped gracefully");
        Ok(())
    }
}

impl MessageQueer for KafkaClient {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}
