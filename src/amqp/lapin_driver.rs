//! `lapin` implementation of the AMQP driver traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::Result;

use super::config::{ExchangeConfig, ExchangeKind};
use super::native::{
    AmqpAcker, AmqpChannel, AmqpConnection, AmqpConnector, AmqpDelivery, ConsumeRequest,
    PublishConfirm, Publishing,
};

/// How often `closed()` re-checks the connection status between error callbacks.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn AmqpConnection>> {
        let conn = Connection::connect(address, ConnectionProperties::default()).await?;

        let lost = Context::background();
        let signal = lost.clone();
        conn.on_error(move |err| {
            tracing::warn!(error = %err, "AMQP connection error");
            signal.cancel();
        });

        Ok(Arc::new(LapinConnection { conn, lost }))
    }
}

struct LapinConnection {
    conn: Connection,
    lost: Context,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        let channel = self.conn.create_channel().await?;
        Ok(Box::new(LapinChannel { channel }))
    }

    fn is_closed(&self) -> bool {
        self.lost.is_cancelled() || !self.conn.status().connected()
    }

    async fn closed(&self) {
        while !self.is_closed() {
            tokio::select! {
                _ = self.lost.cancelled() => return,
                _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.lost.cancel();
        if self.conn.status().connected() {
            self.conn.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: lapin::Channel,
}

fn field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn string_table(table: &FieldTable) -> HashMap<String, String> {
    table
        .inner()
        .iter()
        .map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                other => format!("{other:?}"),
            };
            (key.as_str().to_string(), value)
        })
        .collect()
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    nowait: exchange.no_wait,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, durable: bool, exclusive: bool) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> Result<PublishConfirm> {
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(publishing.message_id))
            .with_content_type(ShortString::from(publishing.content_type))
            .with_headers(field_table(&publishing.headers));
        if publishing.persistent {
            properties = properties.with_delivery_mode(2);
        }

        let confirmation = self
            .channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions {
                    mandatory: publishing.mandatory,
                    immediate: publishing.immediate,
                },
                &publishing.body,
                properties,
            )
            .await?
            .await?;

        Ok(match confirmation {
            Confirmation::Ack(_) => PublishConfirm::Ack,
            Confirmation::Nack(_) => PublishConfirm::Nack,
            Confirmation::NotRequested => PublishConfirm::NotRequested,
        })
    }

    async fn consume(&self, request: ConsumeRequest) -> Result<mpsc::Receiver<AmqpDelivery>> {
        let mut args = FieldTable::default();
        for (key, value) in &request.args {
            args.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let mut consumer = self
            .channel
            .basic_consume(
                &request.queue,
                &request.consumer_tag,
                BasicConsumeOptions {
                    no_local: request.no_local,
                    no_ack: request.auto_ack,
                    exclusive: request.exclusive,
                    nowait: request.no_wait,
                },
                args,
            )
            .await?;

        let (tx, rx) = mpsc::channel(1);
        let queue = request.queue;
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if tx.send(convert_delivery(delivery)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "AMQP consumer stream failed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await?;
        }
        Ok(())
    }
}

fn convert_delivery(delivery: Delivery) -> AmqpDelivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(string_table)
        .unwrap_or_default();
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    AmqpDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        message_id,
        headers,
        body: delivery.data,
        acker: Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl AmqpAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}
