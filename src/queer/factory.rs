//! Client factory

use std::sync::Arc;

use crate::amqp::native::AmqpConnector;
use crate::amqp::{AmqpClient, MemoryAmqp};
use crate::config::{DriverKind, Settings, TransportKind};
use crate::error::Result;
use crate::kafka::{KafkaClient, MemoryKafka};
use crate::rocketmq::{MemoryRocketMq, RocketMqClient};

use super::MessageQueer;

/// Create a client for the configured transport.
///
/// The settings are validated first. Kafka-style and RocketMQ-style
/// transports always run on their in-process drivers. The AMQP transport
/// uses `lapin` when `driver = "lapin"` and the `lapin` feature is compiled
/// in, and falls back to the in-process broker otherwise.
///
/// # Example
///
/// ```rust,ignore
/// let settings = Settings::new()?;
/// let queer = create_message_queer(&settings)?;
/// queer.register_handler(handler_fn(|_ctx, msg| async move {
///     msg.ack();
///     Ok(())
/// }))?;
/// ```
pub fn create_message_queer(settings: &Settings) -> Result<Arc<dyn MessageQueer>> {
    settings.validate()?;

    match settings.transport {
        TransportKind::Kafka => {
            tracing::info!(
                transport = "kafka",
                driver = "memory",
                brokers = ?settings.kafka.brokers,
                "Creating Kafka-style client"
            );
            let broker = MemoryKafka::new();
            Ok(Arc::new(KafkaClient::new(
                settings.kafka.clone(),
                Arc::new(broker.client()),
            )?))
        }
        TransportKind::Amqp => {
            let connector = amqp_connector(settings.driver);
            Ok(Arc::new(AmqpClient::new(settings.amqp.clone(), connector)?))
        }
        TransportKind::Rocketmq => {
            tracing::info!(
                transport = "rocketmq",
                driver = "memory",
                group = %settings.rocketmq.group,
                "Creating RocketMQ-style client"
            );
            Ok(Arc::new(RocketMqClient::new(
                settings.rocketmq.clone(),
                Arc::new(MemoryRocketMq::new()),
            )?))
        }
    }
}

fn amqp_connector(driver: DriverKind) -> Arc<dyn AmqpConnector> {
    match driver {
        #[cfg(feature = "lapin")]
        DriverKind::Lapin => {
            tracing::info!(transport = "amqp", driver = "lapin", "Creating AMQP client");
            Arc::new(crate::amqp::LapinConnector::new())
        }
        #[cfg(not(feature = "lapin"))]
        DriverKind::Lapin => {
            tracing::warn!(
                "lapin driver requested but the `lapin` feature is disabled, falling back to memory"
            );
            Arc::new(MemoryAmqp::new())
        }
        DriverKind::Memory => {
            tracing::info!(transport = "amqp", driver = "memory", "Creating AMQP client");
            Arc::new(MemoryAmqp::new())
        }
    }
}
