use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::amqp::AmqpConfig;
use crate::error::{MqError, Result};
use crate::kafka::KafkaConfig;
use crate::queer::RunMode;
use crate::rocketmq::RocketMqConfig;

/// Which broker family the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Kafka,
    Amqp,
    Rocketmq,
}

/// Which native driver backs the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-process broker
    #[default]
    Memory,
    /// `lapin` (AMQP only, requires the `lapin` feature)
    Lapin,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub rocketmq: RocketMqConfig,
}

impl Settings {
    pub fn new() -> std::result::Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("transport", "kafka")?
            .set_default("driver", "memory")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // MQ__TRANSPORT, MQ__KAFKA__BROKERS, MQ__AMQP__CONSUMER__QUEUE, ...
            .add_source(
                Environment::with_prefix("MQ")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("kafka.consumer.topics")
                    .with_list_parse_key("amqp.addresses")
                    .with_list_parse_key("rocketmq.name_servers"),
            );

        builder.build()?.try_deserialize()
    }

    /// Run mode of the selected transport.
    pub fn run_mode(&self) -> RunMode {
        match self.transport {
            TransportKind::Kafka => self.kafka.mode,
            TransportKind::Amqp => self.amqp.mode,
            TransportKind::Rocketmq => self.rocketmq.mode,
        }
    }

    /// Check the block of the selected transport and the driver choice.
    pub fn validate(&self) -> Result<()> {
        if self.driver == DriverKind::Lapin && self.transport != TransportKind::Amqp {
            return Err(MqError::invalid_config(
                "driver \"lapin\" is only available for the amqp transport",
            ));
        }

        match self.transport {
            TransportKind::Kafka => self.kafka.validate(),
            TransportKind::Amqp => self.amqp.validate(),
            TransportKind::Rocketmq => self.rocketmq.validate(),
        }
    }
}
