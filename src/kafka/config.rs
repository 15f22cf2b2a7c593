use serde::Deserialize;

use crate::error::{MqError, Result};
use crate::queer::RunMode;

/// Kafka-style transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap brokers (`host:port`)
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub mode: RunMode,
    /// Fixed delay before rejoining the group after a lost session
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default)]
    pub consumer: KafkaConsumerConfig,
    #[serde(default)]
    pub producer: KafkaProducerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Oldest,
    #[default]
    Newest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    /// Fire and forget; no offset is reported
    None,
    /// Leader only
    #[default]
    Local,
    /// All in-sync replicas
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionerKind {
    #[default]
    Hash,
    Random,
    RoundRobin,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConsumerConfig {
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Where to start when the group has no committed offset
    #[serde(default)]
    pub initial_offset: InitialOffset,
    /// Pause before a nacked message is handed to the handler again
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaProducerConfig {
    /// Wait for offset assignment inline instead of through the async queue
    #[serde(default = "default_true")]
    pub sync: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub required_acks: RequiredAcks,
    #[serde(default)]
    pub partitioner: PartitionerKind,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "ara-mq".to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    1_000
}

fn default_redelivery_delay_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            mode: RunMode::default(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            consumer: KafkaConsumerConfig::default(),
            producer: KafkaProducerConfig::default(),
        }
    }
}

impl Default for KafkaConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            topics: vec![],
            initial_offset: InitialOffset::default(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

impl Default for KafkaProducerConfig {
    fn default() -> Self {
        Self {
            sync: true,
            timeout_ms: default_timeout_ms(),
            required_acks: RequiredAcks::default(),
            partitioner: PartitionerKind::default(),
        }
    }
}

impl KafkaConfig {
    /// Reject configurations that cannot work for the declared run mode.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(MqError::invalid_config("kafka.brokers must not be empty"));
        }

        if self.mode.can_consume() {
            if self.consumer.group_id.trim().is_empty() {
                return Err(MqError::invalid_config(
                    "kafka.consumer.group_id is required when consuming",
                ));
            }
            if self.consumer.topics.iter().all(|t| t.trim().is_empty()) {
                return Err(MqError::invalid_config(
                    "kafka.consumer.topics is required when consuming",
                ));
            }
        }

        if self.mode.can_publish() && self.producer.timeout_ms == 0 {
            return Err(MqError::invalid_config(
                "kafka.producer.timeout_ms must be positive when publishing",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> KafkaConfig {
        KafkaConfig {
            consumer: KafkaConsumerConfig {
                group_id: "billing".to_string(),
                topics: vec!["invoices".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_consume_requires_group_and_topics() {
        let mut config = valid();
        config.consumer.group_id.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.consumer.topics.clear();
        assert!(config.validate().is_err());

        config.mode = RunMode::Publish;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_publish_requires_timeout() {
        let mut config = valid();
        config.producer.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(MqError::InvalidConfig(_))));

        config.mode = RunMode::Consume;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_brokers_required() {
        let config = KafkaConfig {
            brokers: vec![" ".to_string()],
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partitioner_names() {
        let kind: PartitionerKind = serde_json::from_str("\"round_robin\"").unwrap();
        assert_eq!(kind, PartitionerKind::RoundRobin);
    }
}
