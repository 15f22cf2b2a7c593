use serde::Deserialize;

use crate::error::{MqError, Result};
use crate::queer::RunMode;

/// RocketMQ-style push-consumer transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RocketMqConfig {
    /// Name server addresses (`host:port`)
    #[serde(default = "default_name_servers")]
    pub name_servers: Vec<String>,
    /// Consumer / producer group
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub consumer: RocketMqConsumerConfig,
    #[serde(default)]
    pub producer: RocketMqProducerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Tag,
    Sql92,
}

/// Server-side message filter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub kind: SelectorKind,
    /// `*`, `TagA || TagB`, or an SQL92 expression
    #[serde(default = "default_expression")]
    pub expression: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeFrom {
    #[default]
    LastOffset,
    FirstOffset,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RocketMqConsumerConfig {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub selector: Selector,
    /// Spawn the handler per message and report success immediately
    #[serde(default)]
    pub async_handler: bool,
    #[serde(default)]
    pub consume_from: ConsumeFrom,
    /// Retries before a message goes to the dead-letter topic
    #[serde(default = "default_max_reconsume_times")]
    pub max_reconsume_times: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RocketMqProducerConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Native retries on a failed send
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
}

fn default_name_servers() -> Vec<String> {
    vec!["127.0.0.1:9876".to_string()]
}

fn default_instance_name() -> String {
    "DEFAULT".to_string()
}

fn default_expression() -> String {
    "*".to_string()
}

fn default_max_reconsume_times() -> u32 {
    16
}

fn default_send_timeout_ms() -> u64 {
    3_000
}

fn default_retry_times() -> u32 {
    2
}

impl Default for RocketMqConfig {
    fn default() -> Self {
        Self {
            name_servers: default_name_servers(),
            group: String::new(),
            instance_name: default_instance_name(),
            mode: RunMode::default(),
            consumer: RocketMqConsumerConfig::default(),
            producer: RocketMqProducerConfig::default(),
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            kind: SelectorKind::Tag,
            expression: default_expression(),
        }
    }
}

impl Default for RocketMqConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            selector: Selector::default(),
            async_handler: false,
            consume_from: ConsumeFrom::default(),
            max_reconsume_times: default_max_reconsume_times(),
        }
    }
}

impl Default for RocketMqProducerConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            retry_times: default_retry_times(),
        }
    }
}

impl Selector {
    /// Whether a message tagged `tag` passes a tag selector. SQL92 selectors
    /// are evaluated by the broker and always pass here.
    pub fn matches_tag(&self, tag: Option<&str>) -> bool {
        if self.kind == SelectorKind::Sql92 {
            return true;
        }
        let expression = self.expression.trim();
        if expression.is_empty() || expression == "*" {
            return true;
        }
        match tag {
            Some(tag) => expression.split("||").any(|t| t.trim() == tag),
            None => false,
        }
    }
}

impl RocketMqConfig {
    /// Reject configurations that cannot work for the declared run mode.
    pub fn validate(&self) -> Result<()> {
        if self.name_servers.iter().all(|n| n.trim().is_empty()) {
            return Err(MqError::invalid_config(
                "rocketmq.name_servers must not be empty",
            ));
        }

        if self.group.trim().is_empty() {
            return Err(MqError::invalid_config("rocketmq.group is required"));
        }

        if self.mode.can_consume() && self.consumer.topic.trim().is_empty() {
            return Err(MqError::invalid_config(
                "rocketmq.consumer.topic is required when consuming",
            ));
        }

        if self.mode.can_publish() && self.producer.send_timeout_ms == 0 {
            return Err(MqError::invalid_config(
                "rocketmq.producer.send_timeout_ms must be positive when publishing",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RocketMqConfig {
        RocketMqConfig {
            group: "GID_orders".to_string(),
            consumer: RocketMqConsumerConfig {
                topic: "orders".to_string(),
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
    fn test_group_required() {
        let mut config = valid();
        config.group.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topic_required_only_for_consume() {
        let mut config = valid();
        config.consumer.topic.clear();
        assert!(config.validate().is_err());

        config.mode = RunMode::Publish;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tag_selector() {
        let selector = Selector {
            kind: SelectorKind::Tag,
            expression: "created || paid".to_string(),
        };
        assert!(selector.matches_tag(Some("paid")));
        assert!(!selector.matches_tag(Some("refunded")));
        assert!(!selector.matches_tag(None));
        assert!(Selector::default().matches_tag(None));
    }
}
