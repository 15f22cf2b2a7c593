use std::time::Duration;

use thiserror::Error;

use crate::amqp::pool::PoolError;
use crate::rocketmq::SendStatus;

#[derive(Error, Debug)]
pub enum MqError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Publish rejected: {0}")]
    Publish(String),

    #[error("Publish was negatively confirmed by the broker")]
    ConfirmNacked,

    #[error("Send finished with status {0:?}")]
    SendStatus(SendStatus),

    #[error("Handler error: {0}")]
    Handler(anyhow::Error),

    #[error("No handler registered")]
    HandlerNotRegistered,

    #[error("{0} is not enabled for this client")]
    ModeDisabled(&'static str),

    #[error("Client is closed")]
    Closed,

    #[error("Context cancelled")]
    Cancelled,

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[cfg(feature = "lapin")]
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),
}

impl MqError {
    /// Whether the reconnect supervisor should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            MqError::Transport(_) | MqError::Timeout(_) => true,
            MqError::Pool(e) => !matches!(e, PoolError::Closed),
            #[cfg(feature = "lapin")]
            MqError::Lapin(_) => true,
            _ => false,
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        MqError::Transport(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        MqError::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MqError::transport("connection reset").is_retryable());
        assert!(MqError::Timeout(Duration::from_millis(10)).is_retryable());
        assert!(MqError::Pool(PoolError::Exhausted).is_retryable());
        assert!(!MqError::Pool(PoolError::Closed).is_retryable());
        assert!(!MqError::HandlerNotRegistered.is_retryable());
        assert!(!MqError::invalid_config("brokers").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = MqError::ModeDisabled("publish");
        assert_eq!(err.to_string(), "publish is not enabled for this client");

        let err = MqError::Handler(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "Handler error: boom");
    }
}
