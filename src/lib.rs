// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::backoff;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;

// Core abstractions
pub mod context;
pub mod message;
pub mod queer;
pub mod supervisor;

// Transports
pub mod amqp;
pub mod kafka;
pub mod rocketmq;

// Supporting modules
pub mod shutdown;

pub use context::Context;
pub use error::{MqError, Result};
pub use message::{Message, RespMessage};
pub use queer::{
    create_message_queer, handler_fn, ConsumeOptions, Handler, MessageQueer, PublishOptions,
    RunMode,
};
