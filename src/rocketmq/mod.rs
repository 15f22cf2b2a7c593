//! RocketMQ-style transport: a native push consumer calls back into the
//! handler; retries and dead-lettering are the broker's job.

mod client;
pub mod config;
pub mod memory;
pub mod native;

pub use client::RocketMqClient;
pub use config::{
    ConsumeFrom, RocketMqConfig, RocketMqConsumerConfig, RocketMqProducerConfig, Selector,
    SelectorKind,
};
pub use memory::MemoryRocketMq;
pub use native::{ConsumeResult, SendStatus};
