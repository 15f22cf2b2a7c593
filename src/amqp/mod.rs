//! AMQP-style transport: pooled connections, one channel per consume session
//! or publish, native ack / nack per delivery.

mod client;
pub mod config;
#[cfg(feature = "lapin")]
pub mod lapin_driver;
pub mod memory;
pub mod native;
pub mod pool;

pub use client::{AmqpClient, AmqpDialer};
#[cfg(feature = "lapin")]
pub use lapin_driver::LapinConnector;
pub use config::{AmqpConfig, AmqpConsumerConfig, AmqpProducerConfig, ExchangeConfig, ExchangeKind};
pub use memory::MemoryAmqp;
pub use pool::{ConnectionPool, Dialer, PoolConfig, PoolError, PoolStats, PooledConnection};
