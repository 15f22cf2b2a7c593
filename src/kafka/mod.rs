//! Kafka-style transport: consumer groups over partitioned logs, offsets
//! committed only after the handler acks.

mod client;
pub mod config;
pub mod memory;
pub mod native;
pub mod partitioner;

pub use client::KafkaClient;
pub use config::{
    InitialOffset, KafkaConfig, KafkaConsumerConfig, KafkaProducerConfig, PartitionerKind,
    RequiredAcks,
};
pub use memory::{CommitRecord, MemoryKafka, MemoryKafkaClient};
pub use partitioner::Partitioner;
