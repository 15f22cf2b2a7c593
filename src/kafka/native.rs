//! Driver seam for partitioned-log brokers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

use super::config::{InitialOffset, RequiredAcks};

/// A record fetched from one partition.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: i32,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    pub value: Vec<u8>,
}

/// Where a produced record landed. `offset` is `None` when acks were not
/// requested.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// One partition assigned to this member for the lifetime of a session.
#[derive(Debug)]
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    /// Closed by the driver when the session ends
    pub records: mpsc::Receiver<Record>,
}

/// Commits consumed offsets for the session's group.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Mark `next_offset` as the position to resume `topic/partition` from.
    async fn mark_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;
}

/// A consumer-group generation: claims plus the committer bound to it.
pub struct GroupSession {
    pub generation: u64,
    pub claims: Vec<PartitionClaim>,
    pub committer: Arc<dyn OffsetCommitter>,
}

#[async_trait]
pub trait KafkaNative: Send + Sync {
    /// Join `group_id` for `topics`; each claim streams from the committed
    /// offset, or from `initial` when none exists.
    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
        initial: InitialOffset,
    ) -> Result<GroupSession>;

    async fn partition_count(&self, topic: &str) -> Result<i32>;

    /// Produce and wait for the broker's answer.
    async fn produce(&self, record: ProducerRecord, acks: RequiredAcks) -> Result<RecordMetadata>;

    /// Enqueue on the async producer; the receiver yields the delivery report.
    fn produce_async(
        &self,
        record: ProducerRecord,
        acks: RequiredAcks,
    ) -> oneshot::Receiver<Result<RecordMetadata>>;

    async fn close(&self) -> Result<()>;
}
