//! In-process partitioned log with consumer-group offsets.
//!
//! Every group member gets every partition (no balancing). A session lasts
//! until its client closes or [`MemoryKafka::disconnect`] simulates a broker
//! failure; both close the session's claims. Offsets committed through a dead
//! session are rejected, so uncommitted records are fetched again by the next
//! session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::context::Context;
use crate::error::{MqError, Result};

use super::config::{InitialOffset, RequiredAcks};
use super::native::{
    GroupSession, KafkaNative, OffsetCommitter, PartitionClaim, ProducerRecord, Record,
    RecordMetadata,
};

/// One offset commit, as observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<Record>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct KafkaState {
    topics: HashMap<String, Vec<PartitionLog>>,
    committed: HashMap<(String, String, i32), i64>,
    commits: Vec<CommitRecord>,
    sessions: Vec<Context>,
    generation: u64,
}

struct KafkaInner {
    state: Mutex<KafkaState>,
    default_partitions: i32,
    ack_delay_ms: AtomicU64,
}

impl KafkaInner {
    fn lock(&self) -> MutexGuard<'_, KafkaState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl KafkaState {
    fn topic(&mut self, topic: &str, partitions: i32) -> &mut Vec<PartitionLog> {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions.max(1)).map(|_| PartitionLog::default()).collect()
        })
    }
}

/// In-process broker; clones share state.
#[derive(Clone)]
pub struct MemoryKafka {
    inner: Arc<KafkaInner>,
}

impl Default for MemoryKafka {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKafka {
    /// Broker whose auto-created topics have one partition.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            inner: Arc::new(KafkaInner {
                state: Mutex::new(KafkaState::default()),
                default_partitions: partitions.max(1),
                ack_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// A native client handle; closing it ends only its own sessions.
    pub fn client(&self) -> MemoryKafkaClient {
        MemoryKafkaClient {
            broker: Arc::clone(&self.inner),
            closed: Context::background(),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.inner.lock().topic(topic, partitions);
    }

    /// Append a record directly, bypassing any producer. Returns its offset.
    pub fn append(&self, topic: &str, partition: i32, value: impl Into<Vec<u8>>) -> Result<i64> {
        append(
            &self.inner,
            ProducerRecord {
                topic: topic.to_string(),
                partition,
                key: None,
                headers: HashMap::new(),
                value: value.into(),
            },
        )
    }

    /// Simulate a broker failure: every live session ends.
    pub fn disconnect(&self) {
        let sessions = std::mem::take(&mut self.inner.lock().sessions);
        for session in sessions {
            session.cancel();
        }
    }

    /// Delay produce acknowledgments.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.inner
            .ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Group sessions started so far.
    pub fn generations(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Commits made by `group`, in commit order.
    pub fn commits(&self, group: &str) -> Vec<CommitRecord> {
        self.inner
            .lock()
            .commits
            .iter()
            .filter(|c| c.group == group)
            .cloned()
            .collect()
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Record values stored in `topic/partition`.
    pub fn values(&self, topic: &str, partition: i32) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.records.iter().map(|r| r.value.clone()).collect())
            .unwrap_or_default()
    }
}

fn append(broker: &KafkaInner, record: ProducerRecord) -> Result<i64> {
    let mut state = broker.lock();
    let partitions = state.topic(&record.topic, broker.default_partitions);
    let Some(log) = partitions.get_mut(record.partition as usize) else {
        return Err(MqError::Publish(format!(
            "unknown partition {}/{}",
            record.topic, record.partition
        )));
    };

    let offset = log.records.len() as i64;
    log.records.push(Record {
        topic: record.topic,
        partition: record.partition,
        offset,
        key: record.key,
        headers: record.headers,
        value: record.value,
        timestamp: Utc::now(),
    });
    log.notify.notify_waiters();
    Ok(offset)
}

/// Native client handle onto a [`MemoryKafka`] broker.
#[derive(Clone)]
pub struct MemoryKafkaClient {
    broker: Arc<KafkaInner>,
    closed: Context,
}

impl MemoryKafkaClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(MqError::transport("client closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KafkaNative for MemoryKafkaClient {
    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
        initial: InitialOffset,
    ) -> Result<GroupSession> {
        self.ensure_open()?;

        let session = self.closed.child();
        let mut claims = Vec::new();
        let generation = {
            let mut state = self.broker.lock();
            state.generation += 1;
            state.sessions.retain(|s| !s.is_cancelled());
            state.sessions.push(session.clone());

            for topic in topics {
                let partition_count = state.topic(topic, self.broker.default_partitions).len();
                for partition in 0..partition_count as i32 {
                    let log = &state.topic(topic, self.broker.default_partitions)[partition as usize];
                    let notify = Arc::clone(&log.notify);
                    let end = log.records.len() as i64;
                    let start = state
                        .committed
                        .get(&(group_id.to_string(), topic.clone(), partition))
                        .copied()
                        .unwrap_or(match initial {
                            InitialOffset::Oldest => 0,
                            InitialOffset::Newest => end,
                        });

                    let (tx, rx) = mpsc::channel(1);
                    let fetcher = Fetcher {
                        broker: Arc::clone(&self.broker),
                        topic: topic.clone(),
                        partition,
                        offset: start,
                        session: session.clone(),
                        notify,
                    };
                    tokio::spawn(fetcher.run(tx));

                    claims.push(PartitionClaim {
                        topic: topic.clone(),
                        partition,
                        records: rx,
                    });
                }
            }
            state.generation
        };

        tracing::debug!(group = %group_id, generation = generation, claims = claims.len(), "Memory Kafka group joined");
        Ok(GroupSession {
            generation,
            claims,
            committer: Arc::new(MemoryCommitter {
                broker: Arc::clone(&self.broker),
                group: group_id.to_string(),
                generation,
                session,
            }),
        })
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        Ok(state.topic(topic, self.broker.default_partitions).len() as i32)
    }

    async fn produce(&self, record: ProducerRecord, acks: RequiredAcks) -> Result<RecordMetadata> {
        self.ensure_open()?;

        let delay = self.broker.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let topic = record.topic.clone();
        let partition = record.partition;
        let offset = append(&self.broker, record)?;
        Ok(RecordMetadata {
            topic,
            partition,
            offset: (acks != RequiredAcks::None).then_some(offset),
            timestamp: Utc::now(),
        })
    }

    fn produce_async(
        &self,
        record: ProducerRecord,
        acks: RequiredAcks,
    ) -> oneshot::Receiver<Result<RecordMetadata>> {
        let (tx, rx) = oneshot::channel();
        let client = self.clone();
        tokio::spawn(async move {
            let report = client.produce(record, acks).await;
            let _ = tx.send(report);
        });
        rx
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct Fetcher {
    broker: Arc<KafkaInner>,
    topic: String,
    partition: i32,
    offset: i64,
    session: Context,
    notify: Arc<Notify>,
}

impl Fetcher {
    async fn run(mut self, tx: mpsc::Sender<Record>) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let state = self.broker.lock();
                state
                    .topics
                    .get(&self.topic)
                    .and_then(|partitions| partitions.get(self.partition as usize))
                    .and_then(|log| log.records.get(self.offset as usize))
                    .cloned()
            };

            match next {
                Some(record) => {
                    let sent = tokio::select! {
                        biased;
                        _ = self.session.cancelled() => false,
                        sent = tx.send(record) => sent.is_ok(),
                    };
                    if !sent {
                        return;
                    }
                    self.offset += 1;
                }
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.session.cancelled() => return,
                        _ = tx.closed() => return,
                    }
                }
            }
        }
    }
}

struct MemoryCommitter {
    broker: Arc<KafkaInner>,
    group: String,
    generation: u64,
    session: Context,
}

#[async_trait]
impl OffsetCommitter for MemoryCommitter {
    async fn mark_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        if self.session.is_cancelled() {
            return Err(MqError::transport(format!(
                "rebalance in progress: generation {} of group {} is gone",
                self.generation, self.group
            )));
        }

        let mut state = self.broker.lock();
        state
            .committed
            .insert((self.group.clone(), topic.to_string(), partition), next_offset);
        state.commits.push(CommitRecord {
            group: self.group.clone(),
            topic: topic.to_string(),
            partition,
            offset: next_offset,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oldest_streams_existing_records() {
        let broker = MemoryKafka::new();
        broker.append("t", 0, "a").unwrap();
        broker.append("t", 0, "b").unwrap();

        let client = broker.client();
        let mut session = client
            .join_group("g", &["t".to_string()], InitialOffset::Oldest)
            .await
            .unwrap();
        let claim = &mut session.claims[0];

        assert_eq!(claim.records.recv().await.unwrap().offset, 0);
        assert_eq!(claim.records.recv().await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_newest_skips_history() {
        let broker = MemoryKafka::new();
        broker.append("t", 0, "old").unwrap();

        let client = broker.client();
        let mut session = client
            .join_group("g", &["t".to_string()], InitialOffset::Newest)
            .await
            .unwrap();
        broker.append("t", 0, "new").unwrap();

        let record = session.claims[0].records.recv().await.unwrap();
        assert_eq!(record.value, b"new");
    }

    #[tokio::test]
    async fn test_disconnect_closes_claims_and_rejects_commits() {
        let broker = MemoryKafka::new();
        broker.append("t", 0, "a").unwrap();

        let client = broker.client();
        let mut session = client
            .join_group("g", &["t".to_string()], InitialOffset::Oldest)
            .await
            .unwrap();
        let _ = session.claims[0].records.recv().await.unwrap();

        broker.disconnect();

        assert!(session.claims[0].records.recv().await.is_none());
        assert!(session.committer.mark_offset("t", 0, 1).await.is_err());
        assert_eq!(broker.committed("g", "t", 0), None);
    }

    #[tokio::test]
    async fn test_rejoin_resumes_from_commit() {
        let broker = MemoryKafka::new();
        for value in ["a", "b", "c"] {
            broker.append("t", 0, value).unwrap();
        }
        let client = broker.client();

        let session = client
            .join_group("g", &["t".to_string()], InitialOffset::Oldest)
            .await
            .unwrap();
        session.committer.mark_offset("t", 0, 2).await.unwrap();
        broker.disconnect();

        let mut next = client
            .join_group("g", &["t".to_string()], InitialOffset::Oldest)
            .await
            .unwrap();
        let record = next.claims[0].records.recv().await.unwrap();
        assert_eq!(record.value, b"c");
        assert_eq!(broker.generations(), 2);
    }

    #[tokio::test]
    async fn test_produce_without_acks_reports_no_offset() {
        let broker = MemoryKafka::with_partitions(2);
        let client = broker.client();

        let record = ProducerRecord {
            topic: "t".to_string(),
            partition: 1,
            key: None,
            headers: HashMap::new(),
            value: b"x".to_vec(),
        };
        let meta = client.produce(record, RequiredAcks::None).await.unwrap();

        assert_eq!(meta.partition, 1);
        assert_eq!(meta.offset, None);
        assert_eq!(broker.values("t", 1), vec![b"x".to_vec()]);
    }
}
