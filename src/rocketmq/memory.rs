//! In-process push-consumer broker.
//!
//! Reproduces broker-managed retry: a batch answered with `ReconsumeLater`
//! is re-sent to the group's retry topic (`%RETRY%<group>`) with its
//! reconsume counter bumped, and after `max_reconsume_times` retries it is
//! parked in the dead-letter topic (`%DLQ%<group>`). Consumption offsets are
//! kept per group and topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{MqError, Result};

use super::config::{ConsumeFrom, Selector};
use super::native::{
    ConsumeResult, MessageExt, OutgoingMessage, Producer, ProducerOptions, PushConsumer,
    PushConsumerOptions, PushListener, RocketMqNative, SendResult, SendStatus,
};

/// Scheduled delivery delays in seconds, indexed by level - 1.
const DELAY_LEVELS_SECS: [u64; 18] = [
    1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600, 7200,
];

const PROPERTY_RETRY_TOPIC: &str = "RETRY_TOPIC";

pub fn retry_topic(group: &str) -> String {
    format!("%RETRY%{group}")
}

pub fn dlq_topic(group: &str) -> String {
    format!("%DLQ%{group}")
}

#[derive(Debug, Clone)]
struct Stored {
    ext: MessageExt,
    deliver_at: Option<Instant>,
}

#[derive(Default)]
struct TopicLog {
    messages: Vec<Stored>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct RmqState {
    topics: HashMap<String, TopicLog>,
    forced_status: Option<SendStatus>,
}

struct RmqInner {
    state: Mutex<RmqState>,
    /// Consume progress per (group, topic), outside the log lock
    offsets: DashMap<(String, String), i64>,
    retry_delay_ms: AtomicU64,
    send_delay_ms: AtomicU64,
}

impl RmqInner {
    fn lock(&self) -> MutexGuard<'_, RmqState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn append(&self, topic: &str, mut ext: MessageExt, deliver_at: Option<Instant>) -> i64 {
        let mut state = self.lock();
        let log = state.topics.entry(topic.to_string()).or_default();
        let offset = log.messages.len() as i64;
        ext.queue_offset = offset;
        log.messages.push(Stored { ext, deliver_at });
        log.notify.notify_waiters();
        offset
    }

    /// Broker side of `ReconsumeLater`.
    fn send_back(&self, group: &str, mut ext: MessageExt, max_reconsume_times: u32) {
        if ext.reconsume_times >= max_reconsume_times {
            tracing::warn!(
                group = %group,
                msg_id = %ext.msg_id,
                reconsume_times = ext.reconsume_times,
                "Message exhausted its retries, moving to dead-letter topic"
            );
            self.append(&dlq_topic(group), ext, None);
            return;
        }

        ext.reconsume_times += 1;
        ext.properties
            .entry(PROPERTY_RETRY_TOPIC.to_string())
            .or_insert_with(|| ext.topic.clone());
        let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::SeqCst));
        self.append(&retry_topic(group), ext, Some(Instant::now() + delay));
    }
}

/// In-process broker; clones share state.
#[derive(Clone)]
pub struct MemoryRocketMq {
    inner: Arc<RmqInner>,
}

impl Default for MemoryRocketMq {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRocketMq {
    /// Broker with a one second retry delay.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RmqInner {
                state: Mutex::new(RmqState::default()),
                offsets: DashMap::new(),
                retry_delay_ms: AtomicU64::new(1_000),
                send_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_retry_delay(&self, delay: Duration) {
        self.inner
            .retry_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every send before it is stored.
    pub fn set_send_delay(&self, delay: Duration) {
        self.inner
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer sends with `status` instead of `SendOk`.
    pub fn set_send_status(&self, status: Option<SendStatus>) {
        self.inner.lock().forced_status = status;
    }

    /// Store a message directly, bypassing any producer. Returns its offset.
    pub fn append(&self, topic: &str, tags: Option<&str>, body: impl Into<Vec<u8>>) -> i64 {
        let ext = new_ext(OutgoingMessage {
            topic: topic.to_string(),
            tags: tags.map(str::to_string),
            keys: vec![],
            delay_level: None,
            properties: HashMap::new(),
            body: body.into(),
        });
        self.inner.append(topic, ext, None)
    }

    pub fn messages(&self, topic: &str) -> Vec<MessageExt> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|log| log.messages.iter().map(|s| s.ext.clone()).collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, group: &str) -> Vec<MessageExt> {
        self.messages(&dlq_topic(group))
    }

    pub fn retries(&self, group: &str) -> Vec<MessageExt> {
        self.messages(&retry_topic(group))
    }

    pub fn consumed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.inner
            .offsets
            .get(&(group.to_string(), topic.to_string()))
            .map(|offset| *offset)
    }
}

fn new_ext(message: OutgoingMessage) -> MessageExt {
    MessageExt {
        msg_id: Uuid::new_v4().simple().to_string().to_uppercase(),
        topic: message.topic,
        tags: message.tags,
        keys: message.keys,
        queue_id: 0,
        queue_offset: 0,
        reconsume_times: 0,
        properties: message.properties,
        body: message.body,
        born_timestamp: Utc::now(),
    }
}

impl RocketMqNative for MemoryRocketMq {
    fn push_consumer(&self, options: PushConsumerOptions) -> Result<Box<dyn PushConsumer>> {
        Ok(Box::new(MemoryPushConsumer {
            broker: Arc::clone(&self.inner),
            options,
            subscriptions: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        }))
    }

    fn producer(&self, options: ProducerOptions) -> Result<Box<dyn Producer>> {
        Ok(Box::new(MemoryProducer {
            broker: Arc::clone(&self.inner),
            options,
            started: AtomicBool::new(false),
        }))
    }
}

#[derive(Clone)]
struct SubscriptionEntry {
    topic: String,
    selector: Selector,
    listener: PushListener,
}

struct MemoryPushConsumer {
    broker: Arc<RmqInner>,
    options: PushConsumerOptions,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    running: Mutex<Option<Context>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl PushConsumer for MemoryPushConsumer {
    async fn subscribe(&self, topic: &str, selector: &Selector, listener: PushListener) -> Result<()> {
        lock(&self.subscriptions).push(SubscriptionEntry {
            topic: topic.to_string(),
            selector: selector.clone(),
            listener,
        });
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(MqError::transport("push consumer already started"));
        }

        let subscriptions = lock(&self.subscriptions).clone();
        let Some(first) = subscriptions.first().cloned() else {
            return Err(MqError::transport("push consumer has no subscription"));
        };

        let ctx = Context::background();
        let group = &self.options.group;

        let mut tasks: Vec<(SubscriptionEntry, ConsumeFrom)> = subscriptions
            .into_iter()
            .map(|s| (s, self.options.consume_from))
            .collect();
        // The group's retry topic is consumed with the same listener
        tasks.push((
            SubscriptionEntry {
                topic: retry_topic(group),
                selector: Selector::default(),
                listener: first.listener,
            },
            ConsumeFrom::FirstOffset,
        ));

        for (subscription, consume_from) in tasks {
            let task = ConsumeTask {
                broker: Arc::clone(&self.broker),
                group: group.clone(),
                max_reconsume_times: self.options.max_reconsume_times,
                consume_from,
                subscription,
                ctx: ctx.clone(),
            };
            tokio::spawn(task.run());
        }

        tracing::debug!(group = %group, instance = %self.options.instance_name, "Memory push consumer started");
        *running = Some(ctx);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(ctx) = lock(&self.running).take() {
            ctx.cancel();
        }
        Ok(())
    }
}

struct ConsumeTask {
    broker: Arc<RmqInner>,
    group: String,
    max_reconsume_times: u32,
    consume_from: ConsumeFrom,
    subscription: SubscriptionEntry,
    ctx: Context,
}

impl ConsumeTask {
    async fn run(self) {
        let topic = self.subscription.topic.clone();
        let key = (self.group.clone(), topic.clone());

        let (notify, mut offset) = {
            let committed = self.broker.offsets.get(&key).map(|offset| *offset);
            let mut state = self.broker.lock();
            let log = state.topics.entry(topic.clone()).or_default();
            let start = committed.unwrap_or(match self.consume_from {
                ConsumeFrom::FirstOffset => 0,
                ConsumeFrom::LastOffset => log.messages.len() as i64,
            });
            (Arc::clone(&log.notify), start)
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self
                .broker
                .lock()
                .topics
                .get(&topic)
                .and_then(|log| log.messages.get(offset as usize))
                .cloned();

            let stored = match next {
                Some(stored) => stored,
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.ctx.cancelled() => return,
                    }
                    continue;
                }
            };

            if let Some(at) = stored.deliver_at {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = self.ctx.cancelled() => return,
                }
            }
            if self.ctx.is_cancelled() {
                return;
            }

            let ext = stored.ext;
            if self.subscription.selector.matches_tag(ext.tags.as_deref()) {
                // Never interrupted: a running listener is always allowed to finish
                let result = (self.subscription.listener)(vec![ext.clone()]).await;
                if result == ConsumeResult::ReconsumeLater {
                    self.broker
                        .send_back(&self.group, ext, self.max_reconsume_times);
                }
            }

            offset += 1;
            self.broker.offsets.insert(key.clone(), offset);
        }
    }
}

struct MemoryProducer {
    broker: Arc<RmqInner>,
    options: ProducerOptions,
    started: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        tracing::debug!(group = %self.options.group, "Memory producer started");
        Ok(())
    }

    async fn send_sync(&self, message: OutgoingMessage, timeout: Duration) -> Result<SendResult> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(MqError::transport("producer is not started"));
        }

        let delay = Duration::from_millis(self.broker.send_delay_ms.load(Ordering::SeqCst));
        if delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(MqError::Timeout(timeout));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let deliver_at = message
            .delay_level
            .filter(|level| *level > 0)
            .map(|level| {
                let index = (level as usize).min(DELAY_LEVELS_SECS.len()) - 1;
                Instant::now() + Duration::from_secs(DELAY_LEVELS_SECS[index])
            });

        let topic = message.topic.clone();
        let ext = new_ext(message);
        let msg_id = ext.msg_id.clone();
        let queue_offset = self.broker.append(&topic, ext, deliver_at);
        let status = self.broker.lock().forced_status.unwrap_or(SendStatus::SendOk);

        Ok(SendResult {
            status,
            msg_id,
            queue_id: 0,
            queue_offset,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn options(group: &str, max_reconsume_times: u32) -> PushConsumerOptions {
        PushConsumerOptions {
            group: group.to_string(),
            instance_name: "test".to_string(),
            consume_from: ConsumeFrom::FirstOffset,
            max_reconsume_times,
        }
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let broker = MemoryRocketMq::new();
        broker.set_retry_delay(Duration::from_millis(1));
        broker.append("orders", None, "poison");

        let calls = Arc::new(AtomicUsize::new(0));
        let listener: PushListener = {
            let calls = calls.clone();
            Arc::new(move |_msgs: Vec<MessageExt>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { ConsumeResult::ReconsumeLater }.boxed()
            })
        };

        let consumer = broker.push_consumer(options("G", 2)).unwrap();
        consumer
            .subscribe("orders", &Selector::default(), listener)
            .await
            .unwrap();
        consumer.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.dead_letters("G").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        consumer.shutdown().await.unwrap();

        // First delivery plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let dead = broker.dead_letters("G");
        assert_eq!(dead[0].body, b"poison");
        assert_eq!(dead[0].reconsume_times, 2);
    }

    #[tokio::test]
    async fn test_tag_selector_filters() {
        let broker = MemoryRocketMq::new();
        broker.append("orders", Some("created"), "1");
        broker.append("orders", Some("refunded"), "2");
        broker.append("orders", Some("created"), "3");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener: PushListener = {
            let seen = seen.clone();
            Arc::new(move |msgs: Vec<MessageExt>| {
                lock(&seen).extend(msgs.into_iter().map(|m| m.body));
                async { ConsumeResult::ConsumeSuccess }.boxed()
            })
        };

        let consumer = broker.push_consumer(options("G", 16)).unwrap();
        let selector = Selector {
            expression: "created".to_string(),
            ..Default::default()
        };
        consumer.subscribe("orders", &selector, listener).await.unwrap();
        consumer.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.consumed_offset("G", "orders") != Some(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        consumer.shutdown().await.unwrap();

        assert_eq!(*lock(&seen), vec![b"1".to_vec(), b"3".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_requires_start_and_reports_status() {
        let broker = MemoryRocketMq::new();
        let producer = broker
            .producer(ProducerOptions {
                group: "G".to_string(),
                instance_name: "test".to_string(),
                retry_times: 0,
            })
            .unwrap();
        let message = OutgoingMessage {
            topic: "orders".to_string(),
            tags: None,
            keys: vec![],
            delay_level: None,
            properties: HashMap::new(),
            body: b"x".to_vec(),
        };

        assert!(producer
            .send_sync(message.clone(), Duration::from_secs(1))
            .await
            .is_err());

        producer.start().await.unwrap();
        broker.set_send_status(Some(SendStatus::FlushDiskTimeout));
        let result = producer
            .send_sync(message, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::FlushDiskTimeout);
        assert_eq!(broker.messages("orders").len(), 1);
    }
}
