//! In-process AMQP broker.
//!
//! Models the delivery rules the transport relies on: exchanges route to
//! bound queues, deliveries stay unacked until acked or nacked, a nack with
//! requeue puts the message back at the head of its queue, and losing a
//! connection requeues everything it had not acked.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::context::Context;
use crate::error::{MqError, Result};

use super::config::{ExchangeConfig, ExchangeKind};
use super::native::{
    AmqpAcker, AmqpChannel, AmqpConnection, AmqpConnector, AmqpDelivery, ConsumeRequest,
    PublishConfirm, Publishing,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    message_id: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    connection: u64,
    consumer: u64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    dead_letters: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, Context>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    connections_opened: AtomicUsize,
    exchange_declarations: AtomicUsize,
    published: AtomicU64,
    refuse_connections: AtomicBool,
    nack_confirms: AtomicBool,
    confirm_delay_ms: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn close_connection(&self, id: u64) {
        let mut state = self.lock();
        if let Some(ctx) = state.connections.remove(&id) {
            ctx.cancel();
        }

        for queue in state.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.connection == id)
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            // Highest tag first so the oldest delivery ends up at the head
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            queue.notify.notify_waiters();
        }
    }
}

/// In-process broker; clones share state.
#[derive(Clone, Default)]
pub struct MemoryAmqp {
    inner: Arc<BrokerInner>,
}

impl MemoryAmqp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue outside of any client.
    pub fn declare_queue(&self, name: &str) {
        self.inner.lock().queues.entry(name.to_string()).or_default();
    }

    /// Declare an exchange and bind `queue` to it with `routing_key`.
    pub fn bind(&self, queue: &str, exchange: &str, kind: ExchangeKind, routing_key: &str) {
        let mut state = self.inner.lock();
        state.queues.entry(queue.to_string()).or_default();
        let exchange = state
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        exchange
            .bindings
            .push((queue.to_string(), routing_key.to_string()));
    }

    /// Simulate a network failure: every open connection is closed and its
    /// unacked deliveries are requeued.
    pub fn drop_connections(&self) {
        let ids: Vec<u64> = self.inner.lock().connections.keys().copied().collect();
        for id in ids {
            self.inner.close_connection(id);
        }
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Negatively confirm every publish made in confirm mode.
    pub fn set_nack_confirms(&self, nack: bool) {
        self.inner.nack_confirms.store(nack, Ordering::SeqCst);
    }

    /// Delay publisher confirms.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.inner
            .confirm_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    pub fn exchange_declarations(&self) -> usize {
        self.inner.exchange_declarations.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Messages waiting for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acked.
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies rejected without requeue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Bodies waiting in the queue, head first.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AmqpConnector for MemoryAmqp {
    async fn connect(&self, address: &str) -> Result<Arc<dyn AmqpConnection>> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(MqError::transport(format!("connection refused: {address}")));
        }

        let id = self.inner.next_id();
        let closed = Context::background();
        self.inner.lock().connections.insert(id, closed.clone());
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);

        tracing::trace!(connection = id, address = %address, "Memory AMQP connection opened");
        Ok(Arc::new(MemoryConnection {
            id,
            broker: Arc::clone(&self.inner),
            closed,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
    closed: Context,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        if self.is_closed() {
            return Err(MqError::transport("connection closed"));
        }
        Ok(Box::new(MemoryChannel {
            connection: self.id,
            broker: Arc::clone(&self.broker),
            closed: self.closed.child(),
            confirm: AtomicBool::new(false),
            prefetch: AtomicUsize::new(0),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    connection: u64,
    broker: Arc<BrokerInner>,
    closed: Context,
    confirm: AtomicBool,
    prefetch: AtomicUsize,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(MqError::transport("channel closed"))
        } else {
            Ok(())
        }
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => {
                return Err(MqError::transport(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    exchange.name
                )));
            }
            Some(_) => {}
            None => {
                state.exchanges.insert(
                    exchange.name.clone(),
                    ExchangeState {
                        kind: exchange.kind,
                        bindings: Vec::new(),
                    },
                );
            }
        }
        self.broker
            .exchange_declarations
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, _durable: bool, _exclusive: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(MqError::transport(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let Some(exchange_state) = state.exchanges.get_mut(exchange) else {
            return Err(MqError::transport(format!("NOT_FOUND - no exchange '{exchange}'")));
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count as usize, Ordering::SeqCst);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        self.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> Result<PublishConfirm> {
        self.ensure_open()?;

        let message = StoredMessage {
            exchange: publishing.exchange.clone(),
            routing_key: publishing.routing_key.clone(),
            message_id: Some(publishing.message_id.clone()),
            headers: publishing.headers,
            body: publishing.body,
            redelivered: false,
        };

        {
            let mut state = self.broker.lock();
            let targets: Vec<String> = if publishing.exchange.is_empty() {
                vec![publishing.routing_key.clone()]
            } else {
                let Some(exchange) = state.exchanges.get(&publishing.exchange) else {
                    return Err(MqError::transport(format!(
                        "NOT_FOUND - no exchange '{}'",
                        publishing.exchange
                    )));
                };
                exchange
                    .bindings
                    .iter()
                    .filter(|(_, key)| match exchange.kind {
                        ExchangeKind::Direct => *key == publishing.routing_key,
                        ExchangeKind::Topic => topic_matches(key, &publishing.routing_key),
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                    })
                    .map(|(queue, _)| queue.clone())
                    .collect()
            };

            let mut routed = false;
            for target in targets {
                if let Some(queue) = state.queues.get_mut(&target) {
                    queue.ready.push_back(message.clone());
                    queue.notify.notify_waiters();
                    routed = true;
                }
            }
            if !routed && publishing.mandatory {
                return Err(MqError::Publish(format!(
                    "NO_ROUTE - message to '{}' with key '{}' was returned",
                    publishing.exchange, publishing.routing_key
                )));
            }
        }
        self.broker.published.fetch_add(1, Ordering::SeqCst);

        if !self.confirm.load(Ordering::SeqCst) {
            return Ok(PublishConfirm::NotRequested);
        }

        let delay = self.broker.confirm_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.broker.nack_confirms.load(Ordering::SeqCst) {
            Ok(PublishConfirm::Nack)
        } else {
            Ok(PublishConfirm::Ack)
        }
    }

    async fn consume(&self, request: ConsumeRequest) -> Result<mpsc::Receiver<AmqpDelivery>> {
        self.ensure_open()?;

        let notify = {
            let state = self.broker.lock();
            match state.queues.get(&request.queue) {
                Some(queue) => Arc::clone(&queue.notify),
                None => {
                    return Err(MqError::transport(format!(
                        "NOT_FOUND - no queue '{}'",
                        request.queue
                    )));
                }
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let pump = ConsumerPump {
            broker: Arc::clone(&self.broker),
            connection: self.connection,
            consumer: self.broker.next_id(),
            queue: request.queue,
            auto_ack: request.auto_ack,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            closed: self.closed.clone(),
            notify,
        };
        tokio::spawn(pump.run(tx));

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Pushes ready messages of one queue to one consumer.
struct ConsumerPump {
    broker: Arc<BrokerInner>,
    connection: u64,
    consumer: u64,
    queue: String,
    auto_ack: bool,
    prefetch: usize,
    closed: Context,
    notify: Arc<Notify>,
}

impl ConsumerPump {
    async fn run(self, tx: mpsc::Sender<AmqpDelivery>) {
        loop {
            let Some((tag, message)) = self.next_message(&tx).await else {
                break;
            };

            let delivery = AmqpDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                message_id: message.message_id.clone(),
                headers: message.headers.clone(),
                body: message.body.clone(),
                acker: Box::new(MemoryAcker {
                    broker: Arc::clone(&self.broker),
                    queue: self.queue.clone(),
                    tag,
                    closed: self.closed.clone(),
                }),
            };

            let sent = tokio::select! {
                result = tx.send(delivery) => result.is_ok(),
                _ = self.closed.cancelled() => false,
            };
            if !sent {
                self.requeue(tag);
                break;
            }
        }
        tracing::trace!(queue = %self.queue, consumer = self.consumer, "Memory AMQP consumer stopped");
    }

    /// Wait for a deliverable message, honoring the prefetch window.
    async fn next_message(&self, tx: &mpsc::Sender<AmqpDelivery>) -> Option<(u64, StoredMessage)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.lock();
                let queue = state.queues.get_mut(&self.queue)?;
                let outstanding = queue
                    .unacked
                    .values()
                    .filter(|u| u.consumer == self.consumer)
                    .count();
                let window_open = self.auto_ack || self.prefetch == 0 || outstanding < self.prefetch;

                if window_open {
                    if let Some(message) = queue.ready.pop_front() {
                        let tag = self.broker.next_id();
                        if !self.auto_ack {
                            queue.unacked.insert(
                                tag,
                                Unacked {
                                    message: message.clone(),
                                    connection: self.connection,
                                    consumer: self.consumer,
                                },
                            );
                        }
                        return Some((tag, message));
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => return None,
                _ = tx.closed() => return None,
            }
        }
    }

    fn requeue(&self, tag: u64) {
        let mut state = self.broker.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                queue.ready.push_front(unacked.message);
                queue.notify.notify_waiters();
            }
        }
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    queue: String,
    tag: u64,
    closed: Context,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(MqError::transport("channel closed before acknowledgment"));
        }

        let mut state = self.broker.lock();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(MqError::transport(format!("NOT_FOUND - no queue '{}'", self.queue)));
        };
        let Some(unacked) = queue.unacked.remove(&self.tag) else {
            return Err(MqError::transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            )));
        };

        match requeue {
            None => {}
            Some(true) => {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Some(false) => queue.dead_letters.push(unacked.message),
        }
        queue.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl AmqpAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publishing(exchange: &str, routing_key: &str, body: &str) -> Publishing {
        Publishing {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: false,
            immediate: false,
            headers: HashMap::new(),
            content_type: "text/plain".to_string(),
            persistent: true,
            message_id: "m".to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn consume_request(queue: &str) -> ConsumeRequest {
        ConsumeRequest {
            queue: queue.to_string(),
            consumer_tag: String::new(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            args: HashMap::new(),
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("order.created", "order.updated"));
    }

    #[tokio::test]
    async fn test_nack_requeues_to_head() {
        let broker = MemoryAmqp::new();
        broker.declare_queue("q");
        let conn = broker.connect("memory").await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        channel.publish(publishing("", "q", "a")).await.unwrap();
        channel.publish(publishing("", "q", "b")).await.unwrap();
        channel.qos(1).await.unwrap();

        let mut deliveries = channel.consume(consume_request("q")).await.unwrap();
        let first = deliveries.recv().await.unwrap();
        assert_eq!(first.body, b"a");
        first.acker.nack(true).await.unwrap();

        let again = deliveries.recv().await.unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
        again.acker.ack().await.unwrap();

        let second = deliveries.recv().await.unwrap();
        assert_eq!(second.body, b"b");
    }

    #[tokio::test]
    async fn test_connection_loss_requeues_unacked() {
        let broker = MemoryAmqp::new();
        broker.declare_queue("q");
        let conn = broker.connect("memory").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.publish(publishing("", "q", "a")).await.unwrap();

        let mut deliveries = channel.consume(consume_request("q")).await.unwrap();
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(broker.unacked("q"), 1);

        broker.drop_connections();

        assert!(conn.is_closed());
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(delivery.acker.ack().await.is_err());
        assert!(deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_topic_exchange_routes_by_pattern() {
        let broker = MemoryAmqp::new();
        broker.bind("eu", "events", ExchangeKind::Topic, "order.*.eu");
        broker.bind("all", "events", ExchangeKind::Topic, "order.#");
        let conn = broker.connect("memory").await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        channel
            .publish(publishing("events", "order.created.eu", "1"))
            .await
            .unwrap();
        channel
            .publish(publishing("events", "order.created.us", "2"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("eu"), 1);
        assert_eq!(broker.queue_depth("all"), 2);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = MemoryAmqp::new();
        broker.declare_queue("q");
        let conn = broker.connect("memory").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.publish(publishing("", "q", "poison")).await.unwrap();

        let mut deliveries = channel.consume(consume_request("q")).await.unwrap();
        let delivery = deliveries.recv().await.unwrap();
        delivery.acker.nack(false).await.unwrap();

        assert_eq!(broker.dead_letters("q"), vec![b"poison".to_vec()]);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_mandatory_unroutable_publish_fails() {
        let broker = MemoryAmqp::new();
        let conn = broker.connect("memory").await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let mut msg = publishing("", "missing", "x");
        msg.mandatory = true;

        assert!(matches!(channel.publish(msg).await, Err(MqError::Publish(_))));
    }
}
