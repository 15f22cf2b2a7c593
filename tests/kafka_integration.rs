//! Integration tests for the Kafka-style transport
//!
//! These tests run the full client against the in-process partitioned log.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ara_mq::kafka::{InitialOffset, KafkaClient, KafkaConfig, MemoryKafka};
use ara_mq::queer::{GracefulStopper, HandlerRegistrar, Publisher, Stopper};
use ara_mq::{handler_fn, Context, Message, MqError, PublishOptions, RunMode};

use common::{spawn_consume, wait_until, Seen, SlowHandler};

const GROUP: &str = "billing";
const TOPIC: &str = "orders";

/// Helper to create a consuming client on `broker`
fn consumer(broker: &MemoryKafka) -> Arc<KafkaClient> {
    let mut config = KafkaConfig {
        reconnect_backoff_ms: 20,
        ..Default::default()
    };
    config.consumer.group_id = GROUP.to_string();
    config.consumer.topics = vec![TOPIC.to_string()];
    config.consumer.initial_offset = InitialOffset::Oldest;
    config.consumer.redelivery_delay_ms = 10;

    Arc::new(KafkaClient::new(config, Arc::new(broker.client())).unwrap())
}

fn commit_offsets(broker: &MemoryKafka) -> Vec<i64> {
    broker.commits(GROUP).iter().map(|c| c.offset).collect()
}

// =============================================================================
// Delivery Tests
// =============================================================================

#[tokio::test]
async fn test_acks_commit_in_order_without_redelivery() {
    let broker = MemoryKafka::new();
    for i in 0..5 {
        broker.append(TOPIC, 0, format!("m{i}")).unwrap();
    }

    let client = consumer(&broker);
    let seen = Seen::default();
    client.register_handler(seen.acking_handler()).unwrap();
    let consuming = spawn_consume(&client, &Context::background());

    wait_until("five commits", || broker.commits(GROUP).len() == 5).await;
    // Nothing else may arrive once everything is committed
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.stop().await.unwrap();
    consuming.await.unwrap().unwrap();

    assert_eq!(commit_offsets(&broker), vec![1, 2, 3, 4, 5]);
    assert_eq!(seen.bodies(), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert!(seen.all().iter().all(|(_, attempt)| *attempt == 1));
}

#[tokio::test]
async fn test_nack_redelivers_only_that_message() {
    let broker = MemoryKafka::new();
    for i in 0..3 {
        broker.append(TOPIC, 0, format!("m{i}")).unwrap();
    }

    let client = consumer(&broker);
    let seen = Seen::default();
    client.register_handler(seen.nack_once_handler("m1")).unwrap();
    let consuming = spawn_consume(&client, &Context::background());

    wait_until("three commits", || broker.commits(GROUP).len() == 3).await;
    client.stop().await.unwrap();
    consuming.await.unwrap().unwrap();

    assert_eq!(
        seen.all(),
        vec![
            ("m0".to_string(), 1),
            ("m1".to_string(), 1),
            ("m1".to_string(), 2),
            ("m2".to_string(), 1),
        ]
    );
    assert_eq!(commit_offsets(&broker), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_handler_error_ends_consume_without_commit() {
    let broker = MemoryKafka::new();
    broker.append(TOPIC, 0, "unparseable").unwrap();

    let client = consumer(&broker);
    client
        .register_handler(handler_fn(|_ctx, _msg| async {
            Err(anyhow::anyhow!("cannot decode"))
        }))
        .unwrap();

    let result = spawn_consume(&client, &Context::background()).await.unwrap();

    assert!(matches!(result, Err(MqError::Handler(_))));
    assert_eq!(broker.committed(GROUP, TOPIC, 0), None);
}

#[tokio::test]
async fn test_cancelled_context_ends_consume() {
    let broker = MemoryKafka::new();
    let client = consumer(&broker);
    let seen = Seen::default();
    client.register_handler(seen.acking_handler()).unwrap();

    let ctx = Context::background();
    let consuming = spawn_consume(&client, &ctx);
    wait_until("group joined", || broker.generations() == 1).await;

    ctx.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), consuming)
        .await
        .expect("consume should return after cancellation")
        .unwrap();
    assert!(result.is_ok());
}

// =============================================================================
// Reconnect Tests
// =============================================================================

#[tokio::test]
async fn test_disconnect_resubscribes_and_stop_ends_delivery() {
    let broker = MemoryKafka::new();
    broker.append(TOPIC, 0, "before").unwrap();

    let client = consumer(&broker);
    let seen = Seen::default();
    client.register_handler(seen.acking_handler()).unwrap();
    let consuming = spawn_consume(&client, &Context::background());

    wait_until("first commit", || broker.committed(GROUP, TOPIC, 0) == Some(1)).await;

    broker.disconnect();
    wait_until("second generation", || broker.generations() >= 2).await;

    broker.append(TOPIC, 0, "after").unwrap();
    wait_until("delivery after resubscribe", || seen.count("after") == 1).await;
    wait_until("second commit", || broker.committed(GROUP, TOPIC, 0) == Some(2)).await;

    client.stop().await.unwrap();
    consuming.await.unwrap().unwrap();
    let generations = broker.generations();

    // A session loss after stop must not rejoin the group
    broker.disconnect();
    broker.append(TOPIC, 0, "after-stop").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.generations(), generations);
    assert_eq!(seen.bodies(), vec!["before", "after"]);
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[tokio::test]
async fn test_graceful_stop_waits_for_sleeping_handler() {
    let broker = MemoryKafka::new();
    broker.append(TOPIC, 0, "slow").unwrap();

    let client = consumer(&broker);
    let slow = SlowHandler::default();
    client
        .register_handler(slow.handler(Duration::from_millis(150)))
        .unwrap();
    let consuming = spawn_consume(&client, &Context::background());

    wait_until("handler start", || slow.has_started()).await;
    client.graceful_stop().await.unwrap();

    assert!(slow.has_finished());
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(1));
    consuming.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consume_after_stop_is_rejected() {
    let broker = MemoryKafka::new();
    let client = consumer(&broker);
    client
        .register_handler(Seen::default().acking_handler())
        .unwrap();
    client.stop().await.unwrap();

    let result = spawn_consume(&client, &Context::background()).await.unwrap();
    assert!(matches!(result, Err(MqError::Closed)));
}

// =============================================================================
// Publish Tests
// =============================================================================

#[tokio::test]
async fn test_async_publish_times_out() {
    let broker = MemoryKafka::new();
    broker.set_ack_delay(Duration::from_secs(2));

    let mut config = KafkaConfig {
        mode: RunMode::Publish,
        ..Default::default()
    };
    config.producer.sync = false;
    let client = KafkaClient::new(config, Arc::new(broker.client())).unwrap();

    let started = Instant::now();
    let result = client
        .publish(
            &Context::background(),
            TOPIC,
            Message::new("late"),
            PublishOptions::default().timeout(Duration::from_millis(50)),
        )
        .await;

    assert!(matches!(result, Err(MqError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_published_records_reach_consumer() {
    let broker = MemoryKafka::with_partitions(3);
    let client = consumer(&broker);
    let seen = Seen::default();
    client.register_handler(seen.acking_handler()).unwrap();
    let consuming = spawn_consume(&client, &Context::background());
    wait_until("group joined", || broker.generations() == 1).await;

    for key in ["a", "b", "c", "d"] {
        client
            .publish(
                &Context::background(),
                TOPIC,
                Message::new(key),
                PublishOptions::default().key(key),
            )
            .await
            .unwrap();
    }

    wait_until("four deliveries", || seen.len() == 4).await;
    client.stop().await.unwrap();
    consuming.await.unwrap().unwrap();

    let mut bodies = seen.bodies();
    bodies.sort();
    assert_eq!(bodies, vec!["a", "b", "c", "d"]);
}
