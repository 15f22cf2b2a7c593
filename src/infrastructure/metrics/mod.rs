//! Prometheus metrics for the message queue clients.
//!
//! Every metric is labeled with the transport (`kafka`, `amqp`, `rocketmq`):
//! - Consumption metrics (delivered, acked, nacked, redelivered)
//! - Publish metrics (result counters, latency)
//! - Reconnect metrics
//! - Connection pool metrics

mod helpers;

pub use helpers::{encode_metrics, ConsumeMetrics, PoolMetrics, PublishMetrics, ReconnectMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_mq";

lazy_static! {
    // ============================================================================
    // Consumption Metrics
    // ============================================================================

    /// Messages handed to the registered handler
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages delivered to the handler",
        &["transport"]
    ).unwrap();

    /// Messages acknowledged and committed natively
    pub static ref MESSAGES_ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_acked_total", METRIC_PREFIX),
        "Total messages acknowledged",
        &["transport"]
    ).unwrap();

    /// Messages negatively acknowledged
    pub static ref MESSAGES_NACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_nacked_total", METRIC_PREFIX),
        "Total messages negatively acknowledged",
        &["transport"]
    ).unwrap();

    /// Messages redelivered after a nack
    pub static ref MESSAGES_REDELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_redelivered_total", METRIC_PREFIX),
        "Total messages redelivered after a nack",
        &["transport"]
    ).unwrap();

    /// Handler failures (errors and panics)
    pub static ref HANDLER_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handler_failures_total", METRIC_PREFIX),
        "Total handler invocations that failed",
        &["transport", "kind"]
    ).unwrap();

    // ============================================================================
    // Publish Metrics
    // ============================================================================

    /// Publish attempts by result
    pub static ref PUBLISH_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_publish_total", METRIC_PREFIX),
        "Total publish attempts",
        &["transport", "result"]
    ).unwrap();

    /// Publish latency
    pub static ref PUBLISH_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_publish_latency_seconds", METRIC_PREFIX),
        "Publish latency in seconds",
        &["transport"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // ============================================================================
    // Connectivity Metrics
    // ============================================================================

    /// Resubscriptions performed by the reconnect supervisor
    pub static ref RECONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_reconnects_total", METRIC_PREFIX),
        "Total resubscriptions after a transport disconnect",
        &["transport"]
    ).unwrap();

    /// Connections checked out of a pool
    pub static ref POOL_ACTIVE_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_pool_active_connections", METRIC_PREFIX),
        "Connections currently open (idle or borrowed)",
        &["pool"]
    ).unwrap();

    /// Idle connections in a pool
    pub static ref POOL_IDLE_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_pool_idle_connections", METRIC_PREFIX),
        "Connections currently idle in the pool",
        &["pool"]
    ).unwrap();

    /// Connections discarded (poisoned, expired or over capacity)
    pub static ref POOL_DISCARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_pool_discarded_total", METRIC_PREFIX),
        "Total pooled connections closed instead of reused",
        &["pool", "reason"]
    ).unwrap();
}
