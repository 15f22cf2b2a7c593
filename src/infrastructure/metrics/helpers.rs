//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    HANDLER_FAILURES_TOTAL, MESSAGES_ACKED_TOTAL, MESSAGES_DELIVERED_TOTAL, MESSAGES_NACKED_TOTAL,
    MESSAGES_REDELIVERED_TOTAL, POOL_ACTIVE_CONNECTIONS, POOL_DISCARDED_TOTAL,
    POOL_IDLE_CONNECTIONS, PUBLISH_LATENCY, PUBLISH_TOTAL, RECONNECTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording consumption metrics
pub struct ConsumeMetrics;

impl ConsumeMetrics {
    pub fn record_delivered(transport: &str) {
        MESSAGES_DELIVERED_TOTAL.with_label_values(&[transport]).inc();
    }

    pub fn record_acked(transport: &str) {
        MESSAGES_ACKED_TOTAL.with_label_values(&[transport]).inc();
    }

    pub fn record_nacked(transport: &str) {
        MESSAGES_NACKED_TOTAL.with_label_values(&[transport]).inc();
    }

    pub fn record_redelivered(transport: &str) {
        MESSAGES_REDELIVERED_TOTAL.with_label_values(&[transport]).inc();
    }

    pub fn record_handler_error(transport: &str) {
        HANDLER_FAILURES_TOTAL.with_label_values(&[transport, "error"]).inc();
    }

    pub fn record_handler_panic(transport: &str) {
        HANDLER_FAILURES_TOTAL.with_label_values(&[transport, "panic"]).inc();
    }
}

/// Helper struct for recording publish metrics
pub struct PublishMetrics;

impl PublishMetrics {
    pub fn record_success(transport: &str, elapsed: Duration) {
        PUBLISH_TOTAL.with_label_values(&[transport, "ok"]).inc();
        PUBLISH_LATENCY
            .with_label_values(&[transport])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(transport: &str) {
        PUBLISH_TOTAL.with_label_values(&[transport, "error"]).inc();
    }

    pub fn record_timeout(transport: &str) {
        PUBLISH_TOTAL.with_label_values(&[transport, "timeout"]).inc();
    }
}

/// Helper struct for reconnect metrics
pub struct ReconnectMetrics;

impl ReconnectMetrics {
    pub fn record_reconnect(transport: &str) {
        RECONNECTS_TOTAL.with_label_values(&[transport]).inc();
    }
}

/// Helper struct for connection pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    /// Publish the current pool occupancy
    pub fn update(pool: &str, active: usize, idle: usize) {
        POOL_ACTIVE_CONNECTIONS
            .with_label_values(&[pool])
            .set(active as i64);
        POOL_IDLE_CONNECTIONS
            .with_label_values(&[pool])
            .set(idle as i64);
    }

    pub fn record_discarded(pool: &str, reason: &str) {
        POOL_DISCARDED_TOTAL.with_label_values(&[pool, reason]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        ConsumeMetrics::record_delivered("test-transport");
        PublishMetrics::record_success("test-transport", Duration::from_millis(3));

        let text = encode_metrics().unwrap();
        assert!(text.contains("ara_mq_messages_delivered_total"));
        assert!(text.contains("ara_mq_publish_latency_seconds"));
    }
}
