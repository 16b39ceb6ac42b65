//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    INGRESS_REQUESTS_TOTAL, MESSAGES_ENQUEUED_TOTAL, QUEUE_ACTIONS_TOTAL, QUEUE_DEPTH, TASKS_TOTAL,
};
use crate::queue::QueueStats;

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording ingestion metrics
pub struct IngressMetrics;

impl IngressMetrics {
    /// Record one ingestion request outcome
    pub fn record(route: &str, outcome: &str) {
        INGRESS_REQUESTS_TOTAL
            .with_label_values(&[route, outcome])
            .inc();
    }

    pub fn record_enqueued() {
        MESSAGES_ENQUEUED_TOTAL.inc();
    }
}

/// Helper struct for recording worker outcomes
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_delivered() {
        TASKS_TOTAL.with_label_values(&["delivered"]).inc();
    }

    pub fn record_skipped() {
        TASKS_TOTAL.with_label_values(&["skipped"]).inc();
    }

    pub fn record_retryable() {
        TASKS_TOTAL.with_label_values(&["retryable"]).inc();
    }

    pub fn record_fatal() {
        TASKS_TOTAL.with_label_values(&["fatal"]).inc();
    }
}

/// Helper struct for recording queue transport metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_ack() {
        QUEUE_ACTIONS_TOTAL.with_label_values(&["ack"]).inc();
    }

    pub fn record_retry() {
        QUEUE_ACTIONS_TOTAL.with_label_values(&["retry"]).inc();
    }

    pub fn record_dead_letter() {
        QUEUE_ACTIONS_TOTAL.with_label_values(&["dead_letter"]).inc();
    }

    /// Refresh depth gauges from a stats snapshot
    pub fn update_depth(stats: &QueueStats) {
        QUEUE_DEPTH.with_label_values(&["pending"]).set(stats.pending as i64);
        QUEUE_DEPTH.with_label_values(&["scheduled"]).set(stats.scheduled as i64);
        QUEUE_DEPTH.with_label_values(&["inflight"]).set(stats.inflight as i64);
        QUEUE_DEPTH.with_label_values(&["dead"]).set(stats.dead as i64);
    }
}
