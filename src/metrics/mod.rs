//! Prometheus metrics for the relay.
//!
//! - Ingress metrics (requests by route and outcome, messages enqueued)
//! - Dispatch metrics (task outcomes, queue actions)
//! - Target metrics (execute latency, errors, XMPP reconnects)
//! - Queue depth gauges, refreshed on scrape

mod helpers;

pub use helpers::{encode_metrics, DispatchMetrics, IngressMetrics, QueueMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "push_relay";

lazy_static! {
    // ============================================================================
    // Ingress Metrics
    // ============================================================================

    /// HTTP ingestion requests by route and outcome
    pub static ref INGRESS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ingress_requests_total", METRIC_PREFIX),
        "Total ingestion requests",
        &["route", "outcome"]
    ).unwrap();

    /// Messages accepted onto the queue
    pub static ref MESSAGES_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_enqueued_total", METRIC_PREFIX),
        "Total messages accepted onto the task queue"
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Worker outcomes (delivered, skipped, retryable, fatal)
    pub static ref TASKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_tasks_total", METRIC_PREFIX),
        "Total tasks handled by the dispatch worker",
        &["outcome"]
    ).unwrap();

    /// Transport actions taken after handling (ack, retry, dead_letter)
    pub static ref QUEUE_ACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_actions_total", METRIC_PREFIX),
        "Total queue actions taken after task handling",
        &["action"]
    ).unwrap();

    /// Current queue depth by list
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Number of tasks per queue list",
        &["list"]
    ).unwrap();

    // ============================================================================
    // Target Metrics
    // ============================================================================

    /// Backend execute latency in seconds
    pub static ref TARGET_EXECUTE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        format!("{}_target_execute_duration_seconds", METRIC_PREFIX),
        "Backend execute latency in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Backend execute failures
    pub static ref TARGET_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_target_errors_total", METRIC_PREFIX),
        "Total backend execute failures",
        &["kind"]
    ).unwrap();

    /// XMPP session re-establishments
    pub static ref XMPP_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_xmpp_reconnects_total", METRIC_PREFIX),
        "Total XMPP reconnects performed during execute"
    ).unwrap();
}
