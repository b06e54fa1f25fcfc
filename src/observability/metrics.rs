//! # Metrics
//!
//! Prometheus metrics for monitoring the engine.
//!
//! ## Metrics Exposed
//!
//! - `operator_engine_reconciliations_total{kind}` - Reconcile invocations
//! - `operator_engine_reconciliation_errors_total{kind,class}` - Failed reconciles by error class
//! - `operator_engine_reconciliation_duration_seconds{kind}` - Reconcile latency
//! - `operator_engine_queue_depth{kind}` - Keys waiting in the work queue
//! - `operator_engine_requeues_total{kind,reason}` - Keys put back on the queue
//! - `operator_engine_watch_events_total{kind,event}` - Watch events ingested
//! - `operator_engine_watch_restarts_total{kind}` - Watch streams re-established
//! - `operator_engine_relists_total{kind}` - Full relists performed
//! - `operator_engine_child_writes_total{kind,operation}` - Child creates/updates
//! - `operator_engine_is_leader` - 1 while this replica leads
//! - `operator_engine_leader_transitions_total{transition}` - Acquired / lost leadership

use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_reconciliations_total",
            "Total number of reconcile invocations",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_reconciliation_errors_total",
            "Total number of failed reconciles by error class",
        ),
        &["kind", "class"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "operator_engine_reconciliation_duration_seconds",
            "Duration of reconcile invocations in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "operator_engine_queue_depth",
            "Number of keys waiting in the work queue",
        ),
        &["kind"],
    )
    .expect("Failed to create QUEUE_DEPTH metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_requeues_total",
            "Total number of keys put back on the queue by reason",
        ),
        &["kind", "reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static WATCH_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_watch_events_total",
            "Total number of watch events ingested",
        ),
        &["kind", "event"],
    )
    .expect("Failed to create WATCH_EVENTS_TOTAL metric - this should never happen")
});

static WATCH_RESTARTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_watch_restarts_total",
            "Total number of watch streams re-established",
        ),
        &["kind"],
    )
    .expect("Failed to create WATCH_RESTARTS_TOTAL metric - this should never happen")
});

static RELISTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_relists_total",
            "Total number of full relists",
        ),
        &["kind"],
    )
    .expect("Failed to create RELISTS_TOTAL metric - this should never happen")
});

static CHILD_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_child_writes_total",
            "Total number of child object writes by operation",
        ),
        &["kind", "operation"],
    )
    .expect("Failed to create CHILD_WRITES_TOTAL metric - this should never happen")
});

static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "operator_engine_is_leader",
        "1 while this replica holds the leader lease",
    )
    .expect("Failed to create IS_LEADER metric - this should never happen")
});

static LEADER_TRANSITIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "operator_engine_leader_transitions_total",
            "Total number of leadership transitions",
        ),
        &["transition"],
    )
    .expect("Failed to create LEADER_TRANSITIONS_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_RESTARTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RELISTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHILD_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IS_LEADER.clone()))?;
    REGISTRY.register(Box::new(LEADER_TRANSITIONS_TOTAL.clone()))?;

    Ok(())
}

pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str, class: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[kind, class])
        .inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration);
}

pub fn set_queue_depth(kind: &str, depth: usize) {
    let depth = i64::try_from(depth).unwrap_or(i64::MAX);
    QUEUE_DEPTH.with_label_values(&[kind]).set(depth);
}

pub fn increment_requeues(kind: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[kind, reason]).inc();
}

pub fn increment_watch_events(kind: &str, event: &str) {
    WATCH_EVENTS_TOTAL.with_label_values(&[kind, event]).inc();
}

pub fn increment_watch_restarts(kind: &str) {
    WATCH_RESTARTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_relists(kind: &str) {
    RELISTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_child_writes(kind: &str, operation: &str) {
    CHILD_WRITES_TOTAL
        .with_label_values(&[kind, operation])
        .inc();
}

pub fn set_leader(is_leader: bool) {
    IS_LEADER.set(i64::from(is_leader));
}

pub fn increment_leader_transitions(transition: &str) {
    LEADER_TRANSITIONS_TOTAL
        .with_label_values(&[transition])
        .inc();
}
