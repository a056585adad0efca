//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Reader lifecycle (discovery, connects, unexpected disconnects)
//! - Payments (collections, captures, cancels)
//! - Payment backend calls

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Reader Metrics
// =============================================================================

/// Discovery scans by diagnostic status.
pub static DISCOVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tapline_discoveries_total", "Total reader discovery scans"),
        &["status"], // "ok", "no_readers", "error"
    )
    .unwrap()
});

/// Connect attempts by result.
pub static READER_CONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "tapline_reader_connects_total",
            "Total reader connect attempts",
        ),
        &["result"], // "connected", "timeout", "failed"
    )
    .unwrap()
});

/// Readers lost without a disconnect request.
pub static UNEXPECTED_DISCONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "tapline_reader_unexpected_disconnects_total",
        "Total unexpected reader disconnects",
    )
    .unwrap()
});

// =============================================================================
// Payment Metrics
// =============================================================================

/// Payment collections by result.
pub static COLLECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tapline_collections_total", "Total payment collections"),
        &["result"], // "captured", "authorized", "failed", "cancelled"
    )
    .unwrap()
});

/// Collection duration in seconds, from intent creation to settlement.
pub static COLLECTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "tapline_collection_duration_seconds",
            "Duration of payment collection",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["result"],
    )
    .unwrap()
});

/// Captures by result.
pub static CAPTURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tapline_captures_total", "Total payment captures"),
        &["result"], // "captured", "failed"
    )
    .unwrap()
});

/// Cancels by result.
pub static CANCELS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tapline_cancels_total", "Total payment cancels"),
        &["result"], // "cancelled", "noop", "failed"
    )
    .unwrap()
});

/// Operations refused before touching hardware or backend, by error kind.
pub static REJECTED_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "tapline_rejected_operations_total",
            "Operations rejected by precondition checks",
        ),
        &["operation", "kind"],
    )
    .unwrap()
});

// =============================================================================
// Payment Backend Metrics
// =============================================================================

/// Backend request duration in seconds.
pub static BACKEND_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "tapline_backend_request_duration_seconds",
            "Duration of payment backend requests",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["operation"],
    )
    .unwrap()
});

/// Backend requests by operation and status.
pub static BACKEND_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "tapline_backend_requests_total",
            "Total payment backend requests",
        ),
        &["operation", "status"], // status: "success", "transport", "timeout", "rejected", "invalid_response"
    )
    .unwrap()
});

/// Returns all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Readers
        Box::new(DISCOVERIES.clone()),
        Box::new(READER_CONNECTS.clone()),
        Box::new(UNEXPECTED_DISCONNECTS.clone()),
        // Payments
        Box::new(COLLECTIONS.clone()),
        Box::new(COLLECTION_DURATION.clone()),
        Box::new(CAPTURES.clone()),
        Box::new(CANCELS.clone()),
        Box::new(REJECTED_OPERATIONS.clone()),
        // Backend
        Box::new(BACKEND_REQUEST_DURATION.clone()),
        Box::new(BACKEND_REQUESTS.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        let registry = prometheus::Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
    }

    #[test]
    fn test_counter_labels() {
        DISCOVERIES.with_label_values(&["no_readers"]).inc();
        assert!(DISCOVERIES.with_label_values(&["no_readers"]).get() >= 1);
    }
}
