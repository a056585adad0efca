//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the Tapline server:
//! - HTTP request metrics (latency, counts)
//! - WebSocket connection metrics
//! - Checkout counts and sessions by state (collected dynamically)
//!
//! Session-level counters live in `tapline_core::metrics` and are registered
//! here so `/metrics` exposes both.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};

use tapline_core::SessionState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "tapline_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tapline_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "tapline_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "tapline_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "tapline_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// WebSocket messages sent by type.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tapline_ws_messages_sent_total", "WebSocket messages sent"),
        &["type"],
    )
    .unwrap()
});

/// WebSocket lag events (when client falls behind).
pub static WS_LAG_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "tapline_ws_lag_events_total",
        "WebSocket lag events (client fell behind)",
    )
    .unwrap()
});

// =============================================================================
// Checkout Metrics
// =============================================================================

pub static CHECKOUTS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("tapline_checkouts_active", "Number of open checkouts").unwrap()
});

pub static CHECKOUTS_CREATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "tapline_checkouts_created_total",
        "Total checkouts opened since startup",
    )
    .unwrap()
});

/// Open sessions by current state (collected dynamically).
pub static SESSIONS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("tapline_sessions_by_state", "Open sessions by state"),
        &["state"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // WebSocket
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry.register(Box::new(WS_LAG_EVENTS.clone())).unwrap();

    // Checkouts
    registry
        .register(Box::new(CHECKOUTS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(CHECKOUTS_CREATED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(SESSIONS_BY_STATE.clone()))
        .unwrap();

    // Core metrics (sessions, backend calls)
    for metric in tapline_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so the per-state gauge reflects the open checkouts.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let checkouts = state.checkouts().await;
    CHECKOUTS_ACTIVE.set(checkouts.len() as i64);

    for session_state in SessionState::ALL {
        let count = checkouts
            .iter()
            .filter(|c| c.orchestrator.state() == session_state)
            .count();
        SESSIONS_BY_STATE
            .with_label_values(&[session_state.as_str()])
            .set(count as i64);
    }
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    let uuid_regex = regex_lite::Regex::new(
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
    )
    .unwrap();
    let intent_regex = regex_lite::Regex::new(r"/payments/[^/]+/").unwrap();

    let result = uuid_regex.replace_all(path, "{id}");
    let result = intent_regex.replace_all(&result, "/payments/{intent_id}/");
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/checkouts/550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(normalize_path(path), "/api/v1/checkouts/{id}");
    }

    #[test]
    fn test_normalize_path_intent() {
        let path = "/api/v1/checkouts/550e8400-e29b-41d4-a716-446655440000/payments/pi_3NxY/capture";
        assert_eq!(
            normalize_path(path),
            "/api/v1/checkouts/{id}/payments/{intent_id}/capture"
        );
    }

    #[test]
    fn test_normalize_path_collect_untouched() {
        let path = "/api/v1/checkouts/550e8400-e29b-41d4-a716-446655440000/payments";
        assert_eq!(normalize_path(path), "/api/v1/checkouts/{id}/payments");
    }

    #[test]
    fn test_normalize_path_no_ids() {
        assert_eq!(normalize_path("/api/v1/health"), "/api/v1/health");
    }

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("tapline_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_checkout_metrics() {
        CHECKOUTS_ACTIVE.set(0);
        CHECKOUTS_CREATED_TOTAL.inc();
        SESSIONS_BY_STATE.with_label_values(&["ready"]).set(0);
        WS_CONNECTIONS_TOTAL.inc();

        let output = encode_metrics();
        assert!(output.contains("tapline_checkouts_active"));
        assert!(output.contains("tapline_checkouts_created_total"));
        assert!(output.contains("tapline_sessions_by_state"));
        assert!(output.contains("tapline_ws_connections_total"));
    }
}
