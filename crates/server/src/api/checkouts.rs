//! Checkout API handlers.
//!
//! Each checkout owns one terminal session. Operation responses share one
//! shape, `{ok, state, guidance, value | error}`, and the HTTP status follows
//! the error kind so a caller can branch without parsing the body.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use tapline_core::{
    CollectOptions, DiscoveryCriteria, ErrorKind, Failure, Guidance, Outcome, Reader,
    SessionSnapshot, SessionState,
};

use crate::state::{AppState, Checkout};

/// Error response for requests that never reach a session.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Result of a session operation.
#[derive(Debug, Serialize)]
pub struct OperationResponse<T: Serialize> {
    pub ok: bool,
    /// State the session settled into.
    pub state: SessionState,
    pub guidance: Guidance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

/// HTTP status for a failed operation.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidState | ErrorKind::ConcurrentOperation | ErrorKind::Cancelled => {
            StatusCode::CONFLICT
        }
        ErrorKind::InvalidArgument => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::BackendRejected => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Transport | ErrorKind::HardwareDisconnected => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn respond<T: Serialize>(outcome: Outcome<T>) -> Response {
    match outcome {
        Ok(settled) => (
            StatusCode::OK,
            Json(OperationResponse {
                ok: true,
                state: settled.state,
                guidance: Guidance::None,
                value: Some(settled.value),
                error: None,
            }),
        )
            .into_response(),
        Err(failure) => (
            status_for(failure.kind),
            Json(OperationResponse::<T> {
                ok: false,
                state: failure.state,
                guidance: failure.guidance,
                value: None,
                error: Some(failure),
            }),
        )
            .into_response(),
    }
}

async fn find(state: &AppState, id: &str) -> Result<Arc<Checkout>, ApiError> {
    state.checkout(id).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Checkout not found: {}", id),
            }),
        )
    })
}

/// Checkout as returned by create and get.
#[derive(Debug, Serialize)]
pub struct CheckoutView {
    pub checkout_id: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: SessionSnapshot,
    /// Readers found by the last discovery.
    pub readers: Vec<Reader>,
}

impl CheckoutView {
    async fn of(checkout: &Checkout) -> Self {
        Self {
            checkout_id: checkout.id.clone(),
            created_at: checkout.created_at,
            snapshot: checkout.orchestrator.snapshot(),
            readers: checkout.orchestrator.readers().await,
        }
    }
}

/// POST /checkouts
pub async fn create_checkout(State(state): State<Arc<AppState>>) -> (StatusCode, Json<CheckoutView>) {
    let checkout = state.create_checkout().await;
    (StatusCode::CREATED, Json(CheckoutView::of(&checkout).await))
}

/// GET /checkouts/{id}
pub async fn get_checkout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CheckoutView>, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(Json(CheckoutView::of(&checkout).await))
}

/// DELETE /checkouts/{id}
///
/// Ends the checkout and forgets it. A checkout with an operation in flight
/// is kept and the request is refused with 409.
pub async fn delete_checkout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    let outcome = checkout.orchestrator.end_checkout().await;
    if outcome.is_ok() {
        state.remove_checkout(&id).await;
    }
    Ok(respond(outcome))
}

/// POST /checkouts/{id}/initialize
pub async fn initialize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(respond(checkout.orchestrator.initialize().await))
}

/// POST /checkouts/{id}/readers/discover
///
/// The body is optional; without one the configured defaults apply.
pub async fn discover_readers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    criteria: Option<Json<DiscoveryCriteria>>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    let criteria = criteria.map(|Json(c)| c).unwrap_or_default();
    Ok(respond(checkout.orchestrator.discover_readers(criteria).await))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub reader_id: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// POST /checkouts/{id}/readers/connect
pub async fn connect_reader(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ConnectRequest>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    let timeout = request.timeout_ms.map(Duration::from_millis);
    Ok(respond(
        checkout
            .orchestrator
            .connect_reader(&request.reader_id, timeout)
            .await,
    ))
}

/// POST /checkouts/{id}/readers/disconnect
pub async fn disconnect_reader(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(respond(checkout.orchestrator.disconnect_reader().await))
}

#[derive(Debug, Deserialize)]
pub struct CollectRequest {
    pub amount: u64,
    #[serde(flatten)]
    pub options: CollectOptions,
}

/// POST /checkouts/{id}/payments
///
/// Holds the request open until the cardholder is done or the collection is
/// cancelled from another request.
pub async fn collect_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<CollectRequest>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(respond(
        checkout
            .orchestrator
            .collect_payment(request.amount, request.options)
            .await,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureRequest {
    /// Partial capture amount. Omit to capture what was authorized.
    #[serde(default)]
    pub amount: Option<u64>,
}

/// POST /checkouts/{id}/payments/{intent_id}/capture
///
/// The body is optional; without one the full authorization is captured.
pub async fn capture_payment(
    State(state): State<Arc<AppState>>,
    Path((id, intent_id)): Path<(String, String)>,
    request: Option<Json<CaptureRequest>>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    let request = request.map(|Json(r)| r).unwrap_or_default();
    Ok(respond(
        checkout
            .orchestrator
            .capture_payment(&intent_id, request.amount)
            .await,
    ))
}

/// POST /checkouts/{id}/payments/{intent_id}/cancel
pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    Path((id, intent_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(respond(checkout.orchestrator.cancel_payment(&intent_id).await))
}

/// POST /checkouts/{id}/collection/cancel
pub async fn cancel_collection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(respond(checkout.orchestrator.cancel_collection().await))
}

/// POST /checkouts/{id}/abort
pub async fn abort_checkout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let checkout = find(&state, &id).await?;
    Ok(respond(checkout.orchestrator.abort_checkout().await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_for_error_kinds() {
        assert_eq!(status_for(ErrorKind::InvalidState), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::ConcurrentOperation), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Cancelled), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::InvalidArgument),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(ErrorKind::BackendRejected),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::HardwareDisconnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_collect_request_flattens_options() {
        let request: CollectRequest = serde_json::from_value(serde_json::json!({
            "amount": 2500,
            "currency": "usd",
            "capture_method": "manual",
            "booking_ref": "bk_42"
        }))
        .unwrap();

        assert_eq!(request.amount, 2500);
        assert_eq!(request.options.currency, "usd");
        assert_eq!(request.options.booking_ref.as_deref(), Some("bk_42"));
    }

    #[test]
    fn test_success_response_omits_error() {
        let response = OperationResponse {
            ok: true,
            state: SessionState::Ready,
            guidance: Guidance::None,
            value: Some(()),
            error: None,
        };
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["ok"], true);
        assert_eq!(json["state"], "ready");
        assert!(json.get("error").is_none());
    }
}
