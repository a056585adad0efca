//! Types for payment backend operations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payment::{CaptureMethod, IntentStatus};

/// Errors that can occur during payment backend calls.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Network failure or a 5xx answer; the outcome of the call is unknown.
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Request timeout")]
    Timeout,

    /// Business-logic refusal (declined card, invalid tenant, bad request).
    #[error("Rejected ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The answer could not be normalized into the canonical schema.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BackendError::Transport(_) => "transport",
            BackendError::Timeout => "timeout",
            BackendError::Rejected { .. } => "rejected",
            BackendError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Short-lived credential authorizing one reader connection.
///
/// Never persisted; a fresh one is fetched for every connect attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionToken {
    pub secret: String,
    pub issued_at: DateTime<Utc>,
}

impl ConnectionToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issued_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("secret", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Request to create a payment intent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    pub amount: u64,
    pub currency: String,
    pub capture_method: CaptureMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_ref: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Sent as a header, not in the body.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

/// Request to capture an authorized intent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureRequest {
    /// Partial capture amount; `None` captures the full authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

/// Canonical backend view of an intent, normalized at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendIntent {
    pub id: String,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub status: IntentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_captured: Option<u64>,
}

/// Server-side payment API: system of record for payment intents.
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    /// Backend name for logging/metrics.
    fn name(&self) -> &str;

    /// Mint a connection token for the configured tenant.
    async fn create_connection_token(&self) -> Result<ConnectionToken, BackendError>;

    /// Create a payment intent.
    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<BackendIntent, BackendError>;

    /// Capture an authorized intent.
    async fn capture_payment_intent(
        &self,
        intent_id: &str,
        request: &CaptureRequest,
    ) -> Result<BackendIntent, BackendError>;

    /// Cancel an intent, voiding any pending authorization.
    async fn cancel_payment_intent(
        &self,
        intent_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<BackendIntent, BackendError>;
}

/// Supplies connection tokens for hardware sessions.
#[async_trait]
pub trait ConnectionTokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<ConnectionToken, BackendError>;
}
