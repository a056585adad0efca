//! Payment intent types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether authorization and settlement happen in one step or two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Settled as part of confirmation.
    #[default]
    Automatic,
    /// Authorized on confirmation, settled by an explicit capture.
    Manual,
}

impl CaptureMethod {
    /// Returns the string representation for API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Automatic => "automatic",
            CaptureMethod::Manual => "manual",
        }
    }
}

/// Lifecycle status of a payment intent.
///
/// Statuses only move forward: `created -> collecting -> authorized -> captured`,
/// with `failed` and `cancelled` reachable from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Created,
    Collecting,
    Authorized,
    Captured,
    Cancelled,
    Failed,
}

impl IntentStatus {
    /// Returns the string representation for API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Created => "created",
            IntentStatus::Collecting => "collecting",
            IntentStatus::Authorized => "authorized",
            IntentStatus::Captured => "captured",
            IntentStatus::Cancelled => "cancelled",
            IntentStatus::Failed => "failed",
        }
    }

    /// Captured, cancelled and failed intents are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Captured | IntentStatus::Cancelled | IntentStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            IntentStatus::Created => 0,
            IntentStatus::Collecting => 1,
            IntentStatus::Authorized => 2,
            IntentStatus::Captured | IntentStatus::Cancelled | IntentStatus::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            IntentStatus::Failed | IntentStatus::Cancelled => true,
            // Captured is reachable straight from collecting (automatic capture).
            IntentStatus::Captured => {
                matches!(self, IntentStatus::Collecting | IntentStatus::Authorized)
            }
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected attempt to move an intent backwards or out of a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payment intent {intent_id} cannot move from {from} to {to}")]
pub struct IntentTransitionError {
    pub intent_id: String,
    pub from: IntentStatus,
    pub to: IntentStatus,
}

/// One attempted charge.
///
/// The payment backend is the system of record; this is the session's cached copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Backend identifier.
    pub id: String,
    /// Amount in minor currency units.
    pub amount: u64,
    /// Lowercase ISO 4217 code.
    pub currency: String,
    pub capture_method: CaptureMethod,
    pub status: IntentStatus,
    /// Caller supplied correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_ref: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Amount settled by capture, once captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_captured: Option<u64>,
    /// Why the intent failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Secret handed to the reader for collection. Never serialized.
    #[serde(skip)]
    pub client_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Move the intent forward, refusing backward or post-terminal moves.
    pub fn transition(&mut self, next: IntentStatus) -> Result<(), IntentTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(IntentTransitionError {
                intent_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the intent failed. No-op if it already reached a terminal status.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.transition(IntentStatus::Failed).is_ok() {
            self.failure_reason = Some(reason.into());
        }
    }

    /// Whether the intent still occupies the session's single collection slot.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Caller options for a payment collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectOptions {
    /// ISO 4217 currency code, any case.
    pub currency: String,
    #[serde(default)]
    pub capture_method: CaptureMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_ref: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Forwarded to the backend so a retry after an ambiguous network error
    /// does not create a duplicate intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl CollectOptions {
    /// Options for an automatic-capture collection in `currency`.
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            ..Default::default()
        }
    }

    /// Set the capture method.
    pub fn with_capture_method(mut self, method: CaptureMethod) -> Self {
        self.capture_method = method;
        self
    }

    /// Set the booking correlation id.
    pub fn with_booking_ref(mut self, booking_ref: impl Into<String>) -> Self {
        self.booking_ref = Some(booking_ref.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Normalize a currency code to lowercase, rejecting anything but three ASCII letters.
pub fn normalize_currency(code: &str) -> Option<String> {
    let trimmed = code.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(trimmed.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(status: IntentStatus) -> PaymentIntent {
        let now = Utc::now();
        PaymentIntent {
            id: "pi_1".to_string(),
            amount: 1000,
            currency: "usd".to_string(),
            capture_method: CaptureMethod::Manual,
            status,
            booking_ref: None,
            metadata: HashMap::new(),
            amount_captured: None,
            failure_reason: None,
            client_secret: Some("pi_1_secret".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_forward_transitions() {
        let mut pi = intent(IntentStatus::Created);
        pi.transition(IntentStatus::Collecting).unwrap();
        pi.transition(IntentStatus::Authorized).unwrap();
        pi.transition(IntentStatus::Captured).unwrap();
        assert_eq!(pi.status, IntentStatus::Captured);
    }

    #[test]
    fn test_automatic_capture_skips_authorized() {
        let mut pi = intent(IntentStatus::Collecting);
        assert!(pi.transition(IntentStatus::Captured).is_ok());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut pi = intent(IntentStatus::Authorized);
        let err = pi.transition(IntentStatus::Collecting).unwrap_err();
        assert_eq!(err.from, IntentStatus::Authorized);
        assert_eq!(err.to, IntentStatus::Collecting);
        assert_eq!(pi.status, IntentStatus::Authorized);
    }

    #[test]
    fn test_created_cannot_jump_to_captured() {
        let pi = intent(IntentStatus::Created);
        assert!(!pi.status.can_transition_to(IntentStatus::Captured));
        assert!(!pi.status.can_transition_to(IntentStatus::Authorized));
    }

    #[test]
    fn test_terminal_intents_are_immutable() {
        for status in [
            IntentStatus::Captured,
            IntentStatus::Cancelled,
            IntentStatus::Failed,
        ] {
            let mut pi = intent(status);
            assert!(pi.transition(IntentStatus::Failed).is_err());
            assert!(pi.transition(IntentStatus::Cancelled).is_err());
            assert!(!pi.is_active());
        }
    }

    #[test]
    fn test_fail_records_reason_once() {
        let mut pi = intent(IntentStatus::Collecting);
        pi.fail("card removed");
        assert_eq!(pi.status, IntentStatus::Failed);
        assert_eq!(pi.failure_reason.as_deref(), Some("card removed"));

        pi.fail("second reason");
        assert_eq!(pi.failure_reason.as_deref(), Some("card removed"));
    }

    #[test]
    fn test_client_secret_not_serialized() {
        let json = serde_json::to_string(&intent(IntentStatus::Created)).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"status\":\"created\""));
        assert!(json.contains("\"capture_method\":\"manual\""));
    }

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency("USD"), Some("usd".to_string()));
        assert_eq!(normalize_currency(" eur "), Some("eur".to_string()));
        assert_eq!(normalize_currency("us"), None);
        assert_eq!(normalize_currency("us1"), None);
        assert_eq!(normalize_currency(""), None);
    }

    #[test]
    fn test_collect_options_builder() {
        let opts = CollectOptions::new("usd")
            .with_capture_method(CaptureMethod::Manual)
            .with_booking_ref("BK-42")
            .with_metadata("vehicle", "compact")
            .with_idempotency_key("idem-1");

        assert_eq!(opts.capture_method, CaptureMethod::Manual);
        assert_eq!(opts.booking_ref.as_deref(), Some("BK-42"));
        assert_eq!(opts.metadata.get("vehicle").map(String::as_str), Some("compact"));
        assert_eq!(opts.idempotency_key.as_deref(), Some("idem-1"));
    }
}
