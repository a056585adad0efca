//! Types for card reader hardware.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::backend::ConnectionToken;
use crate::payment::{CaptureMethod, IntentStatus};

/// Errors reported by the reader SDK.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReaderError {
    /// Reader or its network unreachable.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Reader operation timed out")]
    Timeout,

    /// Payment processing refused the card.
    #[error("Declined: {message}")]
    Declined {
        code: Option<String>,
        message: String,
    },

    /// No reader connected, or the reader went away mid-command.
    #[error("Reader disconnected")]
    Disconnected,

    /// The command was cancelled through `cancel_collect`.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Reader SDK error: {0}")]
    Internal(String),
}

/// Last-known reader availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    Online,
    Offline,
}

impl ReaderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderStatus::Online => "online",
            ReaderStatus::Offline => "offline",
        }
    }
}

/// A discovered card reader. Immutable snapshot from one discovery scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reader {
    /// Stable device identifier.
    pub id: String,
    /// Human-readable name.
    pub label: String,
    pub serial_number: String,
    pub device_type: String,
    pub status: ReaderStatus,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
}

impl Reader {
    pub fn is_online(&self) -> bool {
        self.status == ReaderStatus::Online
    }
}

/// Discovery filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub simulated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
}

/// Ask the connected reader to collect a payment method for an intent.
#[derive(Clone)]
pub struct CollectRequest {
    pub intent_id: String,
    pub client_secret: String,
    pub amount: u64,
    pub currency: String,
    pub capture_method: CaptureMethod,
}

impl std::fmt::Debug for CollectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectRequest")
            .field("intent_id", &self.intent_id)
            .field("client_secret", &"<redacted>")
            .field("amount", &self.amount)
            .field("currency", &self.currency)
            .field("capture_method", &self.capture_method)
            .finish()
    }
}

/// A payment method read from the card, pending confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedPaymentMethod {
    pub intent_id: String,
    pub payment_method_id: String,
    pub capture_method: CaptureMethod,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
}

/// Result of processing a collected payment method against its intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedPayment {
    pub intent_id: String,
    pub status: IntentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_captured: Option<u64>,
}

/// Notifications pushed by the reader SDK outside request/response calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderEvent {
    /// The connected reader went away without a disconnect request.
    UnexpectedDisconnect { reader_id: String },
    /// Prompt to show the cardholder ("Insert card", "Remove card").
    DisplayMessage { message: String },
}

/// Card reader hardware SDK.
#[async_trait]
pub trait ReaderSdk: Send + Sync {
    /// Driver name for logging.
    fn name(&self) -> &str;

    /// Scan for readers.
    async fn discover_readers(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<Vec<Reader>, ReaderError>;

    /// Open a session with one reader. Returns the reader as seen at connect time.
    async fn connect(&self, reader: &Reader, token: &ConnectionToken)
        -> Result<Reader, ReaderError>;

    /// Release the connected reader. Never fails; a no-op when nothing is connected.
    async fn disconnect(&self);

    /// Wait for the cardholder to present a card.
    async fn collect_payment_method(
        &self,
        request: &CollectRequest,
    ) -> Result<CollectedPaymentMethod, ReaderError>;

    /// Abort a pending `collect_payment_method`, which then fails with `Cancelled`.
    async fn cancel_collect(&self);

    /// Process the collected method against its intent.
    async fn confirm_payment(
        &self,
        method: &CollectedPaymentMethod,
    ) -> Result<ConfirmedPayment, ReaderError>;

    /// Subscribe to hardware notifications.
    fn subscribe(&self) -> broadcast::Receiver<ReaderEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_request_debug_redacts_secret() {
        let request = CollectRequest {
            intent_id: "pi_1".to_string(),
            client_secret: "pi_1_secret_xyz".to_string(),
            amount: 2500,
            currency: "usd".to_string(),
            capture_method: CaptureMethod::Automatic,
        };
        let debug = format!("{:?}", request);
        assert!(!debug.contains("secret_xyz"));
        assert!(debug.contains("pi_1"));
    }

    #[test]
    fn test_reader_event_serialization() {
        let event = ReaderEvent::UnexpectedDisconnect {
            reader_id: "tmr_1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "unexpected_disconnect");
        assert_eq!(json["reader_id"], "tmr_1");
    }
}
