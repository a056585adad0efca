//! Terminal session state and its observable snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CollectStep, ErrorKind, OrchestratorError};
use crate::payment::PaymentIntent;
use crate::reader::Reader;
use crate::registry::DiscoveryDiagnostic;

/// Terminal session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Discovering,
    Connecting,
    Connected,
    Collecting,
    Authorized,
    Capturing,
    Completed,
    Cancelled,
    Error,
}

impl SessionState {
    pub const ALL: [SessionState; 12] = [
        SessionState::Uninitialized,
        SessionState::Initializing,
        SessionState::Ready,
        SessionState::Discovering,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::Collecting,
        SessionState::Authorized,
        SessionState::Capturing,
        SessionState::Completed,
        SessionState::Cancelled,
        SessionState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Discovering => "discovering",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Collecting => "collecting",
            SessionState::Authorized => "authorized",
            SessionState::Capturing => "capturing",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Error => "error",
        }
    }

    /// Terminal states release the reader and accept only a fresh start or teardown.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Error
        )
    }

    /// States in which a connected reader may be held.
    pub fn holds_reader(&self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::Collecting
                | SessionState::Authorized
                | SessionState::Capturing
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutating session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    DiscoverReaders,
    ConnectReader,
    DisconnectReader,
    CollectPayment,
    CapturePayment,
    CancelPayment,
    AbortCheckout,
    EndCheckout,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::DiscoverReaders => "discover_readers",
            Operation::ConnectReader => "connect_reader",
            Operation::DisconnectReader => "disconnect_reader",
            Operation::CollectPayment => "collect_payment",
            Operation::CapturePayment => "capture_payment",
            Operation::CancelPayment => "cancel_payment",
            Operation::AbortCheckout => "abort_checkout",
            Operation::EndCheckout => "end_checkout",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller overrides for a discovery scan. Unset fields fall back to config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCriteria {
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Serializable view of the last error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<CollectStep>,
}

impl From<&OrchestratorError> for ErrorSummary {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            step: err.step(),
        }
    }
}

/// Read-only view of a session, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub connected_reader: Option<Reader>,
    pub active_payment_intent: Option<PaymentIntent>,
    /// Most recently settled intent (captured, cancelled or failed).
    pub last_payment_intent: Option<PaymentIntent>,
    pub last_error: Option<ErrorSummary>,
    pub discovery: Option<DiscoveryDiagnostic>,
    pub in_flight: Option<Operation>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            state: SessionState::Uninitialized,
            connected_reader: None,
            active_payment_intent: None,
            last_payment_intent: None,
            last_error: None,
            discovery: None,
            in_flight: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_holding_states() {
        let holding: Vec<_> = [
            SessionState::Uninitialized,
            SessionState::Initializing,
            SessionState::Ready,
            SessionState::Discovering,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Collecting,
            SessionState::Authorized,
            SessionState::Capturing,
            SessionState::Completed,
            SessionState::Cancelled,
            SessionState::Error,
        ]
        .into_iter()
        .filter(SessionState::holds_reader)
        .collect();

        assert_eq!(
            holding,
            vec![
                SessionState::Connected,
                SessionState::Collecting,
                SessionState::Authorized,
                SessionState::Capturing
            ]
        );
    }

    #[test]
    fn test_terminal_states_hold_no_reader() {
        for state in [
            SessionState::Completed,
            SessionState::Cancelled,
            SessionState::Error,
        ] {
            assert!(state.is_terminal());
            assert!(!state.holds_reader());
        }
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionState::Collecting).unwrap(),
            "\"collecting\""
        );
        assert_eq!(SessionState::Authorized.to_string(), "authorized");
    }
}
