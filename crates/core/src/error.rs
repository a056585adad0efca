//! Caller-facing error taxonomy.
//!
//! Every hardware and backend failure is converted into [`OrchestratorError`]
//! at the session boundary. "No readers found" is deliberately absent: it is a
//! discovery diagnostic, not an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::payment::IntentStatus;
use crate::reader::ReaderError;
use crate::session::SessionState;

/// Failure of a session operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    /// Network or hardware unreachable. Retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation illegal in the current state. A caller bug, not retryable.
    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Another mutating operation is in flight.
    #[error("{requested} rejected: {in_flight} already in progress")]
    ConcurrentOperation {
        requested: &'static str,
        in_flight: &'static str,
    },

    /// A bounded wait expired. Retryable.
    #[error("{operation} timed out")]
    Timeout {
        operation: &'static str,
        after_ms: Option<u64>,
    },

    /// The payment backend refused the request (declined card, bad tenant).
    #[error("Rejected by payment backend: {message}")]
    BackendRejected {
        code: Option<String>,
        message: String,
    },

    /// The reader went away mid-operation.
    #[error("Reader disconnected during {operation}")]
    HardwareDisconnected { operation: &'static str },

    /// The reader went away after the processor had already decided the
    /// payment. `status` is what the processor did, not what to retry.
    #[error("Reader disconnected after the payment was {status}")]
    DisconnectedAfterPayment { status: IntentStatus },

    /// Caller supplied an argument the session can never accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The collection was cancelled by the caller.
    #[error("Payment collection cancelled")]
    Cancelled,

    /// A payment collection failed at `step`.
    #[error("Collection failed at {step}: {source}")]
    Collect {
        step: CollectStep,
        /// Intent created before the failure, if step 1 succeeded.
        intent_id: Option<String>,
        #[source]
        source: Box<OrchestratorError>,
    },
}

/// Error kinds as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    InvalidState,
    ConcurrentOperation,
    Timeout,
    BackendRejected,
    HardwareDisconnected,
    InvalidArgument,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ConcurrentOperation => "concurrent_operation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::HardwareDisconnected => "hardware_disconnected",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// The three serialized steps of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectStep {
    /// Create the intent server-side. Failure never touches hardware.
    CreateIntent,
    /// Reader waits for the card.
    CollectPaymentMethod,
    /// Process the collected method against the intent.
    ConfirmPayment,
}

impl CollectStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectStep::CreateIntent => "create_intent",
            CollectStep::CollectPaymentMethod => "collect_payment_method",
            CollectStep::ConfirmPayment => "confirm_payment",
        }
    }
}

impl std::fmt::Display for CollectStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a presentation layer should tell the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guidance {
    None,
    TryAgain,
    ReconnectReader,
    ContactSupport,
    Wait,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Transport(_) => ErrorKind::Transport,
            OrchestratorError::InvalidState { .. } => ErrorKind::InvalidState,
            OrchestratorError::ConcurrentOperation { .. } => ErrorKind::ConcurrentOperation,
            OrchestratorError::Timeout { .. } => ErrorKind::Timeout,
            OrchestratorError::BackendRejected { .. } => ErrorKind::BackendRejected,
            OrchestratorError::HardwareDisconnected { .. }
            | OrchestratorError::DisconnectedAfterPayment { .. } => ErrorKind::HardwareDisconnected,
            OrchestratorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::Collect { source, .. } => source.kind(),
        }
    }

    /// Transport failures and timeouts may succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }

    /// Failed collection step, if this is a collection failure.
    pub fn step(&self) -> Option<CollectStep> {
        match self {
            OrchestratorError::Collect { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The error with collection context stripped.
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::Collect { source, .. } => source.root(),
            other => other,
        }
    }

    /// Guidance for the state the session settled into after this error.
    pub fn guidance(&self, settled: SessionState) -> Guidance {
        if settled == SessionState::Error {
            return Guidance::ContactSupport;
        }
        match self.kind() {
            ErrorKind::Transport
            | ErrorKind::Timeout
            | ErrorKind::BackendRejected
            | ErrorKind::Cancelled => Guidance::TryAgain,
            ErrorKind::HardwareDisconnected => Guidance::ReconnectReader,
            ErrorKind::InvalidState | ErrorKind::InvalidArgument => Guidance::ContactSupport,
            ErrorKind::ConcurrentOperation => Guidance::Wait,
        }
    }

    pub(crate) fn in_step(self, step: CollectStep, intent_id: Option<String>) -> Self {
        OrchestratorError::Collect {
            step,
            intent_id,
            source: Box::new(self),
        }
    }
}

impl From<BackendError> for OrchestratorError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transport(msg) => OrchestratorError::Transport(msg),
            BackendError::Timeout => OrchestratorError::Timeout {
                operation: "payment backend request",
                after_ms: None,
            },
            BackendError::Rejected { code, message, .. } => {
                OrchestratorError::BackendRejected { code, message }
            }
            // Unparseable answer: the call's outcome is unknown.
            BackendError::InvalidResponse(msg) => {
                OrchestratorError::Transport(format!("invalid backend response: {}", msg))
            }
        }
    }
}

impl OrchestratorError {
    /// Convert a reader failure, naming the operation it interrupted.
    pub(crate) fn from_reader(err: ReaderError, operation: &'static str) -> Self {
        match err {
            ReaderError::ConnectionFailed(msg) => OrchestratorError::Transport(msg),
            ReaderError::Internal(msg) => OrchestratorError::Transport(msg),
            ReaderError::Timeout => OrchestratorError::Timeout {
                operation,
                after_ms: None,
            },
            ReaderError::Declined { code, message } => {
                OrchestratorError::BackendRejected { code, message }
            }
            ReaderError::Disconnected => OrchestratorError::HardwareDisconnected { operation },
            ReaderError::Cancelled => OrchestratorError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let err: OrchestratorError = BackendError::Rejected {
            status: 402,
            code: Some("card_declined".into()),
            message: "declined".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::BackendRejected);
        assert!(!err.is_retryable());

        let err: OrchestratorError = BackendError::Timeout.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let err: OrchestratorError = BackendError::InvalidResponse("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_reader_error_mapping() {
        assert_eq!(
            OrchestratorError::from_reader(ReaderError::Disconnected, "collect_payment").kind(),
            ErrorKind::HardwareDisconnected
        );
        assert_eq!(
            OrchestratorError::from_reader(ReaderError::Cancelled, "collect_payment").kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(
            OrchestratorError::from_reader(
                ReaderError::ConnectionFailed("wifi".into()),
                "connect_reader"
            )
            .kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_collect_wrapper_delegates_kind() {
        let err = OrchestratorError::Transport("reset".into())
            .in_step(CollectStep::ConfirmPayment, Some("pi_1".into()));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.step(), Some(CollectStep::ConfirmPayment));
        assert!(err.is_retryable());
        assert!(matches!(err.root(), OrchestratorError::Transport(_)));
        assert!(err.to_string().contains("confirm_payment"));
    }

    #[test]
    fn test_guidance() {
        let disconnected = OrchestratorError::HardwareDisconnected {
            operation: "collect_payment",
        };
        assert_eq!(
            disconnected.guidance(SessionState::Ready),
            Guidance::ReconnectReader
        );

        let busy = OrchestratorError::ConcurrentOperation {
            requested: "collect_payment",
            in_flight: "collect_payment",
        };
        assert_eq!(busy.guidance(SessionState::Collecting), Guidance::Wait);

        let rejected = OrchestratorError::BackendRejected {
            code: None,
            message: "bad tenant".into(),
        };
        assert_eq!(rejected.guidance(SessionState::Error), Guidance::ContactSupport);
        assert_eq!(rejected.guidance(SessionState::Connected), Guidance::TryAgain);
    }

    #[test]
    fn test_disconnect_after_payment_names_outcome() {
        let err = OrchestratorError::DisconnectedAfterPayment {
            status: IntentStatus::Captured,
        }
        .in_step(CollectStep::ConfirmPayment, Some("pi_1".into()));

        assert_eq!(err.kind(), ErrorKind::HardwareDisconnected);
        assert!(!err.is_retryable());
        assert_eq!(err.guidance(SessionState::Ready), Guidance::ReconnectReader);
        assert!(err.to_string().contains("captured"));
    }
}
