//! Typed outcomes of façade operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CollectStep, ErrorKind, Guidance, OrchestratorError};
use crate::session::SessionState;

/// A successful operation and the state the session settled into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settled<T> {
    pub value: T,
    pub state: SessionState,
}

/// A failed operation, with enough context to pick the operator guidance.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{error} (session {state})")]
pub struct Failure {
    #[serde(skip)]
    pub error: OrchestratorError,
    pub kind: ErrorKind,
    pub message: String,
    /// State the session settled into after the failure.
    pub state: SessionState,
    pub guidance: Guidance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<CollectStep>,
}

impl Failure {
    pub fn new(error: OrchestratorError, state: SessionState) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            guidance: error.guidance(state),
            step: error.step(),
            state,
            error,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Result of every façade operation.
pub type Outcome<T> = Result<Settled<T>, Failure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_guidance() {
        let failure = Failure::new(
            OrchestratorError::HardwareDisconnected {
                operation: "collect_payment",
            }
            .in_step(CollectStep::CollectPaymentMethod, Some("pi_1".into())),
            SessionState::Ready,
        );

        assert_eq!(failure.kind, ErrorKind::HardwareDisconnected);
        assert_eq!(failure.guidance, Guidance::ReconnectReader);
        assert_eq!(failure.step, Some(CollectStep::CollectPaymentMethod));
        assert!(!failure.is_retryable());
    }

    #[test]
    fn test_failure_serialization() {
        let failure = Failure::new(
            OrchestratorError::Timeout {
                operation: "connect_reader",
                after_ms: Some(30_000),
            },
            SessionState::Ready,
        );
        let json = serde_json::to_value(&failure).unwrap();

        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["state"], "ready");
        assert_eq!(json["guidance"], "try_again");
        assert!(json.get("step").is_none());
        assert!(json["message"].as_str().unwrap().contains("connect_reader"));
    }
}
