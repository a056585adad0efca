//! Testing utilities and mock implementations.
//!
//! Mocks for the two external seams, reader hardware and the payment backend,
//! so sessions can be driven end to end without either.
//!
//! # Example
//!
//! ```rust,ignore
//! use tapline_core::testing::{fixtures, MockPaymentBackend, MockReaderSdk};
//!
//! let sdk = Arc::new(MockReaderSdk::new());
//! let backend = Arc::new(MockPaymentBackend::new());
//! let orchestrator = PaymentOrchestrator::new(&fixtures::terminal_config(), sdk.clone(), backend.clone());
//!
//! sdk.fail_next_collect(ReaderError::Timeout).await;
//! ```

mod mock_payment_backend;
mod mock_reader_sdk;

pub use mock_payment_backend::{MockPaymentBackend, RecordedCancel, RecordedCapture};
pub use mock_reader_sdk::MockReaderSdk;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::Utc;

    use crate::backend::ConnectionToken;
    use crate::config::TerminalConfig;
    use crate::reader::{Reader, ReaderStatus};

    /// Id of the reader a fresh `MockReaderSdk` discovers.
    pub const READER_ID: &str = "tmr_mock_001";

    /// An online reader.
    pub fn reader(id: &str) -> Reader {
        Reader {
            id: id.to_string(),
            label: format!("Front desk {}", id),
            serial_number: format!("SN-{}", id.to_uppercase()),
            device_type: "mock_reader".to_string(),
            status: ReaderStatus::Online,
            last_seen_at: Utc::now(),
            location_id: Some("tml_front_desk".to_string()),
        }
    }

    pub fn offline_reader(id: &str) -> Reader {
        Reader {
            status: ReaderStatus::Offline,
            ..reader(id)
        }
    }

    pub fn token() -> ConnectionToken {
        ConnectionToken::new("pst_test_fixture")
    }

    /// Simulated-mode config with short timeouts for tests.
    pub fn terminal_config() -> TerminalConfig {
        TerminalConfig {
            simulated: true,
            discovery_timeout_ms: 1_000,
            connect_timeout_ms: 1_000,
            cancel_wait_ms: 1_000,
            ..TerminalConfig::default()
        }
    }
}
