pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod payment;
pub mod reader;
pub mod registry;
pub mod session;
pub mod testing;

pub use backend::{
    BackendError, BackendIntent, BackendTokenSource, ConnectionToken, ConnectionTokenSource,
    HttpPaymentBackend, PaymentBackend,
};
pub use config::{
    load_config, load_config_from_str, validate_config, BackendConfig, Config, ConfigError,
    ReaderDriver, SanitizedConfig, ServerConfig, TerminalConfig,
};
pub use error::{CollectStep, ErrorKind, Guidance, OrchestratorError};
pub use events::{EventBus, SessionEvent};
pub use orchestrator::{Failure, Outcome, PaymentOrchestrator, Settled};
pub use payment::{CaptureMethod, CollectOptions, IntentStatus, PaymentIntent};
pub use reader::{Reader, ReaderError, ReaderEvent, ReaderSdk, ReaderStatus, SimulatedReaderSdk};
pub use registry::{DiscoveryDiagnostic, DiscoveryReport, DiscoveryStatus, ReaderRegistry};
pub use session::{DiscoveryCriteria, Operation, SessionSnapshot, SessionState, TerminalSession};
