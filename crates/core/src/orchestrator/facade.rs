//! The caller-facing payment orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::backend::{BackendTokenSource, ConnectionTokenSource, PaymentBackend};
use crate::config::TerminalConfig;
use crate::events::SessionEvent;
use crate::payment::{CollectOptions, PaymentIntent};
use crate::reader::{Reader, ReaderSdk};
use crate::registry::{DiscoveryDiagnostic, DiscoveryReport};
use crate::session::{DiscoveryCriteria, SessionSnapshot, SessionState, TerminalSession};

use super::types::Outcome;

/// Intent-level payment operations for one checkout.
///
/// Owns the checkout's [`TerminalSession`]. Every result carries the state
/// the operation itself left the session in, read under the session lock.
/// Dropping the orchestrator drops the session; call
/// [`end_checkout`](Self::end_checkout) first to release the reader and void
/// any open authorization.
pub struct PaymentOrchestrator {
    session: TerminalSession,
}

impl PaymentOrchestrator {
    /// Build an orchestrator that mints connection tokens through `backend`.
    pub fn new(
        config: &TerminalConfig,
        sdk: Arc<dyn ReaderSdk>,
        backend: Arc<dyn PaymentBackend>,
    ) -> Self {
        let tokens = Arc::new(BackendTokenSource::new(Arc::clone(&backend)));
        Self::with_token_source(config, sdk, backend, tokens)
    }

    pub fn with_token_source(
        config: &TerminalConfig,
        sdk: Arc<dyn ReaderSdk>,
        backend: Arc<dyn PaymentBackend>,
        tokens: Arc<dyn ConnectionTokenSource>,
    ) -> Self {
        debug!(driver = sdk.name(), backend = backend.name(), "Creating payment orchestrator");
        Self {
            session: TerminalSession::new(config.clone(), sdk, backend, tokens),
        }
    }

    pub async fn initialize(&self) -> Outcome<()> {
        self.session.initialize().await
    }

    /// Scan for readers. Zero readers is a success with a `no_readers` diagnostic.
    pub async fn discover_readers(&self, criteria: DiscoveryCriteria) -> Outcome<DiscoveryReport> {
        self.session.discover_readers(criteria).await
    }

    pub async fn connect_reader(
        &self,
        reader_id: &str,
        timeout: Option<Duration>,
    ) -> Outcome<Reader> {
        self.session.connect_reader(reader_id, timeout).await
    }

    pub async fn disconnect_reader(&self) -> Outcome<()> {
        self.session.disconnect_reader().await
    }

    /// Create, collect and confirm a payment. Returns the intent as it ended.
    pub async fn collect_payment(
        &self,
        amount: u64,
        options: CollectOptions,
    ) -> Outcome<PaymentIntent> {
        self.session.collect_payment(amount, options).await
    }

    /// Capture an authorized intent, fully or for a smaller `amount`.
    pub async fn capture_payment(
        &self,
        intent_id: &str,
        amount: Option<u64>,
    ) -> Outcome<PaymentIntent> {
        self.session.capture_payment(intent_id, amount).await
    }

    /// Cancel an intent. Idempotent: `None` when there was nothing to cancel.
    pub async fn cancel_payment(&self, intent_id: &str) -> Outcome<Option<PaymentIntent>> {
        self.session.cancel_payment(intent_id).await
    }

    /// Cancel the collection in flight, if any.
    pub async fn cancel_collection(&self) -> Outcome<Option<PaymentIntent>> {
        self.session.cancel_collection().await
    }

    pub async fn abort_checkout(&self) -> Outcome<()> {
        self.session.abort_checkout().await
    }

    pub async fn end_checkout(&self) -> Outcome<()> {
        self.session.end_checkout().await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe_events()
    }

    pub async fn readers(&self) -> Vec<Reader> {
        self.session.readers().await
    }

    pub async fn last_discovery_diagnostic(&self) -> Option<DiscoveryDiagnostic> {
        self.session.last_discovery_diagnostic().await
    }
}
