//! The terminal session state machine.
//!
//! All state lives behind one lock. An operation validates and marks itself
//! in flight under the lock, releases it for hardware or backend I/O, then
//! re-acquires it to apply the result. A second mutating call arriving while
//! one is in flight is rejected, never queued. The only exception is cancel,
//! which may preempt the card-wait step of a collection.
//!
//! Unexpected reader disconnects arrive on the SDK's event channel and bump
//! the session epoch; an operation that observes a changed epoch when it
//! returns reports `HardwareDisconnected` and leaves the newer state alone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendError, CaptureRequest, ConnectionTokenSource, CreateIntentRequest, PaymentBackend,
};
use crate::config::TerminalConfig;
use crate::error::{CollectStep, ErrorKind, OrchestratorError};
use crate::events::{EventBus, SessionEvent};
use crate::metrics;
use crate::orchestrator::{Failure, Outcome, Settled};
use crate::payment::{normalize_currency, CaptureMethod, CollectOptions, IntentStatus, PaymentIntent};
use crate::reader::{CollectRequest, ConfirmedPayment, DiscoveryRequest, Reader, ReaderEvent, ReaderSdk};
use crate::registry::{DiscoveryDiagnostic, DiscoveryReport, DiscoveryStatus, ReaderRegistry};

use super::types::{DiscoveryCriteria, ErrorSummary, Operation, SessionSnapshot, SessionState};

/// One checkout's exclusive session with at most one reader.
///
/// Must be created inside a Tokio runtime: construction spawns the task that
/// listens for hardware events. Dropping the session stops that task.
pub struct TerminalSession {
    shared: Arc<Shared>,
    listener: JoinHandle<()>,
}

struct Shared {
    config: TerminalConfig,
    sdk: Arc<dyn ReaderSdk>,
    backend: Arc<dyn PaymentBackend>,
    tokens: Arc<dyn ConnectionTokenSource>,
    registry: ReaderRegistry,
    inner: RwLock<Inner>,
    events: EventBus,
    snapshot: watch::Sender<SessionSnapshot>,
}

struct Inner {
    state: SessionState,
    connected_reader: Option<Reader>,
    active_intent: Option<PaymentIntent>,
    /// Caller idempotency key of the active intent.
    active_key: Option<String>,
    last_intent: Option<PaymentIntent>,
    /// Terminal intents by id, for idempotent cancels.
    settled: HashMap<String, PaymentIntent>,
    last_error: Option<OrchestratorError>,
    discovery: Option<DiscoveryDiagnostic>,
    in_flight: Option<Operation>,
    cancel_requested: bool,
    /// Bumped whenever the reader is lost behind an in-flight operation's back.
    epoch: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            connected_reader: None,
            active_intent: None,
            active_key: None,
            last_intent: None,
            settled: HashMap::new(),
            last_error: None,
            discovery: None,
            in_flight: None,
            cancel_requested: false,
            epoch: 0,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            connected_reader: self.connected_reader.clone(),
            active_payment_intent: self.active_intent.clone(),
            last_payment_intent: self.last_intent.clone(),
            last_error: self.last_error.as_ref().map(ErrorSummary::from),
            discovery: self.discovery.clone(),
            in_flight: self.in_flight,
            updated_at: Utc::now(),
        }
    }
}

fn derived_key(key: &Option<String>, suffix: &str) -> Option<String> {
    key.as_ref().map(|k| format!("{}:{}", k, suffix))
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, to: SessionState) {
        let from = inner.state;
        // Invariant: a reader is only held in reader-holding states.
        if !to.holds_reader() {
            inner.connected_reader = None;
        }
        inner.state = to;
        if from != to {
            info!(from = %from, to = %to, "Session state changed");
            self.events.state_changed(from, to);
        }
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot.send_replace(inner.snapshot());
    }

    /// Refuse `op` without touching the session.
    fn reject(&self, inner: &Inner, op: Operation, err: OrchestratorError) -> Failure {
        debug!(operation = op.as_str(), error = %err, "Operation rejected");
        metrics::REJECTED_OPERATIONS
            .with_label_values(&[op.as_str(), err.kind().as_str()])
            .inc();
        Failure::new(err, inner.state)
    }

    /// Busy check first, then state. Mutates nothing.
    fn admit(&self, inner: &Inner, op: Operation, allowed: &[SessionState]) -> Result<(), Failure> {
        if let Some(busy) = inner.in_flight {
            return Err(self.reject(
                inner,
                op,
                OrchestratorError::ConcurrentOperation {
                    requested: op.as_str(),
                    in_flight: busy.as_str(),
                },
            ));
        }
        if !allowed.contains(&inner.state) {
            return Err(self.reject(
                inner,
                op,
                OrchestratorError::InvalidState {
                    operation: op.as_str(),
                    state: inner.state,
                },
            ));
        }
        Ok(())
    }

    /// Mark `op` in flight. Returns the pre-call state and the current epoch.
    fn start(
        &self,
        inner: &mut Inner,
        op: Operation,
        transitional: Option<SessionState>,
    ) -> (SessionState, u64) {
        let prior = inner.state;
        inner.in_flight = Some(op);
        if let Some(state) = transitional {
            self.set_state(inner, state);
        }
        self.publish(inner);
        (prior, inner.epoch)
    }

    fn finish(&self, inner: &mut Inner, error: Option<&OrchestratorError>) {
        inner.in_flight = None;
        inner.last_error = error.cloned();
        self.publish(inner);
    }

    /// Finish with `value`, reporting the state the operation left behind.
    fn succeed<T>(&self, inner: &mut Inner, value: T) -> Outcome<T> {
        self.finish(inner, None);
        Ok(Settled {
            value,
            state: inner.state,
        })
    }

    fn fail(&self, inner: &mut Inner, err: OrchestratorError) -> Failure {
        self.finish(inner, Some(&err));
        Failure::new(err, inner.state)
    }

    /// Move a terminal intent out of the active slot.
    fn settle(&self, inner: &mut Inner, intent: PaymentIntent) {
        debug_assert!(intent.status.is_terminal());
        self.events.intent_updated(&intent);
        inner.settled.insert(intent.id.clone(), intent.clone());
        inner.last_intent = Some(intent);
        inner.active_intent = None;
        inner.active_key = None;
    }

    /// Release the held reader. `expected` is false when the hardware already dropped it.
    async fn release_reader(&self, inner: &mut Inner, expected: bool) {
        if let Some(reader) = inner.connected_reader.take() {
            if expected {
                self.sdk.disconnect().await;
            }
            self.events.reader_disconnected(&reader.id, expected);
        }
    }

    /// Best-effort server-side cancel. True when the backend reports it cancelled.
    async fn void_intent(&self, intent_id: &str, key: Option<String>) -> bool {
        match self
            .backend
            .cancel_payment_intent(intent_id, key.as_deref())
            .await
        {
            Ok(intent) => {
                info!(intent_id, status = %intent.status, "Voided payment intent");
                intent.status == IntentStatus::Cancelled
            }
            Err(e) => {
                warn!(intent_id, error = %e, "Failed to void payment intent");
                false
            }
        }
    }

    async fn on_unexpected_disconnect(self: &Arc<Self>, reader_id: &str) {
        let mut inner = self.inner.write().await;
        let held = inner
            .connected_reader
            .as_ref()
            .is_some_and(|r| r.id == reader_id);
        if !held {
            debug!(reader_id, "Ignoring disconnect of a reader this session does not hold");
            return;
        }

        warn!(reader_id, state = %inner.state, "Reader disconnected unexpectedly");
        metrics::UNEXPECTED_DISCONNECTS.inc();
        inner.connected_reader = None;
        self.events.reader_disconnected(reader_id, false);

        let interrupted_collect = inner.state == SessionState::Collecting;
        if inner.state != SessionState::Capturing {
            let mut void = None;
            if let Some(mut intent) = inner.active_intent.take() {
                if intent.status == IntentStatus::Authorized {
                    void = Some((intent.id.clone(), derived_key(&inner.active_key, "cancel")));
                }
                intent.fail("reader disconnected");
                self.settle(&mut inner, intent);
            }
            inner.epoch += 1;
            inner.last_error = Some(OrchestratorError::HardwareDisconnected {
                operation: "reader session",
            });
            self.set_state(&mut inner, SessionState::Ready);

            if let Some((intent_id, key)) = void {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    shared.void_intent(&intent_id, key).await;
                });
            }
        }
        // Capturing: the capture call needs no reader and settles the session itself.

        self.publish(&inner);
        drop(inner);

        if interrupted_collect {
            self.sdk.cancel_collect().await;
        }
    }
}

async fn listen(shared: Weak<Shared>, mut events: broadcast::Receiver<ReaderEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Reader event listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            ReaderEvent::UnexpectedDisconnect { reader_id } => {
                shared.on_unexpected_disconnect(&reader_id).await
            }
            ReaderEvent::DisplayMessage { message } => shared
                .events
                .publish(SessionEvent::ReaderDisplayMessage { message }),
        }
    }
}

impl TerminalSession {
    pub fn new(
        config: TerminalConfig,
        sdk: Arc<dyn ReaderSdk>,
        backend: Arc<dyn PaymentBackend>,
        tokens: Arc<dyn ConnectionTokenSource>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::initial());
        let reader_events = sdk.subscribe();
        let registry = ReaderRegistry::new(Arc::clone(&sdk));
        let events = EventBus::new(config.event_capacity);

        let shared = Arc::new(Shared {
            config,
            sdk,
            backend,
            tokens,
            registry,
            inner: RwLock::new(Inner::new()),
            events,
            snapshot,
        });
        let listener = tokio::spawn(listen(Arc::downgrade(&shared), reader_events));

        Self { shared, listener }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.snapshot.borrow().state
    }

    /// Snapshot stream for UI binding.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn readers(&self) -> Vec<Reader> {
        self.shared.registry.readers().await
    }

    pub async fn last_discovery_diagnostic(&self) -> Option<DiscoveryDiagnostic> {
        self.shared.registry.last_discovery_diagnostic().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Verify the backend can mint connection tokens. `Uninitialized | Error -> Ready`.
    ///
    /// A backend rejection (bad tenant or credentials) lands in `Error`;
    /// transient failures revert to the pre-call state.
    pub async fn initialize(&self) -> Outcome<()> {
        let op = Operation::Initialize;
        let s = &self.shared;
        let prior = {
            let mut inner = s.inner.write().await;
            s.admit(
                &inner,
                op,
                &[SessionState::Uninitialized, SessionState::Error],
            )?;
            s.start(&mut inner, op, Some(SessionState::Initializing)).0
        };

        info!("Initializing terminal session");
        let result = s.tokens.fetch_token().await;

        let mut inner = s.inner.write().await;
        match result {
            Ok(_) => {
                s.set_state(&mut inner, SessionState::Ready);
                s.succeed(&mut inner, ())
            }
            Err(e) => {
                let fatal = matches!(e, BackendError::Rejected { .. });
                let err = OrchestratorError::from(e);
                error!(error = %err, "Session initialization failed");
                s.set_state(
                    &mut inner,
                    if fatal { SessionState::Error } else { prior },
                );
                Err(s.fail(&mut inner, err))
            }
        }
    }

    /// Scan for readers. The simulated flag is fixed by the session config.
    pub async fn discover_readers(
        &self,
        criteria: DiscoveryCriteria,
    ) -> Outcome<DiscoveryReport> {
        let op = Operation::DiscoverReaders;
        let s = &self.shared;
        {
            let mut inner = s.inner.write().await;
            s.admit(&inner, op, &[SessionState::Ready])?;
            s.start(&mut inner, op, Some(SessionState::Discovering));
        }

        let request = DiscoveryRequest {
            simulated: s.config.simulated,
            location_id: criteria.location_id.or_else(|| s.config.location_id.clone()),
        };
        let timeout = Duration::from_millis(
            criteria
                .timeout_ms
                .unwrap_or(s.config.discovery_timeout_ms),
        );
        let result = s.registry.discover(&request, timeout).await;
        let diagnostic = s.registry.last_discovery_diagnostic().await;

        let mut inner = s.inner.write().await;
        inner.discovery = diagnostic;
        s.set_state(&mut inner, SessionState::Ready);
        match result {
            Ok(report) => {
                s.events.publish(SessionEvent::ReadersDiscovered {
                    count: report.readers.len(),
                    diagnostic: report.diagnostic.status,
                });
                s.succeed(&mut inner, report)
            }
            Err(err) => {
                s.events.publish(SessionEvent::ReadersDiscovered {
                    count: 0,
                    diagnostic: DiscoveryStatus::Error,
                });
                Err(s.fail(&mut inner, err))
            }
        }
    }

    /// Connect to a reader from the latest scan. `Ready -> Connected`.
    ///
    /// A fresh connection token is fetched for every attempt. On timeout the
    /// half-open connection is torn down and the session returns to `Ready`.
    pub async fn connect_reader(
        &self,
        reader_id: &str,
        timeout: Option<Duration>,
    ) -> Outcome<Reader> {
        let op = Operation::ConnectReader;
        let s = &self.shared;
        let reader = {
            let mut inner = s.inner.write().await;
            s.admit(&inner, op, &[SessionState::Ready])?;
            let reader = match s.registry.find(reader_id).await {
                Some(reader) if reader.is_online() => reader,
                Some(_) => {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidArgument(format!(
                            "reader {} is offline",
                            reader_id
                        )),
                    ))
                }
                None => {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidArgument(format!(
                            "reader {} is not in the latest discovery results",
                            reader_id
                        )),
                    ))
                }
            };
            s.start(&mut inner, op, Some(SessionState::Connecting));
            reader
        };

        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(s.config.connect_timeout_ms));
        info!(reader_id, label = %reader.label, "Connecting to reader");

        let attempt = async {
            let token = s
                .tokens
                .fetch_token()
                .await
                .map_err(OrchestratorError::from)?;
            s.sdk
                .connect(&reader, &token)
                .await
                .map_err(|e| OrchestratorError::from_reader(e, "connect_reader"))
        };
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(reader_id, timeout_ms = timeout.as_millis() as u64, "Reader connect timed out");
                s.sdk.disconnect().await;
                Err(OrchestratorError::Timeout {
                    operation: "connect_reader",
                    after_ms: Some(timeout.as_millis() as u64),
                })
            }
        };

        let mut inner = s.inner.write().await;
        match result {
            Ok(connected) => {
                inner.connected_reader = Some(connected.clone());
                s.set_state(&mut inner, SessionState::Connected);
                s.events.publish(SessionEvent::ReaderConnected {
                    reader: connected.clone(),
                });
                metrics::READER_CONNECTS
                    .with_label_values(&["connected"])
                    .inc();
                s.succeed(&mut inner, connected)
            }
            Err(err) => {
                let label = if err.kind() == ErrorKind::Timeout {
                    "timeout"
                } else {
                    "failed"
                };
                metrics::READER_CONNECTS.with_label_values(&[label]).inc();
                s.set_state(&mut inner, SessionState::Ready);
                Err(s.fail(&mut inner, err))
            }
        }
    }

    /// Release the reader. No-op when none is held.
    ///
    /// An authorized but uncaptured intent is marked failed and its hold is
    /// voided server-side.
    pub async fn disconnect_reader(&self) -> Outcome<()> {
        let op = Operation::DisconnectReader;
        let s = &self.shared;
        let (reader, void) = {
            let mut inner = s.inner.write().await;
            if let Some(busy) = inner.in_flight {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::ConcurrentOperation {
                        requested: op.as_str(),
                        in_flight: busy.as_str(),
                    },
                ));
            }
            let Some(reader) = inner.connected_reader.take() else {
                debug!("No reader connected, disconnect is a no-op");
                return Ok(Settled {
                    value: (),
                    state: inner.state,
                });
            };
            let void = inner
                .active_intent
                .as_ref()
                .filter(|i| i.status == IntentStatus::Authorized)
                .map(|i| (i.id.clone(), derived_key(&inner.active_key, "cancel")));
            s.start(&mut inner, op, None);
            (reader, void)
        };

        info!(reader_id = %reader.id, "Disconnecting reader");
        s.sdk.disconnect().await;
        if let Some((intent_id, key)) = void {
            s.void_intent(&intent_id, key).await;
        }

        let mut inner = s.inner.write().await;
        s.events.reader_disconnected(&reader.id, true);
        if let Some(mut intent) = inner.active_intent.take() {
            intent.fail("reader disconnected before capture");
            s.settle(&mut inner, intent);
        }
        s.set_state(&mut inner, SessionState::Ready);
        s.succeed(&mut inner, ())
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Collect a card payment. `Connected -> Collecting -> Completed | Authorized`.
    ///
    /// Runs three steps: create the intent, wait for the card, confirm. A
    /// step-1 failure never touches hardware. Transient failures of steps 2-3
    /// are retried against the same intent. Any final failure marks the intent
    /// failed, voids it best-effort and returns the session to `Connected`.
    pub async fn collect_payment(
        &self,
        amount: u64,
        options: CollectOptions,
    ) -> Outcome<PaymentIntent> {
        let op = Operation::CollectPayment;
        let s = &self.shared;
        let (currency, epoch) = {
            let mut inner = s.inner.write().await;
            s.admit(&inner, op, &[SessionState::Connected])?;
            if amount == 0 {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::InvalidArgument(
                        "amount must be greater than zero".to_string(),
                    ),
                ));
            }
            let Some(currency) = normalize_currency(&options.currency) else {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::InvalidArgument(format!(
                        "invalid currency code '{}'",
                        options.currency
                    )),
                ));
            };
            inner.cancel_requested = false;
            inner.active_key = options.idempotency_key.clone();
            let (_, epoch) = s.start(&mut inner, op, Some(SessionState::Collecting));
            (currency, epoch)
        };

        info!(
            amount,
            currency = %currency,
            capture_method = options.capture_method.as_str(),
            booking_ref = ?options.booking_ref,
            "Collecting payment"
        );
        let started = Instant::now();
        let result = self.run_collection(amount, currency, &options, epoch).await;

        let label = match &result {
            Ok(settled) => settled.value.status.as_str(),
            Err(failure) if failure.kind == ErrorKind::Cancelled => "cancelled",
            Err(_) => "failed",
        };
        metrics::COLLECTIONS.with_label_values(&[label]).inc();
        metrics::COLLECTION_DURATION
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    /// Reason to stop a collection between steps: reader lost or cancel requested.
    async fn checkpoint(&self, epoch: u64) -> Option<OrchestratorError> {
        let inner = self.shared.inner.read().await;
        if inner.epoch != epoch {
            Some(OrchestratorError::HardwareDisconnected {
                operation: "collect_payment",
            })
        } else if inner.cancel_requested {
            Some(OrchestratorError::Cancelled)
        } else {
            None
        }
    }

    async fn run_collection(
        &self,
        amount: u64,
        currency: String,
        options: &CollectOptions,
        epoch: u64,
    ) -> Outcome<PaymentIntent> {
        let s = &self.shared;

        // Step 1: create the intent server-side.
        s.events.publish(SessionEvent::CollectStepStarted {
            step: CollectStep::CreateIntent,
            intent_id: None,
        });
        let request = CreateIntentRequest {
            amount,
            currency: currency.clone(),
            capture_method: options.capture_method,
            booking_ref: options.booking_ref.clone(),
            metadata: options.metadata.clone(),
            idempotency_key: options.idempotency_key.clone(),
        };
        let created = match s.backend.create_payment_intent(&request).await {
            Ok(created) => created,
            Err(e) => {
                return Err(self
                    .abandon(epoch, CollectStep::CreateIntent, e.into(), None)
                    .await)
            }
        };
        let intent_id = created.id.clone();
        let Some(client_secret) = created.client_secret.clone() else {
            let cause = OrchestratorError::Transport(format!(
                "payment intent {} has no client secret",
                intent_id
            ));
            return Err(self
                .abandon(epoch, CollectStep::CreateIntent, cause, Some(intent_id))
                .await);
        };

        let now = Utc::now();
        let intent = PaymentIntent {
            id: intent_id.clone(),
            amount,
            currency: currency.clone(),
            capture_method: options.capture_method,
            status: IntentStatus::Created,
            booking_ref: options.booking_ref.clone(),
            metadata: options.metadata.clone(),
            amount_captured: None,
            failure_reason: None,
            client_secret: Some(client_secret.clone()),
            created_at: now,
            updated_at: now,
        };
        {
            let mut inner = s.inner.write().await;
            if inner.epoch == epoch {
                s.events.intent_updated(&intent);
                inner.active_intent = Some(intent);
                s.publish(&inner);
            }
        }
        debug!(intent_id = %intent_id, "Payment intent created");

        if let Some(stop) = self.checkpoint(epoch).await {
            return Err(self
                .abandon(epoch, CollectStep::CollectPaymentMethod, stop, Some(intent_id))
                .await);
        }

        let collect_request = CollectRequest {
            intent_id: intent_id.clone(),
            client_secret,
            amount,
            currency,
            capture_method: options.capture_method,
        };
        let attempts = s.config.collect_retries + 1;
        let mut attempt = 0;

        let confirmed = loop {
            attempt += 1;

            // Step 2: wait for the card.
            {
                let mut inner = s.inner.write().await;
                if let Some(intent) = inner.active_intent.as_mut() {
                    if intent.status == IntentStatus::Created
                        && intent.transition(IntentStatus::Collecting).is_ok()
                    {
                        s.events.intent_updated(intent);
                    }
                }
                s.publish(&inner);
            }
            s.events.publish(SessionEvent::CollectStepStarted {
                step: CollectStep::CollectPaymentMethod,
                intent_id: Some(intent_id.clone()),
            });
            let collected = s
                .sdk
                .collect_payment_method(&collect_request)
                .await
                .map_err(|e| OrchestratorError::from_reader(e, "collect_payment"));

            if let Some(stop) = self.checkpoint(epoch).await {
                return Err(self
                    .abandon(epoch, CollectStep::CollectPaymentMethod, stop, Some(intent_id))
                    .await);
            }
            let method = match collected {
                Ok(method) => method,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(intent_id = %intent_id, attempt, error = %e, "Card collection failed, retrying");
                    continue;
                }
                Err(e) => {
                    return Err(self
                        .abandon(epoch, CollectStep::CollectPaymentMethod, e, Some(intent_id))
                        .await)
                }
            };

            // Step 3: process the collected method against the intent.
            s.events.publish(SessionEvent::CollectStepStarted {
                step: CollectStep::ConfirmPayment,
                intent_id: Some(intent_id.clone()),
            });
            let confirmed = s
                .sdk
                .confirm_payment(&method)
                .await
                .map_err(|e| OrchestratorError::from_reader(e, "confirm_payment"));

            // Once the processor approved, a cancel is too late for a capture
            // and a lost reader changes neither outcome.
            if let Some(stop) = self.checkpoint(epoch).await {
                match &confirmed {
                    Ok(decided)
                        if stop.kind() == ErrorKind::HardwareDisconnected
                            && decided.intent_id == intent_id
                            && matches!(
                                decided.status,
                                IntentStatus::Captured | IntentStatus::Authorized
                            ) =>
                    {
                        return Err(self
                            .reconcile_lost_payment(&intent_id, decided, &options.idempotency_key)
                            .await);
                    }
                    Ok(decided)
                        if decided.status == IntentStatus::Captured
                            && stop.kind() == ErrorKind::Cancelled => {}
                    _ => {
                        return Err(self
                            .abandon(epoch, CollectStep::ConfirmPayment, stop, Some(intent_id))
                            .await)
                    }
                }
            }
            match confirmed {
                Ok(confirmed) => break confirmed,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(intent_id = %intent_id, attempt, error = %e, "Payment confirmation failed, retrying");
                }
                Err(e) => {
                    return Err(self
                        .abandon(epoch, CollectStep::ConfirmPayment, e, Some(intent_id))
                        .await)
                }
            }
        };

        self.complete_collection(
            epoch,
            options.capture_method,
            &intent_id,
            confirmed,
            &options.idempotency_key,
        )
        .await
    }

    async fn complete_collection(
        &self,
        epoch: u64,
        capture_method: CaptureMethod,
        intent_id: &str,
        confirmed: ConfirmedPayment,
        key: &Option<String>,
    ) -> Outcome<PaymentIntent> {
        let s = &self.shared;

        if matches!(
            confirmed.status,
            IntentStatus::Failed | IntentStatus::Cancelled
        ) {
            let cause = OrchestratorError::BackendRejected {
                code: None,
                message: format!("payment was not approved ({})", confirmed.status),
            };
            return Err(self
                .abandon(epoch, CollectStep::ConfirmPayment, cause, Some(intent_id.to_string()))
                .await);
        }

        let expected = match capture_method {
            CaptureMethod::Automatic => IntentStatus::Captured,
            CaptureMethod::Manual => IntentStatus::Authorized,
        };
        if confirmed.intent_id != intent_id || confirmed.status != expected {
            return Err(self.enter_error(epoch, intent_id, &confirmed, expected).await);
        }

        let mut inner = s.inner.write().await;
        let taken = if inner.epoch == epoch {
            inner.active_intent.take()
        } else {
            None
        };
        let Some(mut intent) = taken else {
            drop(inner);
            return Err(self.reconcile_lost_payment(intent_id, &confirmed, key).await);
        };

        if let Err(e) = intent.transition(confirmed.status) {
            warn!(error = %e, "Unexpected intent transition");
        }
        match confirmed.status {
            IntentStatus::Captured => {
                intent.amount_captured = confirmed.amount_captured.or(Some(intent.amount));
                s.settle(&mut inner, intent.clone());
                s.release_reader(&mut inner, true).await;
                s.set_state(&mut inner, SessionState::Completed);
                info!(intent_id, amount = intent.amount, "Payment captured");
            }
            _ => {
                s.events.intent_updated(&intent);
                inner.active_intent = Some(intent.clone());
                s.set_state(&mut inner, SessionState::Authorized);
                info!(intent_id, amount = intent.amount, "Payment authorized, awaiting capture");
            }
        }
        s.succeed(&mut inner, intent)
    }

    /// The reader dropped after the processor decided the payment.
    ///
    /// The disconnect already settled the intent as failed. A capture is
    /// recorded as captured and never voided; an authorization is voided and
    /// recorded as cancelled. The session stays where the disconnect left it.
    async fn reconcile_lost_payment(
        &self,
        intent_id: &str,
        confirmed: &ConfirmedPayment,
        key: &Option<String>,
    ) -> Failure {
        let s = &self.shared;
        error!(intent_id, status = %confirmed.status, "Reader lost after the payment went through");

        let actual = match confirmed.status {
            IntentStatus::Captured => Some(IntentStatus::Captured),
            IntentStatus::Authorized => {
                if s.void_intent(intent_id, derived_key(key, "cancel")).await {
                    Some(IntentStatus::Cancelled)
                } else {
                    None
                }
            }
            _ => None,
        };

        let mut inner = s.inner.write().await;
        let recorded = inner.settled.get(intent_id).cloned();
        if let (Some(status), Some(mut intent)) = (actual, recorded) {
            intent.status = status;
            intent.failure_reason = None;
            if status == IntentStatus::Captured {
                intent.amount_captured = confirmed.amount_captured.or(Some(intent.amount));
            }
            intent.updated_at = Utc::now();
            s.events.intent_updated(&intent);
            if inner
                .last_intent
                .as_ref()
                .is_some_and(|last| last.id == intent_id)
            {
                inner.last_intent = Some(intent.clone());
            }
            inner.settled.insert(intent.id.clone(), intent);
        }

        let err = OrchestratorError::DisconnectedAfterPayment {
            status: confirmed.status,
        }
        .in_step(CollectStep::ConfirmPayment, Some(intent_id.to_string()));
        s.fail(&mut inner, err)
    }

    /// Stop a collection: void the intent best-effort, settle it and roll back.
    ///
    /// Returns the error wrapped with the failing step. Leaves the session
    /// alone if the reader was lost meanwhile (the disconnect already settled it).
    async fn abandon(
        &self,
        epoch: u64,
        step: CollectStep,
        cause: OrchestratorError,
        intent_id: Option<String>,
    ) -> Failure {
        let s = &self.shared;
        let key = s.inner.read().await.active_key.clone();
        let voided = match &intent_id {
            Some(id) => s.void_intent(id, derived_key(&key, "cancel")).await,
            None => false,
        };
        let err = cause.in_step(step, intent_id);
        warn!(step = %step, error = %err, "Payment collection stopped");

        let mut inner = s.inner.write().await;
        if inner.epoch == epoch {
            if let Some(mut intent) = inner.active_intent.take() {
                if err.kind() == ErrorKind::Cancelled && voided {
                    if let Err(e) = intent.transition(IntentStatus::Cancelled) {
                        warn!(error = %e, "Unexpected intent transition");
                    }
                } else {
                    intent.fail(err.root().to_string());
                }
                s.settle(&mut inner, intent);
            }
            if err.kind() == ErrorKind::HardwareDisconnected {
                if inner.connected_reader.is_some() {
                    metrics::UNEXPECTED_DISCONNECTS.inc();
                }
                s.release_reader(&mut inner, false).await;
                inner.epoch += 1;
                s.set_state(&mut inner, SessionState::Ready);
            } else {
                s.set_state(&mut inner, SessionState::Connected);
            }
        }
        s.fail(&mut inner, err)
    }

    /// The reader reported a result that does not match the intent: stop trusting it.
    async fn enter_error(
        &self,
        epoch: u64,
        intent_id: &str,
        confirmed: &ConfirmedPayment,
        expected: IntentStatus,
    ) -> Failure {
        let s = &self.shared;
        error!(
            intent_id,
            reported_intent = %confirmed.intent_id,
            reported_status = %confirmed.status,
            expected = %expected,
            "Reader reported an inconsistent payment result"
        );
        let key = s.inner.read().await.active_key.clone();
        s.void_intent(intent_id, derived_key(&key, "cancel")).await;

        let err = OrchestratorError::Transport(format!(
            "reader reported {} for intent {}, expected {} for {}",
            confirmed.status, confirmed.intent_id, expected, intent_id
        ))
        .in_step(CollectStep::ConfirmPayment, Some(intent_id.to_string()));

        let mut inner = s.inner.write().await;
        if inner.epoch == epoch {
            if let Some(mut intent) = inner.active_intent.take() {
                intent.fail("inconsistent reader result");
                s.settle(&mut inner, intent);
            }
            s.release_reader(&mut inner, true).await;
            s.set_state(&mut inner, SessionState::Error);
        }
        s.fail(&mut inner, err)
    }

    /// Capture an authorized intent. `Authorized -> Capturing -> Completed`.
    ///
    /// `amount` defaults to the full authorization. A transient failure leaves
    /// the intent authorized for another attempt; a rejection fails it.
    pub async fn capture_payment(
        &self,
        intent_id: &str,
        amount: Option<u64>,
    ) -> Outcome<PaymentIntent> {
        let op = Operation::CapturePayment;
        let s = &self.shared;
        let key = {
            let mut inner = s.inner.write().await;
            s.admit(&inner, op, &[SessionState::Authorized])?;
            let Some(intent) = inner.active_intent.as_ref() else {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::InvalidState {
                        operation: op.as_str(),
                        state: inner.state,
                    },
                ));
            };
            if intent.id != intent_id {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::InvalidArgument(format!(
                        "payment intent {} is not the authorized intent",
                        intent_id
                    )),
                ));
            }
            if let Some(requested) = amount {
                if requested == 0 || requested > intent.amount {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidArgument(format!(
                            "capture amount {} must be between 1 and the authorized {}",
                            requested, intent.amount
                        )),
                    ));
                }
            }
            let key = inner.active_key.clone();
            s.start(&mut inner, op, Some(SessionState::Capturing));
            key
        };

        info!(intent_id, amount = ?amount, "Capturing payment");
        let request = CaptureRequest {
            amount,
            idempotency_key: derived_key(&key, "capture"),
        };
        let outcome = match s.backend.capture_payment_intent(intent_id, &request).await {
            Ok(captured) if captured.status == IntentStatus::Captured => Ok(captured),
            Ok(other)
                if matches!(other.status, IntentStatus::Cancelled | IntentStatus::Failed) =>
            {
                Err(OrchestratorError::BackendRejected {
                    code: None,
                    message: format!("payment intent is {}", other.status),
                })
            }
            Ok(other) => Err(OrchestratorError::Transport(format!(
                "capture answered with status {}",
                other.status
            ))),
            Err(e) => Err(OrchestratorError::from(e)),
        };

        // A failed capture without a reader cannot go back to Authorized.
        let reader_lost = s.inner.read().await.connected_reader.is_none();
        let give_up = match &outcome {
            Ok(_) => false,
            Err(e) => !e.is_retryable() || reader_lost,
        };
        if give_up {
            s.void_intent(intent_id, derived_key(&key, "cancel")).await;
        }

        let mut inner = s.inner.write().await;
        match outcome {
            Ok(captured) => {
                let Some(mut intent) = inner.active_intent.take() else {
                    let err = OrchestratorError::InvalidState {
                        operation: op.as_str(),
                        state: inner.state,
                    };
                    return Err(s.fail(&mut inner, err));
                };
                if let Err(e) = intent.transition(IntentStatus::Captured) {
                    warn!(error = %e, "Unexpected intent transition");
                }
                intent.amount_captured = captured
                    .amount_captured
                    .or(amount)
                    .or(Some(intent.amount));
                s.settle(&mut inner, intent.clone());
                s.release_reader(&mut inner, true).await;
                s.set_state(&mut inner, SessionState::Completed);
                metrics::CAPTURES.with_label_values(&["captured"]).inc();
                info!(intent_id, amount_captured = ?intent.amount_captured, "Payment captured");
                s.succeed(&mut inner, intent)
            }
            Err(err) if !give_up && inner.connected_reader.is_some() => {
                warn!(intent_id, error = %err, "Capture failed, intent remains authorized");
                s.set_state(&mut inner, SessionState::Authorized);
                metrics::CAPTURES.with_label_values(&["failed"]).inc();
                Err(s.fail(&mut inner, err))
            }
            Err(err) => {
                warn!(intent_id, error = %err, "Capture failed, intent abandoned");
                if let Some(mut intent) = inner.active_intent.take() {
                    intent.fail(err.to_string());
                    s.settle(&mut inner, intent);
                }
                if !give_up {
                    // Reader vanished after the peek; void in the background.
                    let shared = Arc::clone(&self.shared);
                    let intent_id = intent_id.to_string();
                    let key = derived_key(&key, "cancel");
                    tokio::spawn(async move {
                        shared.void_intent(&intent_id, key).await;
                    });
                }
                let next = if inner.connected_reader.is_some() {
                    SessionState::Connected
                } else {
                    SessionState::Ready
                };
                s.set_state(&mut inner, next);
                metrics::CAPTURES.with_label_values(&["failed"]).inc();
                Err(s.fail(&mut inner, err))
            }
        }
    }

    /// Cancel a payment intent. Idempotent.
    ///
    /// - during `Collecting`: preempts the collection, which voids the intent
    /// - `Authorized`: voids the hold server-side, back to `Connected`
    /// - already cancelled or failed, or nothing active: no-op success
    /// - captured: `InvalidState`
    ///
    /// Returns the intent as settled, or `None` when there was nothing to cancel.
    pub async fn cancel_payment(&self, intent_id: &str) -> Outcome<Option<PaymentIntent>> {
        let op = Operation::CancelPayment;
        let s = &self.shared;
        let mut preempted = false;

        let (key, prior) = loop {
            let mut inner = s.inner.write().await;

            if inner.in_flight == Some(Operation::CollectPayment) && !preempted {
                let same_intent = inner
                    .active_intent
                    .as_ref()
                    .is_none_or(|i| i.id == intent_id);
                if !same_intent {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidArgument(format!(
                            "payment intent {} is not being collected",
                            intent_id
                        )),
                    ));
                }
                drop(inner);
                self.preempt_collection(op).await?;
                preempted = true;
                continue;
            }

            if let Some(busy) = inner.in_flight {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::ConcurrentOperation {
                        requested: op.as_str(),
                        in_flight: busy.as_str(),
                    },
                ));
            }

            if let Some(settled) = inner.settled.get(intent_id) {
                if settled.status == IntentStatus::Captured {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidState {
                            operation: op.as_str(),
                            state: inner.state,
                        },
                    ));
                }
                if !preempted {
                    metrics::CANCELS.with_label_values(&["noop"]).inc();
                } else {
                    metrics::CANCELS
                        .with_label_values(&[settled.status.as_str()])
                        .inc();
                }
                return Ok(Settled {
                    value: Some(settled.clone()),
                    state: inner.state,
                });
            }

            match inner.active_intent.as_ref() {
                None => {
                    metrics::CANCELS.with_label_values(&["noop"]).inc();
                    return Ok(Settled {
                        value: None,
                        state: inner.state,
                    });
                }
                Some(active) if active.id != intent_id => {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidArgument(format!(
                            "payment intent {} is not the active intent",
                            intent_id
                        )),
                    ));
                }
                Some(_) if inner.state != SessionState::Authorized => {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::InvalidState {
                            operation: op.as_str(),
                            state: inner.state,
                        },
                    ));
                }
                Some(_) => {
                    let key = inner.active_key.clone();
                    let (prior, _) = s.start(&mut inner, op, None);
                    break (key, prior);
                }
            }
        };

        info!(intent_id, "Voiding authorized payment");
        let result = s
            .backend
            .cancel_payment_intent(intent_id, derived_key(&key, "cancel").as_deref())
            .await;

        let mut inner = s.inner.write().await;
        let result = match result {
            Ok(answer) if answer.status == IntentStatus::Cancelled => Ok(()),
            Ok(answer) => Err(OrchestratorError::BackendRejected {
                code: None,
                message: format!("payment intent is {}", answer.status),
            }),
            Err(e) => Err(OrchestratorError::from(e)),
        };
        match result {
            Ok(()) => {
                let Some(mut intent) = inner.active_intent.take() else {
                    // The reader dropped meanwhile and the intent was already settled.
                    let settled = inner.settled.get(intent_id).cloned();
                    return s.succeed(&mut inner, settled);
                };
                if let Err(e) = intent.transition(IntentStatus::Cancelled) {
                    warn!(error = %e, "Unexpected intent transition");
                }
                s.settle(&mut inner, intent.clone());
                let next = if inner.connected_reader.is_some() {
                    SessionState::Connected
                } else {
                    SessionState::Ready
                };
                s.set_state(&mut inner, next);
                metrics::CANCELS.with_label_values(&["cancelled"]).inc();
                s.succeed(&mut inner, Some(intent))
            }
            Err(err) => {
                warn!(intent_id, error = %err, "Void failed, intent remains authorized");
                if inner.state != prior {
                    debug!(state = %inner.state, "Session moved during void");
                }
                metrics::CANCELS.with_label_values(&["failed"]).inc();
                Err(s.fail(&mut inner, err))
            }
        }
    }

    /// Cancel whatever collection is in flight, without knowing its intent id.
    ///
    /// Returns the intent the collection settled, or `None` when nothing was
    /// being collected.
    pub async fn cancel_collection(&self) -> Outcome<Option<PaymentIntent>> {
        let op = Operation::CancelPayment;
        let s = &self.shared;
        {
            let inner = s.inner.read().await;
            match inner.in_flight {
                Some(Operation::CollectPayment) => {}
                Some(busy) => {
                    return Err(s.reject(
                        &inner,
                        op,
                        OrchestratorError::ConcurrentOperation {
                            requested: op.as_str(),
                            in_flight: busy.as_str(),
                        },
                    ))
                }
                None => {
                    metrics::CANCELS.with_label_values(&["noop"]).inc();
                    return Ok(Settled {
                        value: None,
                        state: inner.state,
                    });
                }
            }
        }

        self.preempt_collection(op).await?;
        let inner = s.inner.read().await;
        let settled = inner.last_intent.clone();
        let label = match &settled {
            Some(intent) => intent.status.as_str(),
            None => "noop",
        };
        metrics::CANCELS.with_label_values(&[label]).inc();
        Ok(Settled {
            value: settled,
            state: inner.state,
        })
    }

    /// Flag the in-flight collection for cancellation and wait for it to unwind.
    async fn preempt_collection(&self, op: Operation) -> Result<(), Failure> {
        let s = &self.shared;
        s.inner.write().await.cancel_requested = true;
        info!("Cancelling in-flight payment collection");
        s.sdk.cancel_collect().await;

        let wait = Duration::from_millis(s.config.cancel_wait_ms);
        let mut snapshots = s.snapshot.subscribe();
        let unwound = snapshots.wait_for(|snap| snap.in_flight != Some(Operation::CollectPayment));
        let waited = tokio::time::timeout(wait, unwound)
            .await
            .map(|seen| seen.map(|_| ()));
        let err = match waited {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(_)) => OrchestratorError::Transport("session closed while cancelling".to_string()),
            Err(_) => {
                warn!(wait_ms = s.config.cancel_wait_ms, "Collection did not unwind in time");
                OrchestratorError::Timeout {
                    operation: op.as_str(),
                    after_ms: Some(s.config.cancel_wait_ms),
                }
            }
        };
        let inner = s.inner.read().await;
        Err(Failure::new(err, inner.state))
    }

    /// Abandon the checkout from any non-terminal state. `-> Cancelled`.
    pub async fn abort_checkout(&self) -> Outcome<()> {
        let op = Operation::AbortCheckout;
        let s = &self.shared;
        {
            let mut inner = s.inner.write().await;
            if let Some(busy) = inner.in_flight {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::ConcurrentOperation {
                        requested: op.as_str(),
                        in_flight: busy.as_str(),
                    },
                ));
            }
            if inner.state.is_terminal() {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::InvalidState {
                        operation: op.as_str(),
                        state: inner.state,
                    },
                ));
            }
            s.start(&mut inner, op, None);
        }

        info!("Aborting checkout");
        self.release_everything(op, "checkout aborted").await;

        let mut inner = s.inner.write().await;
        s.set_state(&mut inner, SessionState::Cancelled);
        s.succeed(&mut inner, ())
    }

    /// Tear the session down to `Uninitialized`, whatever the payment outcome.
    pub async fn end_checkout(&self) -> Outcome<()> {
        let op = Operation::EndCheckout;
        let s = &self.shared;
        {
            let mut inner = s.inner.write().await;
            if let Some(busy) = inner.in_flight {
                return Err(s.reject(
                    &inner,
                    op,
                    OrchestratorError::ConcurrentOperation {
                        requested: op.as_str(),
                        in_flight: busy.as_str(),
                    },
                ));
            }
            s.start(&mut inner, op, None);
        }

        info!("Ending checkout");
        self.release_everything(op, "checkout ended").await;
        s.registry.clear().await;

        let mut inner = s.inner.write().await;
        inner.discovery = None;
        inner.epoch += 1;
        s.set_state(&mut inner, SessionState::Uninitialized);
        s.succeed(&mut inner, ())
    }

    /// Void any authorized intent, fail any other active one and drop the reader.
    async fn release_everything(&self, op: Operation, reason: &str) {
        let s = &self.shared;
        let (intent, key, reader) = {
            let mut inner = s.inner.write().await;
            let reader = inner.connected_reader.take();
            let intent = inner.active_intent.clone();
            (intent, inner.active_key.clone(), reader)
        };

        let mut voided = false;
        if let Some(intent) = intent
            .as_ref()
            .filter(|i| i.status == IntentStatus::Authorized)
        {
            voided = s.void_intent(&intent.id, derived_key(&key, "cancel")).await;
        }
        if let Some(reader) = &reader {
            s.sdk.disconnect().await;
            s.events.reader_disconnected(&reader.id, true);
        }

        let mut inner = s.inner.write().await;
        if let Some(mut intent) = inner.active_intent.take() {
            if voided {
                if let Err(e) = intent.transition(IntentStatus::Cancelled) {
                    warn!(error = %e, "Unexpected intent transition");
                }
            } else {
                intent.fail(reason);
            }
            debug!(operation = op.as_str(), intent_id = %intent.id, status = %intent.status, "Settled active intent");
            s.settle(&mut inner, intent);
        }
        s.publish(&inner);
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
