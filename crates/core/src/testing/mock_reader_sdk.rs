//! Mock reader SDK for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify, RwLock};

use crate::backend::ConnectionToken;
use crate::payment::{CaptureMethod, IntentStatus};
use crate::reader::{
    CollectRequest, CollectedPaymentMethod, ConfirmedPayment, DiscoveryRequest, Reader,
    ReaderError, ReaderEvent, ReaderSdk,
};

use super::fixtures;

/// Mock implementation of the ReaderSdk trait.
///
/// Provides controllable behavior for testing:
/// - Configure the discovered reader list
/// - Inject failures per operation (queued for collect and confirm)
/// - Hold a collection open until cancelled or disconnected
/// - Hold a confirmation in flight; it still succeeds if the reader drops
/// - Trigger unexpected disconnects
/// - Record collect requests for assertions
///
/// # Example
///
/// ```rust,ignore
/// use tapline_core::testing::MockReaderSdk;
///
/// let sdk = MockReaderSdk::new();
/// sdk.set_collect_delay(Duration::from_secs(30)).await;
///
/// // ... start a collection in another task ...
/// sdk.wait_for_collect().await;
/// sdk.trigger_unexpected_disconnect().await;
/// ```
pub struct MockReaderSdk {
    readers: Arc<RwLock<Vec<Reader>>>,
    connected: Arc<RwLock<Option<Reader>>>,
    discover_error: Arc<RwLock<Option<ReaderError>>>,
    connect_error: Arc<RwLock<Option<ReaderError>>>,
    collect_errors: Arc<RwLock<VecDeque<ReaderError>>>,
    confirm_errors: Arc<RwLock<VecDeque<ReaderError>>>,
    /// Replaces the computed confirm result once.
    confirm_override: Arc<RwLock<Option<ConfirmedPayment>>>,
    discover_delay: Arc<RwLock<Duration>>,
    connect_delay: Arc<RwLock<Duration>>,
    collect_delay: Arc<RwLock<Duration>>,
    confirm_delay: Arc<RwLock<Duration>>,
    collect_requests: Arc<RwLock<Vec<CollectRequest>>>,
    connect_count: Arc<RwLock<usize>>,
    disconnect_count: Arc<RwLock<usize>>,
    confirm_count: Arc<RwLock<usize>>,
    cancel_count: Arc<RwLock<usize>>,
    interrupted: AtomicBool,
    interrupt: Notify,
    collect_started: Notify,
    confirm_started: Notify,
    events: broadcast::Sender<ReaderEvent>,
}

impl Default for MockReaderSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReaderSdk {
    /// Create a mock with one online reader, `fixtures::READER_ID`.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            readers: Arc::new(RwLock::new(vec![fixtures::reader(fixtures::READER_ID)])),
            connected: Arc::new(RwLock::new(None)),
            discover_error: Arc::new(RwLock::new(None)),
            connect_error: Arc::new(RwLock::new(None)),
            collect_errors: Arc::new(RwLock::new(VecDeque::new())),
            confirm_errors: Arc::new(RwLock::new(VecDeque::new())),
            confirm_override: Arc::new(RwLock::new(None)),
            discover_delay: Arc::new(RwLock::new(Duration::ZERO)),
            connect_delay: Arc::new(RwLock::new(Duration::ZERO)),
            collect_delay: Arc::new(RwLock::new(Duration::ZERO)),
            confirm_delay: Arc::new(RwLock::new(Duration::ZERO)),
            collect_requests: Arc::new(RwLock::new(Vec::new())),
            connect_count: Arc::new(RwLock::new(0)),
            disconnect_count: Arc::new(RwLock::new(0)),
            confirm_count: Arc::new(RwLock::new(0)),
            cancel_count: Arc::new(RwLock::new(0)),
            interrupted: AtomicBool::new(false),
            interrupt: Notify::new(),
            collect_started: Notify::new(),
            confirm_started: Notify::new(),
            events,
        }
    }

    pub async fn set_readers(&self, readers: Vec<Reader>) {
        *self.readers.write().await = readers;
    }

    pub async fn fail_next_discover(&self, error: ReaderError) {
        *self.discover_error.write().await = Some(error);
    }

    pub async fn fail_next_connect(&self, error: ReaderError) {
        *self.connect_error.write().await = Some(error);
    }

    /// Queue a failure for the next collect call. Queued failures are used in order.
    pub async fn fail_next_collect(&self, error: ReaderError) {
        self.collect_errors.write().await.push_back(error);
    }

    pub async fn fail_next_confirm(&self, error: ReaderError) {
        self.confirm_errors.write().await.push_back(error);
    }

    /// Make the next confirm report `result` instead of the expected outcome.
    pub async fn override_next_confirm(&self, result: ConfirmedPayment) {
        *self.confirm_override.write().await = Some(result);
    }

    pub async fn set_discover_delay(&self, delay: Duration) {
        *self.discover_delay.write().await = delay;
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.write().await = delay;
    }

    /// How long a collect waits for the "card". Cancel and disconnect cut it short.
    pub async fn set_collect_delay(&self, delay: Duration) {
        *self.collect_delay.write().await = delay;
    }

    /// How long the processor takes to answer a confirm.
    pub async fn set_confirm_delay(&self, delay: Duration) {
        *self.confirm_delay.write().await = delay;
    }

    /// Resolve once a collect call has started. Does not miss a call made earlier.
    pub async fn wait_for_collect(&self) {
        self.collect_started.notified().await;
    }

    /// Resolve once a confirm call has started. Does not miss a call made earlier.
    pub async fn wait_for_confirm(&self) {
        self.confirm_started.notified().await;
    }

    /// Drop the connection as if the reader lost power.
    pub async fn trigger_unexpected_disconnect(&self) {
        let reader = self.connected.write().await.take();
        if let Some(reader) = reader {
            self.interrupted.store(true, Ordering::SeqCst);
            self.interrupt.notify_waiters();
            let _ = self
                .events
                .send(ReaderEvent::UnexpectedDisconnect { reader_id: reader.id });
        }
    }

    pub fn emit_display_message(&self, message: impl Into<String>) {
        let _ = self.events.send(ReaderEvent::DisplayMessage {
            message: message.into(),
        });
    }

    pub async fn connected_reader(&self) -> Option<Reader> {
        self.connected.read().await.clone()
    }

    pub async fn collect_requests(&self) -> Vec<CollectRequest> {
        self.collect_requests.read().await.clone()
    }

    pub async fn collect_count(&self) -> usize {
        self.collect_requests.read().await.len()
    }

    pub async fn connect_count(&self) -> usize {
        *self.connect_count.read().await
    }

    pub async fn disconnect_count(&self) -> usize {
        *self.disconnect_count.read().await
    }

    pub async fn confirm_count(&self) -> usize {
        *self.confirm_count.read().await
    }

    pub async fn cancel_count(&self) -> usize {
        *self.cancel_count.read().await
    }

    async fn require_connected(&self) -> Result<(), ReaderError> {
        if self.connected.read().await.is_some() {
            Ok(())
        } else {
            Err(ReaderError::Disconnected)
        }
    }
}

#[async_trait]
impl ReaderSdk for MockReaderSdk {
    fn name(&self) -> &str {
        "mock"
    }

    async fn discover_readers(
        &self,
        _request: &DiscoveryRequest,
    ) -> Result<Vec<Reader>, ReaderError> {
        let delay = *self.discover_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.discover_error.write().await.take() {
            return Err(error);
        }
        Ok(self.readers.read().await.clone())
    }

    async fn connect(
        &self,
        reader: &Reader,
        _token: &ConnectionToken,
    ) -> Result<Reader, ReaderError> {
        *self.connect_count.write().await += 1;
        let delay = *self.connect_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.connect_error.write().await.take() {
            return Err(error);
        }
        *self.connected.write().await = Some(reader.clone());
        Ok(reader.clone())
    }

    async fn disconnect(&self) {
        *self.disconnect_count.write().await += 1;
        self.connected.write().await.take();
    }

    async fn collect_payment_method(
        &self,
        request: &CollectRequest,
    ) -> Result<CollectedPaymentMethod, ReaderError> {
        self.require_connected().await?;
        self.collect_requests.write().await.push(request.clone());
        self.interrupted.store(false, Ordering::SeqCst);

        let notified = self.interrupt.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.collect_started.notify_one();

        if let Some(error) = self.collect_errors.write().await.pop_front() {
            return Err(error);
        }

        let delay = *self.collect_delay.read().await;
        if !self.interrupted.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut notified => {}
            }
        }

        if self.interrupted.swap(false, Ordering::SeqCst) {
            self.require_connected().await?;
            return Err(ReaderError::Cancelled);
        }
        self.require_connected().await?;

        Ok(CollectedPaymentMethod {
            intent_id: request.intent_id.clone(),
            payment_method_id: format!("pm_mock_{}", request.intent_id),
            capture_method: request.capture_method,
            amount: request.amount,
            card_brand: Some("visa".to_string()),
            last4: Some("4242".to_string()),
        })
    }

    async fn cancel_collect(&self) {
        *self.cancel_count.write().await += 1;
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt.notify_waiters();
    }

    async fn confirm_payment(
        &self,
        method: &CollectedPaymentMethod,
    ) -> Result<ConfirmedPayment, ReaderError> {
        *self.confirm_count.write().await += 1;
        self.require_connected().await?;
        self.confirm_started.notify_one();

        // Already with the processor: losing the reader now does not stop it.
        let delay = *self.confirm_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.confirm_errors.write().await.pop_front() {
            return Err(error);
        }
        if let Some(result) = self.confirm_override.write().await.take() {
            return Ok(result);
        }

        Ok(match method.capture_method {
            CaptureMethod::Automatic => ConfirmedPayment {
                intent_id: method.intent_id.clone(),
                status: IntentStatus::Captured,
                amount_captured: Some(method.amount),
            },
            CaptureMethod::Manual => ConfirmedPayment {
                intent_id: method.intent_id.clone(),
                status: IntentStatus::Authorized,
                amount_captured: None,
            },
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_request() -> CollectRequest {
        CollectRequest {
            intent_id: "pi_1".to_string(),
            client_secret: "pi_1_secret".to_string(),
            amount: 2500,
            currency: "usd".to_string(),
            capture_method: CaptureMethod::Automatic,
        }
    }

    async fn connected_sdk() -> Arc<MockReaderSdk> {
        let sdk = Arc::new(MockReaderSdk::new());
        sdk.connect(&fixtures::reader(fixtures::READER_ID), &fixtures::token())
            .await
            .unwrap();
        sdk
    }

    #[tokio::test]
    async fn test_queued_collect_errors() {
        let sdk = connected_sdk().await;
        sdk.fail_next_collect(ReaderError::Timeout).await;
        sdk.fail_next_collect(ReaderError::Internal("glitch".into())).await;

        assert_eq!(
            sdk.collect_payment_method(&collect_request()).await.unwrap_err(),
            ReaderError::Timeout
        );
        assert!(matches!(
            sdk.collect_payment_method(&collect_request()).await,
            Err(ReaderError::Internal(_))
        ));
        assert!(sdk.collect_payment_method(&collect_request()).await.is_ok());
        assert_eq!(sdk.collect_count().await, 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_held_collect() {
        let sdk = connected_sdk().await;
        sdk.set_collect_delay(Duration::from_secs(30)).await;

        let task = {
            let sdk = sdk.clone();
            tokio::spawn(async move { sdk.collect_payment_method(&collect_request()).await })
        };
        sdk.wait_for_collect().await;
        sdk.cancel_collect().await;

        assert_eq!(task.await.unwrap().unwrap_err(), ReaderError::Cancelled);
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_interrupts_collect() {
        let sdk = connected_sdk().await;
        sdk.set_collect_delay(Duration::from_secs(30)).await;
        let mut events = sdk.subscribe();

        let task = {
            let sdk = sdk.clone();
            tokio::spawn(async move { sdk.collect_payment_method(&collect_request()).await })
        };
        sdk.wait_for_collect().await;
        sdk.trigger_unexpected_disconnect().await;

        assert_eq!(task.await.unwrap().unwrap_err(), ReaderError::Disconnected);
        assert_eq!(
            events.recv().await.unwrap(),
            ReaderEvent::UnexpectedDisconnect {
                reader_id: fixtures::READER_ID.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_held_confirm_survives_disconnect() {
        let sdk = connected_sdk().await;
        let method = sdk.collect_payment_method(&collect_request()).await.unwrap();
        sdk.set_confirm_delay(Duration::from_millis(100)).await;

        let task = {
            let sdk = sdk.clone();
            tokio::spawn(async move { sdk.confirm_payment(&method).await })
        };
        sdk.wait_for_confirm().await;
        sdk.trigger_unexpected_disconnect().await;

        let confirmed = task.await.unwrap().unwrap();
        assert_eq!(confirmed.status, IntentStatus::Captured);
        assert!(sdk.connected_reader().await.is_none());
    }

    #[tokio::test]
    async fn test_confirm_override() {
        let sdk = connected_sdk().await;
        let method = sdk.collect_payment_method(&collect_request()).await.unwrap();
        sdk.override_next_confirm(ConfirmedPayment {
            intent_id: "pi_other".to_string(),
            status: IntentStatus::Captured,
            amount_captured: Some(1),
        })
        .await;

        assert_eq!(
            sdk.confirm_payment(&method).await.unwrap().intent_id,
            "pi_other"
        );
        assert_eq!(sdk.confirm_payment(&method).await.unwrap().intent_id, "pi_1");
    }
}
