//! Mock payment backend for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{
    BackendError, BackendIntent, CaptureRequest, ConnectionToken, CreateIntentRequest,
    PaymentBackend,
};
use crate::payment::IntentStatus;

/// A recorded capture call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedCapture {
    pub intent_id: String,
    pub amount: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// A recorded cancel call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedCancel {
    pub intent_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredIntent {
    amount: u64,
    intent: BackendIntent,
}

/// Internal state for the mock backend.
#[derive(Debug, Default)]
struct MockBackendState {
    intents: HashMap<String, StoredIntent>,
    by_idempotency_key: HashMap<String, String>,
    creates: Vec<CreateIntentRequest>,
    captures: Vec<RecordedCapture>,
    cancels: Vec<RecordedCancel>,
    token_requests: usize,
    intent_counter: u64,
}

/// Mock implementation of the PaymentBackend trait.
///
/// Keeps intents in memory and applies the backend's lifecycle rules:
/// - creating with a known idempotency key replays the original intent
/// - capture is allowed on any non-terminal intent, up to its amount
/// - cancel is idempotent; cancelling a captured intent is rejected
///
/// Failures can be injected per operation with the `fail_next_*` methods.
#[derive(Debug)]
pub struct MockPaymentBackend {
    state: Arc<RwLock<MockBackendState>>,
    token_error: Arc<RwLock<Option<BackendError>>>,
    create_error: Arc<RwLock<Option<BackendError>>>,
    capture_error: Arc<RwLock<Option<BackendError>>>,
    cancel_error: Arc<RwLock<Option<BackendError>>>,
    create_delay: Arc<RwLock<Duration>>,
    capture_delay: Arc<RwLock<Duration>>,
    omit_client_secret: Arc<RwLock<bool>>,
}

impl Default for MockPaymentBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPaymentBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockBackendState::default())),
            token_error: Arc::new(RwLock::new(None)),
            create_error: Arc::new(RwLock::new(None)),
            capture_error: Arc::new(RwLock::new(None)),
            cancel_error: Arc::new(RwLock::new(None)),
            create_delay: Arc::new(RwLock::new(Duration::ZERO)),
            capture_delay: Arc::new(RwLock::new(Duration::ZERO)),
            omit_client_secret: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn fail_next_token(&self, error: BackendError) {
        *self.token_error.write().await = Some(error);
    }

    pub async fn fail_next_create(&self, error: BackendError) {
        *self.create_error.write().await = Some(error);
    }

    pub async fn fail_next_capture(&self, error: BackendError) {
        *self.capture_error.write().await = Some(error);
    }

    pub async fn fail_next_cancel(&self, error: BackendError) {
        *self.cancel_error.write().await = Some(error);
    }

    /// Delay intent creation, to keep a collection in its first step.
    pub async fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.write().await = delay;
    }

    /// Delay captures, to keep a session in `Capturing`.
    pub async fn set_capture_delay(&self, delay: Duration) {
        *self.capture_delay.write().await = delay;
    }

    /// Answer creates without a client secret.
    pub async fn set_omit_client_secret(&self, omit: bool) {
        *self.omit_client_secret.write().await = omit;
    }

    pub async fn token_requests(&self) -> usize {
        self.state.read().await.token_requests
    }

    pub async fn created_intents(&self) -> Vec<CreateIntentRequest> {
        self.state.read().await.creates.clone()
    }

    pub async fn create_count(&self) -> usize {
        self.state.read().await.creates.len()
    }

    pub async fn captures(&self) -> Vec<RecordedCapture> {
        self.state.read().await.captures.clone()
    }

    pub async fn cancels(&self) -> Vec<RecordedCancel> {
        self.state.read().await.cancels.clone()
    }

    /// Current server-side status of an intent.
    pub async fn intent_status(&self, intent_id: &str) -> Option<IntentStatus> {
        self.state
            .read()
            .await
            .intents
            .get(intent_id)
            .map(|s| s.intent.status)
    }

    /// Force an intent's server-side status, e.g. to mark it paid out of band.
    pub async fn set_intent_status(&self, intent_id: &str, status: IntentStatus) {
        if let Some(stored) = self.state.write().await.intents.get_mut(intent_id) {
            stored.intent.status = status;
        }
    }

    fn not_found(intent_id: &str) -> BackendError {
        BackendError::Rejected {
            status: 404,
            code: Some("resource_missing".to_string()),
            message: format!("No such payment intent: {}", intent_id),
        }
    }

    fn unexpected_state(intent_id: &str, status: IntentStatus) -> BackendError {
        BackendError::Rejected {
            status: 400,
            code: Some("payment_intent_unexpected_state".to_string()),
            message: format!("Payment intent {} is {}", intent_id, status),
        }
    }
}

#[async_trait]
impl PaymentBackend for MockPaymentBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_connection_token(&self) -> Result<ConnectionToken, BackendError> {
        let mut state = self.state.write().await;
        state.token_requests += 1;
        if let Some(error) = self.token_error.write().await.take() {
            return Err(error);
        }
        Ok(ConnectionToken::new(format!(
            "pst_mock_{:04}",
            state.token_requests
        )))
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<BackendIntent, BackendError> {
        let delay = *self.create_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        state.creates.push(request.clone());
        if let Some(error) = self.create_error.write().await.take() {
            return Err(error);
        }

        if let Some(key) = &request.idempotency_key {
            if let Some(stored) = state
                .by_idempotency_key
                .get(key)
                .and_then(|id| state.intents.get(id))
            {
                return Ok(stored.intent.clone());
            }
        }

        state.intent_counter += 1;
        let id = format!("pi_mock_{:04}", state.intent_counter);
        let client_secret = if *self.omit_client_secret.read().await {
            None
        } else {
            Some(format!("{}_secret_test", id))
        };
        let intent = BackendIntent {
            id: id.clone(),
            client_secret,
            status: IntentStatus::Created,
            amount: Some(request.amount),
            amount_captured: None,
        };
        state.intents.insert(
            id.clone(),
            StoredIntent {
                amount: request.amount,
                intent: intent.clone(),
            },
        );
        if let Some(key) = &request.idempotency_key {
            state.by_idempotency_key.insert(key.clone(), id);
        }
        Ok(intent)
    }

    async fn capture_payment_intent(
        &self,
        intent_id: &str,
        request: &CaptureRequest,
    ) -> Result<BackendIntent, BackendError> {
        let delay = *self.capture_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        state.captures.push(RecordedCapture {
            intent_id: intent_id.to_string(),
            amount: request.amount,
            idempotency_key: request.idempotency_key.clone(),
        });
        if let Some(error) = self.capture_error.write().await.take() {
            return Err(error);
        }

        let stored = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| Self::not_found(intent_id))?;
        match stored.intent.status {
            IntentStatus::Captured => return Ok(stored.intent.clone()),
            status if status.is_terminal() => {
                return Err(Self::unexpected_state(intent_id, status))
            }
            _ => {}
        }

        let amount = request.amount.unwrap_or(stored.amount);
        if amount > stored.amount {
            return Err(BackendError::Rejected {
                status: 400,
                code: Some("amount_too_large".to_string()),
                message: format!(
                    "Capture amount {} exceeds authorized {}",
                    amount, stored.amount
                ),
            });
        }
        stored.intent.status = IntentStatus::Captured;
        stored.intent.amount_captured = Some(amount);
        Ok(stored.intent.clone())
    }

    async fn cancel_payment_intent(
        &self,
        intent_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<BackendIntent, BackendError> {
        let mut state = self.state.write().await;
        state.cancels.push(RecordedCancel {
            intent_id: intent_id.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
        });
        if let Some(error) = self.cancel_error.write().await.take() {
            return Err(error);
        }

        let stored = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| Self::not_found(intent_id))?;
        match stored.intent.status {
            IntentStatus::Cancelled => Ok(stored.intent.clone()),
            IntentStatus::Captured => Err(Self::unexpected_state(intent_id, IntentStatus::Captured)),
            _ => {
                stored.intent.status = IntentStatus::Cancelled;
                Ok(stored.intent.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::CaptureMethod;

    fn create_request(amount: u64) -> CreateIntentRequest {
        CreateIntentRequest {
            amount,
            currency: "usd".to_string(),
            capture_method: CaptureMethod::Manual,
            booking_ref: None,
            metadata: HashMap::new(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_idempotent_create_replays_intent() {
        let backend = MockPaymentBackend::new();
        let mut request = create_request(1000);
        request.idempotency_key = Some("order-1".to_string());

        let first = backend.create_payment_intent(&request).await.unwrap();
        let second = backend.create_payment_intent(&request).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(backend.create_count().await, 2);
    }

    #[tokio::test]
    async fn test_capture_rules() {
        let backend = MockPaymentBackend::new();
        let intent = backend
            .create_payment_intent(&create_request(1000))
            .await
            .unwrap();

        let too_much = CaptureRequest {
            amount: Some(1500),
            idempotency_key: None,
        };
        assert!(matches!(
            backend.capture_payment_intent(&intent.id, &too_much).await,
            Err(BackendError::Rejected { status: 400, .. })
        ));

        let captured = backend
            .capture_payment_intent(&intent.id, &CaptureRequest::default())
            .await
            .unwrap();
        assert_eq!(captured.status, IntentStatus::Captured);
        assert_eq!(captured.amount_captured, Some(1000));

        assert!(matches!(
            backend
                .capture_payment_intent("pi_unknown", &CaptureRequest::default())
                .await,
            Err(BackendError::Rejected { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let backend = MockPaymentBackend::new();
        let intent = backend
            .create_payment_intent(&create_request(1000))
            .await
            .unwrap();

        for _ in 0..2 {
            let cancelled = backend
                .cancel_payment_intent(&intent.id, Some("k:cancel"))
                .await
                .unwrap();
            assert_eq!(cancelled.status, IntentStatus::Cancelled);
        }
        assert_eq!(backend.cancels().await.len(), 2);
        assert!(backend
            .capture_payment_intent(&intent.id, &CaptureRequest::default())
            .await
            .is_err());
    }
}
