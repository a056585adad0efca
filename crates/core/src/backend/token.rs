//! Connection tokens minted by the payment backend.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendError, ConnectionToken, ConnectionTokenSource, PaymentBackend};

/// Fetches a fresh token from the backend on every call. Nothing is cached.
pub struct BackendTokenSource {
    backend: Arc<dyn PaymentBackend>,
}

impl BackendTokenSource {
    pub fn new(backend: Arc<dyn PaymentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ConnectionTokenSource for BackendTokenSource {
    async fn fetch_token(&self) -> Result<ConnectionToken, BackendError> {
        let token = self.backend.create_connection_token().await?;
        debug!(backend = self.backend.name(), "Fetched connection token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPaymentBackend;

    #[tokio::test]
    async fn test_every_fetch_mints_new_token() {
        let backend = Arc::new(MockPaymentBackend::new());
        let source = BackendTokenSource::new(backend.clone());

        let first = source.fetch_token().await.unwrap();
        let second = source.fetch_token().await.unwrap();

        assert_ne!(first.secret, second.secret);
        assert_eq!(backend.token_requests().await, 2);
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let backend = Arc::new(MockPaymentBackend::new());
        backend.fail_next_token(BackendError::Timeout).await;
        let source = BackendTokenSource::new(backend);

        assert_eq!(source.fetch_token().await.unwrap_err(), BackendError::Timeout);
    }
}
