//! HTTP/JSON payment backend implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::metrics;
use crate::payment::IntentStatus;

use super::normalize::{normalize_intent, normalize_token, parse_rejection};
use super::{
    BackendError, BackendIntent, CaptureRequest, ConnectionToken, CreateIntentRequest,
    PaymentBackend,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Payment backend reached over HTTP.
pub struct HttpPaymentBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpPaymentBackend {
    /// Create a new HTTP backend client.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Get the base URL without trailing slash.
    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        }
    }

    /// POST a JSON body and return the parsed JSON answer.
    ///
    /// 5xx, 408 and 429 answers are transport failures (outcome unknown);
    /// other non-2xx answers are business rejections.
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        endpoint: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url(), endpoint);
        let started = Instant::now();

        let result = self.send(&url, body, idempotency_key).await;

        metrics::BACKEND_REQUEST_DURATION
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
        let status_label = match &result {
            Ok(_) => "success",
            Err(e) => e.label(),
        };
        metrics::BACKEND_REQUESTS
            .with_label_values(&[operation, status_label])
            .inc();

        match &result {
            Ok(_) => debug!(operation, "Payment backend request succeeded"),
            Err(e) => warn!(operation, error = %e, "Payment backend request failed"),
        }

        result
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut request = self.authorize(self.client.post(url)).json(body);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            return serde_json::from_str(&text)
                .map_err(|e| BackendError::InvalidResponse(format!("body is not JSON: {}", e)));
        }

        let code = status.as_u16();
        if status.is_server_error() || code == 408 || code == 429 {
            return Err(BackendError::Transport(format!(
                "HTTP {}: {}",
                code,
                text.chars().take(100).collect::<String>()
            )));
        }

        Err(parse_rejection(code, &text))
    }
}

/// Wire body for intent creation: the canonical request plus the tenant.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TenantBody<'a, T: Serialize> {
    tenant_id: &'a str,
    #[serde(flatten)]
    inner: &'a T,
}

/// Path-safe intent id. Backend ids are opaque; anything outside the usual
/// alphabet is refused rather than escaped.
fn intent_path(intent_id: &str, action: &str) -> Result<String, BackendError> {
    let valid = !intent_id.is_empty()
        && intent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(BackendError::Rejected {
            status: 400,
            code: Some("invalid_intent_id".to_string()),
            message: format!("invalid payment intent id '{}'", intent_id),
        });
    }
    Ok(format!("/payment-intents/{}/{}", intent_id, action))
}

#[async_trait]
impl PaymentBackend for HttpPaymentBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_connection_token(&self) -> Result<ConnectionToken, BackendError> {
        let body = json!({ "tenantId": self.config.tenant_id });
        let value = self
            .post_json("connection_token", "/connection-tokens", &body, None)
            .await?;
        normalize_token(value)
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<BackendIntent, BackendError> {
        let body = TenantBody {
            tenant_id: &self.config.tenant_id,
            inner: request,
        };
        let value = self
            .post_json(
                "create_intent",
                "/payment-intents",
                &body,
                request.idempotency_key.as_deref(),
            )
            .await?;
        let intent = normalize_intent(value, IntentStatus::Created)?;
        if intent.client_secret.is_none() {
            return Err(BackendError::InvalidResponse(format!(
                "payment intent {} has no client secret",
                intent.id
            )));
        }
        Ok(intent)
    }

    async fn capture_payment_intent(
        &self,
        intent_id: &str,
        request: &CaptureRequest,
    ) -> Result<BackendIntent, BackendError> {
        let endpoint = intent_path(intent_id, "capture")?;
        let body = TenantBody {
            tenant_id: &self.config.tenant_id,
            inner: request,
        };
        let value = self
            .post_json(
                "capture_intent",
                &endpoint,
                &body,
                request.idempotency_key.as_deref(),
            )
            .await?;
        normalize_intent(value, IntentStatus::Captured)
    }

    async fn cancel_payment_intent(
        &self,
        intent_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<BackendIntent, BackendError> {
        let endpoint = intent_path(intent_id, "cancel")?;
        let body = json!({ "tenantId": self.config.tenant_id });
        let value = self
            .post_json("cancel_intent", &endpoint, &body, idempotency_key)
            .await?;
        normalize_intent(value, IntentStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::CaptureMethod;
    use std::collections::HashMap;

    fn config(url: &str) -> BackendConfig {
        BackendConfig {
            url: url.to_string(),
            tenant_id: "acme".to_string(),
            api_key: Some("sk_test".to_string()),
            timeout_secs: 2,
        }
    }

    #[test]
    fn test_base_url_trims_slash() {
        let backend = HttpPaymentBackend::new(config("http://localhost:4000/api/")).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:4000/api");
        assert_eq!(backend.name(), "http");
    }

    #[test]
    fn test_tenant_body_flattens_request() {
        let request = CreateIntentRequest {
            amount: 1000,
            currency: "usd".to_string(),
            capture_method: CaptureMethod::Manual,
            booking_ref: None,
            metadata: HashMap::new(),
            idempotency_key: Some("k".to_string()),
        };
        let body = TenantBody {
            tenant_id: "acme",
            inner: &request,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tenantId"], "acme");
        assert_eq!(json["amount"], 1000);
        assert_eq!(json["captureMethod"], "manual");
        assert!(json.get("bookingRef").is_none());
    }

    #[test]
    fn test_intent_path_validation() {
        assert_eq!(
            intent_path("pi_123", "capture").unwrap(),
            "/payment-intents/pi_123/capture"
        );
        assert!(intent_path("", "cancel").is_err());
        assert!(intent_path("../admin", "cancel").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let backend = HttpPaymentBackend::new(config("http://127.0.0.1:1")).unwrap();
        let err = backend.create_connection_token().await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Transport(_) | BackendError::Timeout
        ));
    }
}
