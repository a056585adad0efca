//! Common test utilities for API testing with mocks.
//!
//! Builds the router in-process over a `MockPaymentBackend` and a reader
//! factory that hands every checkout a fast `SimulatedReaderSdk`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use tapline_core::{
    testing::MockPaymentBackend, BackendConfig, Config, ReaderSdk, ServerConfig,
    SimulatedReaderSdk,
};
use tapline_server::state::{AppState, ReaderFactory};

/// Re-export fixtures for test convenience
pub use tapline_core::testing::fixtures;

/// Id of the device a `SimulatedReaderSdk` discovers.
pub const SIMULATED_READER_ID: &str = "tmr_simulated_wpe";

/// Test fixture with a controllable payment backend.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFixture::new().await;
/// let checkout_id = fixture.connected_checkout().await;
///
/// let response = fixture
///     .post(&format!("/api/v1/checkouts/{}/payments", checkout_id), json!({
///         "amount": 2500,
///         "currency": "usd"
///     }))
///     .await;
/// assert_eq!(response.status, StatusCode::OK);
/// ```
pub struct TestFixture {
    pub router: Router,
    pub state: Arc<AppState>,
    /// Mock backend - fail calls and inspect captures/cancels
    pub backend: Arc<MockPaymentBackend>,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Fixture whose simulated cardholder presents a card after 20ms.
    pub async fn new() -> Self {
        Self::with_collect_delay(Duration::from_millis(20)).await
    }

    pub async fn with_collect_delay(delay: Duration) -> Self {
        let backend = Arc::new(MockPaymentBackend::new());

        let config = Config {
            server: ServerConfig::default(),
            backend: BackendConfig {
                url: "http://127.0.0.1:9".to_string(),
                tenant_id: "acme-rentals".to_string(),
                api_key: None,
                timeout_secs: 5,
            },
            terminal: fixtures::terminal_config(),
        };

        let factory: ReaderFactory = Arc::new(move || {
            Arc::new(SimulatedReaderSdk::new().with_collect_delay(delay)) as Arc<dyn ReaderSdk>
        });

        let state = Arc::new(AppState::with_reader_factory(
            config,
            Arc::clone(&backend) as Arc<dyn tapline_core::PaymentBackend>,
            factory,
        ));
        let router = tapline_server::api::create_router(Arc::clone(&state));

        Self {
            router,
            state,
            backend,
        }
    }

    /// Create a checkout and return its id.
    pub async fn checkout(&self) -> String {
        let response = self.post_empty("/api/v1/checkouts").await;
        assert_eq!(response.status, StatusCode::CREATED);
        response.body["checkout_id"]
            .as_str()
            .expect("checkout_id missing")
            .to_string()
    }

    /// Create a checkout and drive it to `connected` on the simulated reader.
    pub async fn connected_checkout(&self) -> String {
        let id = self.checkout().await;

        let response = self
            .post_empty(&format!("/api/v1/checkouts/{}/initialize", id))
            .await;
        assert_eq!(response.status, StatusCode::OK, "{:?}", response.body);

        let response = self
            .post_empty(&format!("/api/v1/checkouts/{}/readers/discover", id))
            .await;
        assert_eq!(response.status, StatusCode::OK, "{:?}", response.body);

        let response = self
            .post(
                &format!("/api/v1/checkouts/{}/readers/connect", id),
                serde_json::json!({ "reader_id": SIMULATED_READER_ID }),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "{:?}", response.body);
        assert_eq!(response.body["state"], "connected");

        id
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    /// Send a POST request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}
