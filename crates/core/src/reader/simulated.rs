//! Simulated reader driver.
//!
//! Answers simulated discovery scans with a fixed device list, approves every
//! collection after a short delay and honors `cancel_collect`. Live scans find
//! nothing, so a session configured for real hardware sees `no_readers`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, info};

use crate::backend::ConnectionToken;
use crate::payment::{CaptureMethod, IntentStatus};

use super::{
    CollectRequest, CollectedPaymentMethod, ConfirmedPayment, DiscoveryRequest, Reader,
    ReaderError, ReaderEvent, ReaderSdk, ReaderStatus,
};

/// Simulated reader SDK.
pub struct SimulatedReaderSdk {
    readers: Vec<Reader>,
    connected: RwLock<Option<Reader>>,
    collect_delay: Duration,
    cancel_requested: AtomicBool,
    cancel: Notify,
    method_counter: AtomicU64,
    events: broadcast::Sender<ReaderEvent>,
}

impl Default for SimulatedReaderSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedReaderSdk {
    /// One online simulated device.
    pub fn new() -> Self {
        Self::with_readers(vec![Self::default_reader()])
    }

    /// Custom device list.
    pub fn with_readers(readers: Vec<Reader>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            readers,
            connected: RwLock::new(None),
            collect_delay: Duration::from_millis(250),
            cancel_requested: AtomicBool::new(false),
            cancel: Notify::new(),
            method_counter: AtomicU64::new(0),
            events,
        }
    }

    /// How long the simulated cardholder takes to present a card.
    pub fn with_collect_delay(mut self, delay: Duration) -> Self {
        self.collect_delay = delay;
        self
    }

    fn default_reader() -> Reader {
        Reader {
            id: "tmr_simulated_wpe".to_string(),
            label: "Simulated WisePOS E".to_string(),
            serial_number: "WSC513105011295".to_string(),
            device_type: "simulated_wisepos_e".to_string(),
            status: ReaderStatus::Online,
            last_seen_at: Utc::now(),
            location_id: None,
        }
    }

    /// Drop the connection as if the reader lost power.
    pub async fn simulate_disconnect(&self) {
        let reader = self.connected.write().await.take();
        if let Some(reader) = reader {
            info!(reader_id = %reader.id, "Simulated reader dropped connection");
            self.cancel_requested.store(true, Ordering::SeqCst);
            self.cancel.notify_waiters();
            let _ = self
                .events
                .send(ReaderEvent::UnexpectedDisconnect { reader_id: reader.id });
        }
    }

    async fn require_connected(&self) -> Result<Reader, ReaderError> {
        self.connected
            .read()
            .await
            .clone()
            .ok_or(ReaderError::Disconnected)
    }
}

#[async_trait]
impl ReaderSdk for SimulatedReaderSdk {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn discover_readers(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<Vec<Reader>, ReaderError> {
        if !request.simulated {
            debug!("Live discovery requested from simulated driver, no hardware present");
            return Ok(Vec::new());
        }

        let now = Utc::now();
        Ok(self
            .readers
            .iter()
            .filter(|r| match (&request.location_id, &r.location_id) {
                (Some(wanted), Some(actual)) => wanted == actual,
                (Some(_), None) => true,
                (None, _) => true,
            })
            .map(|r| Reader {
                last_seen_at: now,
                ..r.clone()
            })
            .collect())
    }

    async fn connect(
        &self,
        reader: &Reader,
        token: &ConnectionToken,
    ) -> Result<Reader, ReaderError> {
        if token.secret.is_empty() {
            return Err(ReaderError::ConnectionFailed(
                "empty connection token".to_string(),
            ));
        }

        let known = self
            .readers
            .iter()
            .find(|r| r.id == reader.id)
            .ok_or_else(|| ReaderError::ConnectionFailed(format!("unknown reader {}", reader.id)))?;
        if !known.is_online() {
            return Err(ReaderError::ConnectionFailed(format!(
                "reader {} is offline",
                reader.id
            )));
        }

        let connected = Reader {
            last_seen_at: Utc::now(),
            ..known.clone()
        };
        *self.connected.write().await = Some(connected.clone());
        Ok(connected)
    }

    async fn disconnect(&self) {
        self.connected.write().await.take();
    }

    async fn collect_payment_method(
        &self,
        request: &CollectRequest,
    ) -> Result<CollectedPaymentMethod, ReaderError> {
        self.require_connected().await?;
        self.cancel_requested.store(false, Ordering::SeqCst);

        let _ = self.events.send(ReaderEvent::DisplayMessage {
            message: "Insert, tap or swipe card".to_string(),
        });

        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if !self.cancel_requested.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(self.collect_delay) => {}
                _ = &mut cancelled => {}
            }
        }

        if self.cancel_requested.swap(false, Ordering::SeqCst) {
            self.require_connected().await?;
            return Err(ReaderError::Cancelled);
        }
        self.require_connected().await?;

        let n = self.method_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CollectedPaymentMethod {
            intent_id: request.intent_id.clone(),
            payment_method_id: format!("pm_sim_{:06}", n),
            capture_method: request.capture_method,
            amount: request.amount,
            card_brand: Some("visa".to_string()),
            last4: Some("4242".to_string()),
        })
    }

    async fn cancel_collect(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    async fn confirm_payment(
        &self,
        method: &CollectedPaymentMethod,
    ) -> Result<ConfirmedPayment, ReaderError> {
        self.require_connected().await?;
        let _ = self.events.send(ReaderEvent::DisplayMessage {
            message: "Approved".to_string(),
        });

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
