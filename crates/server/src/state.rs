use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use tapline_core::{
    Config, PaymentBackend, PaymentOrchestrator, ReaderDriver, ReaderSdk, SanitizedConfig,
    SimulatedReaderSdk,
};

use crate::metrics::{CHECKOUTS_ACTIVE, CHECKOUTS_CREATED_TOTAL};

/// Builds the reader SDK for a new checkout.
pub type ReaderFactory = Arc<dyn Fn() -> Arc<dyn ReaderSdk> + Send + Sync>;

/// One checkout: a terminal session behind an id.
pub struct Checkout {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub orchestrator: PaymentOrchestrator,
}

/// Shared application state
pub struct AppState {
    config: Config,
    backend: Arc<dyn PaymentBackend>,
    reader_factory: ReaderFactory,
    checkouts: RwLock<HashMap<String, Arc<Checkout>>>,
}

impl AppState {
    /// State whose checkouts drive the reader driver named in the config.
    pub fn new(config: Config, backend: Arc<dyn PaymentBackend>) -> Self {
        let factory: ReaderFactory = match config.terminal.driver {
            ReaderDriver::Simulated => {
                Arc::new(|| Arc::new(SimulatedReaderSdk::new()) as Arc<dyn ReaderSdk>)
            }
        };
        Self::with_reader_factory(config, backend, factory)
    }

    pub fn with_reader_factory(
        config: Config,
        backend: Arc<dyn PaymentBackend>,
        reader_factory: ReaderFactory,
    ) -> Self {
        Self {
            config,
            backend,
            reader_factory,
            checkouts: RwLock::new(HashMap::new()),
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    /// Open a new checkout with its own session and reader SDK.
    pub async fn create_checkout(&self) -> Arc<Checkout> {
        let checkout = Arc::new(Checkout {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            orchestrator: PaymentOrchestrator::new(
                &self.config.terminal,
                (self.reader_factory)(),
                Arc::clone(&self.backend),
            ),
        });

        let mut checkouts = self.checkouts.write().await;
        checkouts.insert(checkout.id.clone(), Arc::clone(&checkout));
        CHECKOUTS_CREATED_TOTAL.inc();
        CHECKOUTS_ACTIVE.set(checkouts.len() as i64);
        info!(checkout_id = %checkout.id, "Checkout opened");
        checkout
    }

    pub async fn checkout(&self, id: &str) -> Option<Arc<Checkout>> {
        self.checkouts.read().await.get(id).cloned()
    }

    pub async fn checkouts(&self) -> Vec<Arc<Checkout>> {
        self.checkouts.read().await.values().cloned().collect()
    }

    pub async fn remove_checkout(&self, id: &str) -> Option<Arc<Checkout>> {
        let mut checkouts = self.checkouts.write().await;
        let removed = checkouts.remove(id);
        CHECKOUTS_ACTIVE.set(checkouts.len() as i64);
        if removed.is_some() {
            info!(checkout_id = %id, "Checkout closed");
        }
        removed
    }

    /// End every open checkout. Used on shutdown.
    pub async fn end_all_checkouts(&self) {
        let drained: Vec<_> = self.checkouts.write().await.drain().collect();
        CHECKOUTS_ACTIVE.set(0);
        for (id, checkout) in drained {
            // A held collection would refuse the teardown.
            if let Err(failure) = checkout.orchestrator.cancel_collection().await {
                debug!(checkout_id = %id, error = %failure, "Failed to cancel collection on shutdown");
            }
            if let Err(failure) = checkout.orchestrator.end_checkout().await {
                warn!(checkout_id = %id, error = %failure, "Failed to end checkout on shutdown");
            }
        }
    }
}
