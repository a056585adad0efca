//! Discovered readers and the outcome of the last scan.
//!
//! "No hardware nearby" and "discovery transport failed" both leave an empty
//! reader list, so the diagnostic is tracked beside the list.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::metrics;
use crate::reader::{DiscoveryRequest, Reader, ReaderSdk};

/// Outcome class of a discovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Ok,
    NoReaders,
    Error,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::Ok => "ok",
            DiscoveryStatus::NoReaders => "no_readers",
            DiscoveryStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDiagnostic {
    pub status: DiscoveryStatus,
    pub message: String,
    pub scanned_at: DateTime<Utc>,
}

impl DiscoveryDiagnostic {
    fn new(status: DiscoveryStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            scanned_at: Utc::now(),
        }
    }
}

/// Result of a successful scan. An empty list is a success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub readers: Vec<Reader>,
    pub diagnostic: DiscoveryDiagnostic,
}

#[derive(Debug, Default)]
struct Snapshot {
    readers: Vec<Reader>,
    diagnostic: Option<DiscoveryDiagnostic>,
}

/// Set of readers seen by the most recent scan.
pub struct ReaderRegistry {
    sdk: Arc<dyn ReaderSdk>,
    snapshot: RwLock<Snapshot>,
}

impl ReaderRegistry {
    pub fn new(sdk: Arc<dyn ReaderSdk>) -> Self {
        Self {
            sdk,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Scan for readers, replacing the previous snapshot whatever the outcome.
    ///
    /// Transport failures and timeouts empty the snapshot, record an `error`
    /// diagnostic and are returned as errors. Zero readers is `Ok`.
    pub async fn discover(
        &self,
        request: &DiscoveryRequest,
        timeout: Duration,
    ) -> Result<DiscoveryReport, OrchestratorError> {
        debug!(
            driver = self.sdk.name(),
            simulated = request.simulated,
            location = ?request.location_id,
            "Discovering readers"
        );

        let result = match tokio::time::timeout(timeout, self.sdk.discover_readers(request)).await
        {
            Ok(Ok(readers)) => Ok(readers),
            Ok(Err(e)) => Err(OrchestratorError::from_reader(e, "discover_readers")),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "discover_readers",
                after_ms: Some(timeout.as_millis() as u64),
            }),
        };

        let mut snapshot = self.snapshot.write().await;
        match result {
            Ok(readers) => {
                let diagnostic = if readers.is_empty() {
                    DiscoveryDiagnostic::new(DiscoveryStatus::NoReaders, "No readers found")
                } else {
                    DiscoveryDiagnostic::new(
                        DiscoveryStatus::Ok,
                        format!("Found {} reader(s)", readers.len()),
                    )
                };
                info!(count = readers.len(), status = diagnostic.status.as_str(), "Discovery finished");
                metrics::DISCOVERIES
                    .with_label_values(&[diagnostic.status.as_str()])
                    .inc();

                snapshot.readers = readers.clone();
                snapshot.diagnostic = Some(diagnostic.clone());
                Ok(DiscoveryReport {
                    readers,
                    diagnostic,
                })
            }
            Err(e) => {
                warn!(error = %e, "Discovery failed");
                metrics::DISCOVERIES
                    .with_label_values(&[DiscoveryStatus::Error.as_str()])
                    .inc();

                snapshot.readers.clear();
                snapshot.diagnostic =
                    Some(DiscoveryDiagnostic::new(DiscoveryStatus::Error, e.to_string()));
                Err(e)
            }
        }
    }

    /// Look up a reader from the latest scan.
    pub async fn find(&self, reader_id: &str) -> Option<Reader> {
        self.snapshot
            .read()
            .await
            .readers
            .iter()
            .find(|r| r.id == reader_id)
            .cloned()
    }

    pub async fn readers(&self) -> Vec<Reader> {
        self.snapshot.read().await.readers.clone()
    }

    /// `None` until the first scan.
    pub async fn last_discovery_diagnostic(&self) -> Option<DiscoveryDiagnostic> {
        self.snapshot.read().await.diagnostic.clone()
    }

    /// Forget everything, as on session teardown.
    pub async fn clear(&self) {
        *self.snapshot.write().await = Snapshot::default();
    }
}
