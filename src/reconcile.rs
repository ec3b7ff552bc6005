//! Marker Reconciliation
//!
//! Removes the leader marker from every candidate that is not the lease
//! holder. This is what repairs markers left behind by a leader that
//! crashed before it could clear its own, or by two leaders racing.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::WolfElectConfig;
use crate::error::Result;
use crate::store::ObjectStore;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Candidates found carrying the marker
    pub marked: usize,
    /// Markers removed
    pub cleared: Vec<String>,
    /// Candidates whose marker could not be removed
    pub failed: Vec<String>,
    /// The listing itself failed; nothing was touched
    pub skipped: bool,
}

/// Clears stale leader markers
pub struct MarkerReconciler {
    store: Arc<dyn ObjectStore>,
    lease_name: String,
    key: String,
    value: String,
    period: Duration,
}

impl MarkerReconciler {
    /// Create a new reconciler
    pub fn new(
        store: Arc<dyn ObjectStore>,
        lease_name: String,
        key: String,
        value: String,
        period: Duration,
    ) -> Self {
        Self {
            store,
            lease_name,
            key,
            value,
            period,
        }
    }

    /// Create a reconciler for the configured lease and marker
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &WolfElectConfig) -> Self {
        Self::new(
            store,
            config.election.lease_name.clone(),
            config.marker.key.clone(),
            config.marker.value.clone(),
            config.reconcile_period(),
        )
    }

    /// Marker key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Marker value that denotes the leader
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Clear the marker on every marked candidate other than `holder`.
    ///
    /// Idempotent: a second call with no external change writes nothing.
    pub async fn reconcile(&self, holder: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut candidates = match self.store.list_candidates_by_marker(&self.key, &self.value).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("List candidates for cleanup: {}", e);
                report.skipped = true;
                return report;
            }
        };

        while let Some(candidate) = candidates.next().await {
            let candidate = match candidate {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("List candidates for cleanup: {}", e);
                    report.skipped = true;
                    break;
                }
            };
            report.marked += 1;

            if candidate == holder {
                continue;
            }

            match self.store.set_candidate_marker(&candidate, &self.key, None).await {
                Ok(()) => {
                    tracing::info!("Removed stale leader marker from {} (holder={})", candidate, holder);
                    report.cleared.push(candidate);
                }
                Err(e) => {
                    tracing::warn!("Remove stale leader marker from {}: {}", candidate, e);
                    report.failed.push(candidate);
                }
            }
        }

        report
    }

    /// Read the live lease holder (empty when released)
    pub async fn current_holder(&self) -> Result<String> {
        let (lease, _) = self.store.get_lease(&self.lease_name).await?;
        Ok(lease.holder_identity)
    }

    /// Reconcile against the live lease holder once per period until
    /// `token` is cancelled. The first pass happens one period after start.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let holder = tokio::select! {
                _ = token.cancelled() => break,
                holder = self.current_holder() => holder,
            };
            let holder = match holder {
                Ok(holder) => holder,
                Err(e) => {
                    tracing::warn!("Read lease holder: {}", e);
                    continue;
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                report = self.reconcile(&holder) => {
                    tracing::debug!(
                        "Reconciled markers: {} marked, {} cleared, {} failed",
                        report.marked,
                        report.cleared.len(),
                        report.failed.len()
                    );
                }
            }
        }

        tracing::debug!("Marker reconciliation stopped");
    }
}
