//! Supervisor
//!
//! Owns the process-wide cancellation token, runs the election engine and
//! turns its leadership events into marker and status side effects. The
//! periodic reconciliation task only exists while this candidate leads.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WolfElectConfig;
use crate::election::{ElectionEngine, EngineConfig, LeadershipEvent};
use crate::reconcile::MarkerReconciler;
use crate::status::StatusPublisher;
use crate::store::ObjectStore;

/// Leadership events buffered between the engine and the supervisor
const EVENT_CAPACITY: usize = 16;

/// Periodic reconciliation bound to one leadership term
struct ReconcileTask {
    scope: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconcileTask {
    async fn stop(self) {
        self.scope.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Marker reconciliation task failed: {}", e);
        }
    }
}

/// Wires the election engine to marker reconciliation and status publishing
pub struct Supervisor {
    identity: String,
    store: Arc<dyn ObjectStore>,
    engine: Arc<ElectionEngine>,
    reconciler: Arc<MarkerReconciler>,
    publisher: StatusPublisher,
    cleanup_timeout: Duration,
    token: CancellationToken,
}

impl Supervisor {
    /// Build every component from a validated configuration
    pub fn new(config: &WolfElectConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self::with_components(
            config.identity().to_string(),
            Arc::clone(&store),
            EngineConfig::from_config(config),
            MarkerReconciler::from_config(Arc::clone(&store), config),
            StatusPublisher::from_config(store, config),
        )
    }

    /// Build from explicitly configured components
    pub fn with_components(
        identity: String,
        store: Arc<dyn ObjectStore>,
        engine_config: EngineConfig,
        reconciler: MarkerReconciler,
        publisher: StatusPublisher,
    ) -> Self {
        let cleanup_timeout = engine_config.renew_deadline;
        let engine = Arc::new(ElectionEngine::new(
            identity.clone(),
            Arc::clone(&store),
            engine_config,
        ));

        Self {
            identity,
            store,
            engine,
            reconciler: Arc::new(reconciler),
            publisher,
            cleanup_timeout,
            token: CancellationToken::new(),
        }
    }

    /// The election engine, for status reporting
    pub fn engine(&self) -> Arc<ElectionEngine> {
        Arc::clone(&self.engine)
    }

    /// Cancelling this token shuts the supervisor down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run until the shutdown token is cancelled and every background task
    /// has stopped.
    pub async fn run(self) {
        let (tx, mut events) = mpsc::channel(EVENT_CAPACITY);
        let election = {
            let engine = Arc::clone(&self.engine);
            let token = self.token.clone();
            tokio::spawn(async move { engine.run(token, tx).await })
        };

        let mut reconciling: Option<ReconcileTask> = None;

        // The channel closes once the engine has returned
        while let Some(event) = events.recv().await {
            if let Some(task) = reconciling.take() {
                task.stop().await;
            }

            match event {
                LeadershipEvent::BecameLeader(identity) => {
                    reconciling = self.on_became_leader(&identity).await;
                }
                LeadershipEvent::LostLeadership => {
                    self.on_lost_leadership().await;
                }
            }
        }

        if let Some(task) = reconciling.take() {
            task.stop().await;
        }
        if let Err(e) = election.await {
            tracing::error!("Election task failed: {}", e);
        }

        tracing::info!("Supervisor for {} stopped", self.identity);
    }

    /// Mark ourselves, clean up everyone else and publish, then start the
    /// periodic reconciliation. Returns `None` if shut down midway.
    async fn on_became_leader(&self, identity: &str) -> Option<ReconcileTask> {
        let scope = self.token.child_token();

        let initial = async {
            if let Err(e) = self
                .store
                .set_candidate_marker(identity, self.reconciler.key(), Some(self.reconciler.value()))
                .await
            {
                tracing::warn!("Add leader marker to {}: {}", identity, e);
            }
            self.reconciler.reconcile(identity).await;
            self.publisher.publish(identity).await;
        };

        tokio::select! {
            _ = scope.cancelled() => {
                tracing::info!("Shutdown during leadership setup");
                return None;
            }
            _ = initial => {}
        }

        let handle = {
            let reconciler = Arc::clone(&self.reconciler);
            let scope = scope.clone();
            tokio::spawn(async move { reconciler.run(scope).await })
        };

        Some(ReconcileTask { scope, handle })
    }

    /// Remove our own marker and clear the status record. Runs outside the
    /// (possibly cancelled) leadership scope, bounded by the renew deadline.
    async fn on_lost_leadership(&self) {
        let cleanup = async {
            if let Err(e) = self
                .store
                .set_candidate_marker(&self.identity, self.reconciler.key(), None)
                .await
            {
                tracing::warn!("Remove leader marker from {}: {}", self.identity, e);
            }
            self.publisher.withdraw(&self.identity).await;
        };

        if tokio::time::timeout(self.cleanup_timeout, cleanup).await.is_err() {
            tracing::warn!(
                "Cleanup after losing leadership did not finish within {:?}",
                self.cleanup_timeout
            );
        }
    }
}
