//! Election engine
//!
//! Drives the acquire / renew / release cycle for one candidate. Mutual
//! exclusion comes entirely from the store's version-checked lease writes;
//! the engine itself keeps no lock other than its snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::{ElectionSnapshot, ElectionState, EngineConfig, LeadershipEvent};
use crate::error::{Error, Result};
use crate::store::{duration_to_secs, Lease, ObjectStore};

/// Upper bound of the random extension added to idle retry sleeps
const JITTER_FACTOR: f64 = 0.1;

/// Result of one acquisition or renewal attempt
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    /// The lease is now recorded as ours
    Held,
    /// Someone else holds a lease we may not take
    HeldByOther(String),
}

/// Lease election engine
pub struct ElectionEngine {
    /// This candidate's identity
    identity: String,
    /// Shared store holding the lease
    store: Arc<dyn ObjectStore>,
    /// Timings
    config: EngineConfig,
    /// Last observed state
    snapshot: RwLock<ElectionSnapshot>,
}

impl ElectionEngine {
    /// Create a new election engine
    pub fn new(identity: String, store: Arc<dyn ObjectStore>, config: EngineConfig) -> Self {
        let snapshot = ElectionSnapshot {
            identity: identity.clone(),
            state: ElectionState::Idle,
            holder: None,
            leader_transitions: 0,
            last_renewal: None,
        };

        Self {
            identity,
            store,
            config,
            snapshot: RwLock::new(snapshot),
        }
    }

    /// This candidate's identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Lease name and timings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get current state
    pub async fn state(&self) -> ElectionState {
        self.snapshot.read().await.state
    }

    /// Get a copy of the last observed state
    pub async fn snapshot(&self) -> ElectionSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Run the election until `token` is cancelled.
    ///
    /// Every transition is sent on `events`; the sender is dropped when this
    /// returns, which is how consumers learn the engine has stopped.
    pub async fn run(&self, token: CancellationToken, events: mpsc::Sender<LeadershipEvent>) {
        tracing::info!(
            "Starting election for lease {} as {}",
            self.config.lease_name,
            self.identity
        );

        loop {
            if !self.acquire(&token).await {
                break;
            }
            send_event(&events, LeadershipEvent::BecameLeader(self.identity.clone())).await;

            self.renew(&token).await;

            if token.is_cancelled() && self.config.release_on_cancel {
                match tokio::time::timeout(self.config.renew_deadline, self.release()).await {
                    Ok(Ok(())) => tracing::info!("Released lease {}", self.config.lease_name),
                    Ok(Err(e)) => tracing::warn!("Failed to release lease: {}", e),
                    Err(_) => tracing::warn!("Timed out releasing lease {}", self.config.lease_name),
                }
            }

            self.set_state(ElectionState::Idle).await;
            tracing::info!("{}: lost leadership", self.identity);
            send_event(&events, LeadershipEvent::LostLeadership).await;

            if token.is_cancelled() {
                break;
            }
        }

        tracing::info!("Election for {} stopped", self.identity);
    }

    /// Retry acquisition until it succeeds (true) or `token` fires (false)
    async fn acquire(&self, token: &CancellationToken) -> bool {
        loop {
            if token.is_cancelled() {
                return false;
            }

            let attempt = tokio::select! {
                _ = token.cancelled() => return false,
                result = self.try_acquire_or_renew(false) => result,
            };

            match attempt {
                Ok(Attempt::Held) => {
                    self.set_state(ElectionState::Leader).await;
                    tracing::info!("{}: became leader", self.identity);
                    return true;
                }
                Ok(Attempt::HeldByOther(holder)) => {
                    tracing::debug!("Lease {} is held by {}", self.config.lease_name, holder);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!("Lost acquisition race for {}: {}", self.config.lease_name, e);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Failed to acquire lease {}: {}", self.config.lease_name, e);
                }
                Err(e) => {
                    tracing::error!("Unexpected error acquiring lease {}: {}", self.config.lease_name, e);
                }
            }

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(jittered(self.config.retry_period)) => {}
            }
        }
    }

    /// Renew until the lease is lost or `token` fires
    async fn renew(&self, token: &CancellationToken) {
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let remaining = self.config.renew_deadline.saturating_sub(last_renewal.elapsed());
            if remaining.is_zero() {
                tracing::warn!(
                    "Failed to renew lease {} within {:?}",
                    self.config.lease_name,
                    self.config.renew_deadline
                );
                return;
            }

            let attempt = tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::time::timeout(remaining, self.try_acquire_or_renew(true)) => result,
            };

            match attempt {
                Ok(Ok(Attempt::Held)) => {
                    last_renewal = Instant::now();
                    tracing::trace!("Renewed lease {}", self.config.lease_name);
                }
                Ok(Ok(Attempt::HeldByOther(holder))) => {
                    tracing::warn!("Lease {} was taken over by {:?}", self.config.lease_name, holder);
                    return;
                }
                Ok(Err(e)) if e.is_conflict() => {
                    tracing::warn!("Lease renewal conflict: {}", e);
                    return;
                }
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::warn!("Failed to renew lease {}: {}", self.config.lease_name, e);
                }
                Ok(Err(e)) => {
                    tracing::error!("Unexpected error renewing lease {}: {}", self.config.lease_name, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Renewal of lease {} did not complete within {:?}",
                        self.config.lease_name,
                        self.config.renew_deadline
                    );
                    return;
                }
            }
        }
    }

    /// Read the lease and write ourselves in as holder if allowed.
    ///
    /// `leading` selects renewal semantics: only our own lease may be
    /// renewed and the transition counter is left alone. Otherwise the lease
    /// may be taken when vacant or already ours, and the counter goes up.
    async fn try_acquire_or_renew(&self, leading: bool) -> Result<Attempt> {
        let name = &self.config.lease_name;
        let now = Utc::now();

        let (current, version) = match self.store.get_lease(name).await {
            Ok((lease, version)) => (Some(lease), Some(version)),
            Err(e) if e.is_not_found() => (None, None),
            Err(e) => return Err(e),
        };

        match &current {
            Some(lease) => {
                self.observe(lease, false).await;
                let blocked = if leading {
                    !lease.is_held_by(&self.identity)
                } else {
                    !lease.is_vacant(now) && !lease.is_held_by(&self.identity)
                };
                if blocked {
                    return Ok(Attempt::HeldByOther(lease.holder_identity.clone()));
                }
            }
            None if leading => return Ok(Attempt::HeldByOther(String::new())),
            None => {}
        }

        let transitions = current.as_ref().map(|l| l.leader_transitions).unwrap_or(0);
        let next = Lease {
            holder_identity: self.identity.clone(),
            lease_duration_secs: duration_to_secs(self.config.lease_duration),
            acquire_time: match (&current, leading) {
                (Some(lease), true) => lease.acquire_time,
                _ => now,
            },
            renew_time: now,
            leader_transitions: if leading { transitions } else { transitions + 1 },
        };

        self.store
            .compare_and_swap_lease(name, &next, version.as_ref())
            .await?;
        self.observe(&next, true).await;

        Ok(Attempt::Held)
    }

    /// Clear the holder if the lease is still ours
    async fn release(&self) -> Result<()> {
        let name = &self.config.lease_name;
        let (lease, version) = self.store.get_lease(name).await?;
        if !lease.is_held_by(&self.identity) {
            return Err(Error::Conflict(format!(
                "lease/{} is held by {:?}, not releasing",
                name, lease.holder_identity
            )));
        }

        let released = Lease {
            holder_identity: String::new(),
            lease_duration_secs: 1,
            renew_time: Utc::now(),
            ..lease
        };
        self.store
            .compare_and_swap_lease(name, &released, Some(&version))
            .await?;
        self.observe(&released, false).await;

        Ok(())
    }

    async fn observe(&self, lease: &Lease, renewed: bool) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.holder = lease.holder().map(str::to_string);
        snapshot.leader_transitions = lease.leader_transitions;
        if renewed {
            snapshot.last_renewal = Some(lease.renew_time);
        }
    }

    async fn set_state(&self, state: ElectionState) {
        self.snapshot.write().await.state = state;
    }
}

async fn send_event(events: &mpsc::Sender<LeadershipEvent>, event: LeadershipEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("Leadership event receiver dropped");
    }
}

/// Stretch an idle retry interval by a random fraction
fn jittered(period: Duration) -> Duration {
    let extra = rand::thread_rng().gen::<f64>() * JITTER_FACTOR;
    period + period.mul_f64(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::task::JoinHandle;

    const LEASE: &str = "election";

    fn test_config() -> EngineConfig {
        EngineConfig {
            lease_name: LEASE.to_string(),
            lease_duration: Duration::from_secs(1),
            renew_deadline: Duration::from_millis(300),
            retry_period: Duration::from_millis(50),
            release_on_cancel: true,
        }
    }

    fn lease(holder: &str, age_secs: i64, duration: u64, transitions: u64) -> Lease {
        let renewed = Utc::now() - chrono::Duration::seconds(age_secs);
        Lease {
            holder_identity: holder.to_string(),
            lease_duration_secs: duration,
            acquire_time: renewed,
            renew_time: renewed,
            leader_transitions: transitions,
        }
    }

    struct Running {
        engine: Arc<ElectionEngine>,
        token: CancellationToken,
        events: mpsc::Receiver<LeadershipEvent>,
        handle: JoinHandle<()>,
    }

    fn start(identity: &str, store: &Arc<MemoryStore>, config: EngineConfig) -> Running {
        let engine = Arc::new(ElectionEngine::new(identity.to_string(), store.clone(), config));
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let handle = {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            tokio::spawn(async move { engine.run(token, tx).await })
        };
        Running { engine, token, events: rx, handle }
    }

    async fn next_event(events: &mut mpsc::Receiver<LeadershipEvent>) -> Option<LeadershipEvent> {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_jitter_bounds() {
        let period = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(period);
            assert!(d >= period);
            assert!(d <= period.mul_f64(1.0 + JITTER_FACTOR));
        }
    }

    #[tokio::test]
    async fn test_acquires_absent_lease() {
        let store = Arc::new(MemoryStore::new());
        let mut a = start("pod-a", &store, test_config());

        assert_eq!(
            next_event(&mut a.events).await,
            Some(LeadershipEvent::BecameLeader("pod-a".into()))
        );
        let lease = store.lease(LEASE).await.unwrap();
        assert_eq!(lease.holder_identity, "pod-a");
        assert_eq!(lease.leader_transitions, 1);
        assert_eq!(a.engine.state().await, ElectionState::Leader);

        a.token.cancel();
        a.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_takes_over_expired_lease() {
        let store = Arc::new(MemoryStore::new());
        store.put_lease(LEASE, lease("pod-a", 20, 15, 4)).await;

        let mut b = start("pod-b", &store, test_config());
        assert_eq!(
            next_event(&mut b.events).await,
            Some(LeadershipEvent::BecameLeader("pod-b".into()))
        );

        let lease = store.lease(LEASE).await.unwrap();
        assert_eq!(lease.holder_identity, "pod-b");
        assert_eq!(lease.leader_transitions, 5);

        b.token.cancel();
        b.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_valid_lease_blocks_other_identity() {
        let store = Arc::new(MemoryStore::new());
        store.put_lease(LEASE, lease("pod-a", 0, 15, 1)).await;

        let mut b = start("pod-b", &store, test_config());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(b.events.try_recv().is_err());
        assert_eq!(b.engine.state().await, ElectionState::Idle);
        assert_eq!(b.engine.snapshot().await.holder.as_deref(), Some("pod-a"));
        assert_eq!(store.lease(LEASE).await.unwrap().holder_identity, "pod-a");

        b.token.cancel();
        b.handle.await.unwrap();
        // Never led, so nothing to report
        assert!(b.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_returning_holder_counts_transition() {
        let store = Arc::new(MemoryStore::new());
        store.put_lease(LEASE, lease("pod-a", 0, 15, 3)).await;

        let mut a = start("pod-a", &store, test_config());
        assert_eq!(
            next_event(&mut a.events).await,
            Some(LeadershipEvent::BecameLeader("pod-a".into()))
        );
        assert_eq!(store.lease(LEASE).await.unwrap().leader_transitions, 4);

        // Renewals keep the counter
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.lease(LEASE).await.unwrap().leader_transitions, 4);

        a.token.cancel();
        a.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_release_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let mut a = start("pod-a", &store, test_config());
        assert!(matches!(
            next_event(&mut a.events).await,
            Some(LeadershipEvent::BecameLeader(_))
        ));

        a.token.cancel();
        assert_eq!(next_event(&mut a.events).await, Some(LeadershipEvent::LostLeadership));
        a.handle.await.unwrap();

        let lease = store.lease(LEASE).await.unwrap();
        assert_eq!(lease.holder_identity, "");
        assert_eq!(lease.leader_transitions, 1);
        assert_eq!(a.engine.state().await, ElectionState::Idle);
    }

    #[tokio::test]
    async fn test_no_release_keeps_holder() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            release_on_cancel: false,
            ..test_config()
        };
        let mut a = start("pod-a", &store, config);
        assert!(next_event(&mut a.events).await.is_some());

        a.token.cancel();
        assert_eq!(next_event(&mut a.events).await, Some(LeadershipEvent::LostLeadership));
        a.handle.await.unwrap();
        assert_eq!(store.lease(LEASE).await.unwrap().holder_identity, "pod-a");
    }

    #[tokio::test]
    async fn test_takeover_forces_step_down() {
        let store = Arc::new(MemoryStore::new());
        let mut a = start("pod-a", &store, test_config());
        assert!(next_event(&mut a.events).await.is_some());

        store.put_lease(LEASE, lease("pod-z", 0, 15, 9)).await;
        assert_eq!(next_event(&mut a.events).await, Some(LeadershipEvent::LostLeadership));

        // pod-z's lease is still valid, so pod-a stays idle
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.engine.state().await, ElectionState::Idle);
        assert_eq!(store.lease(LEASE).await.unwrap().holder_identity, "pod-z");

        a.token.cancel();
        a.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_conflict_forces_step_down() {
        let store = Arc::new(MemoryStore::new());
        let mut a = start("pod-a", &store, test_config());
        assert!(next_event(&mut a.events).await.is_some());

        // Holder stays pod-a, only the version moves under the renewal
        store.rewrite_before_next_lease_write();
        assert_eq!(next_event(&mut a.events).await, Some(LeadershipEvent::LostLeadership));
        assert_eq!(store.lease(LEASE).await.unwrap().holder_identity, "pod-a");

        // Still our unexpired lease, so it is reacquired as a new term
        assert_eq!(
            next_event(&mut a.events).await,
            Some(LeadershipEvent::BecameLeader("pod-a".into()))
        );
        assert_eq!(store.lease(LEASE).await.unwrap().leader_transitions, 2);

        a.token.cancel();
        a.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_store_past_deadline_steps_down() {
        let store = Arc::new(MemoryStore::new());
        let mut a = start("pod-a", &store, test_config());
        assert!(next_event(&mut a.events).await.is_some());

        let outage = Instant::now();
        store.set_unavailable(true);
        assert_eq!(next_event(&mut a.events).await, Some(LeadershipEvent::LostLeadership));
        assert!(outage.elapsed() < Duration::from_secs(1));

        store.set_unavailable(false);
        // Our own unexpired lease is reacquirable
        assert!(matches!(
            next_event(&mut a.events).await,
            Some(LeadershipEvent::BecameLeader(_))
        ));
        assert_eq!(store.lease(LEASE).await.unwrap().leader_transitions, 2);

        a.token.cancel();
        a.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_winner_among_racers() {
        let store = Arc::new(MemoryStore::new());
        let racers: Vec<Running> = ["a", "b", "c"]
            .iter()
            .map(|id| start(id, &store, test_config()))
            .collect();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut leaders = 0;
        for r in &racers {
            if r.engine.state().await == ElectionState::Leader {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        assert_eq!(store.lease(LEASE).await.unwrap().leader_transitions, 1);

        for r in racers {
            r.token.cancel();
            r.handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failover_after_leader_stops_renewing() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            release_on_cancel: false,
            ..test_config()
        };

        let mut a = start("pod-a", &store, config.clone());
        assert!(next_event(&mut a.events).await.is_some());
        let mut b = start("pod-b", &store, config.clone());

        // Crash: stop renewing without releasing
        let stopped = Instant::now();
        a.token.cancel();
        a.handle.await.unwrap();

        assert_eq!(
            next_event(&mut b.events).await,
            Some(LeadershipEvent::BecameLeader("pod-b".into()))
        );
        // lease duration (rounded to whole seconds) plus a retry period, with slack
        assert!(stopped.elapsed() < Duration::from_millis(2500));
        assert_eq!(store.lease(LEASE).await.unwrap().leader_transitions, 2);

        b.token.cancel();
        b.handle.await.unwrap();
    }
}
