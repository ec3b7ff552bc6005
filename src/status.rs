//! Leader Status Publishing
//!
//! Keeps a shared record naming the current leader for consumers outside
//! the election. One attempt per transition; a stale record is corrected by
//! the next transition.

use std::sync::Arc;

use crate::config::WolfElectConfig;
use crate::error::Result;
use crate::store::{ObjectStore, RecordFields};

/// Writes the leader identity into the shared status record
pub struct StatusPublisher {
    store: Arc<dyn ObjectStore>,
    record_name: String,
    leader_field: String,
}

impl StatusPublisher {
    /// Create a new publisher
    pub fn new(store: Arc<dyn ObjectStore>, record_name: String, leader_field: String) -> Self {
        Self {
            store,
            record_name,
            leader_field,
        }
    }

    /// Create a publisher for the configured status record
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &WolfElectConfig) -> Self {
        Self::new(
            store,
            config.status.record_name.clone(),
            config.status.leader_field.clone(),
        )
    }

    /// Publish `leader` (empty to clear), logging any failure
    pub async fn publish(&self, leader: &str) -> bool {
        match self.try_publish(leader).await {
            Ok(()) => {
                tracing::info!(
                    "Published {}={:?} to {}",
                    self.leader_field,
                    leader,
                    self.record_name
                );
                true
            }
            Err(e) => {
                tracing::warn!("Publish leader to {}: {}", self.record_name, e);
                false
            }
        }
    }

    /// Publish the empty identity unless the record names a different
    /// leader, so a departing leader does not erase its successor.
    ///
    /// The check and the write share one version: if anyone writes the
    /// record in between, the write conflicts and the record is left alone.
    pub async fn withdraw(&self, identity: &str) -> bool {
        let result = match self.store.get_record(&self.record_name).await {
            Ok((mut fields, version)) => {
                let current = fields.get(&self.leader_field).map(String::as_str).unwrap_or("");
                if !current.is_empty() && current != identity {
                    tracing::info!(
                        "{} already names {}, leaving it in place",
                        self.record_name,
                        current
                    );
                    return true;
                }
                fields.insert(self.leader_field.clone(), String::new());
                self.store
                    .update_record(&self.record_name, &fields, &version)
                    .await
            }
            Err(e) if e.is_not_found() => {
                let mut fields = RecordFields::new();
                fields.insert(self.leader_field.clone(), String::new());
                self.store.create_record(&self.record_name, &fields).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!("Cleared {} in {}", self.leader_field, self.record_name);
                true
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(
                    "{} changed while withdrawing, leaving it in place",
                    self.record_name
                );
                true
            }
            Err(e) => {
                tracing::warn!("Publish leader to {}: {}", self.record_name, e);
                false
            }
        }
    }

    /// Upsert the leader field, creating the record if it is absent and
    /// leaving every other field untouched.
    pub async fn try_publish(&self, leader: &str) -> Result<()> {
        match self.store.get_record(&self.record_name).await {
            Ok((mut fields, version)) => {
                fields.insert(self.leader_field.clone(), leader.to_string());
                self.store
                    .update_record(&self.record_name, &fields, &version)
                    .await
            }
            Err(e) if e.is_not_found() => {
                let mut fields = RecordFields::new();
                fields.insert(self.leader_field.clone(), leader.to_string());
                self.store.create_record(&self.record_name, &fields).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CandidateStream, Lease, MemoryStore, Version};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const RECORD: &str = "wolfelect-leader-info";
    const FIELD: &str = "leaderIdentity";

    fn publisher(store: &Arc<MemoryStore>) -> StatusPublisher {
        StatusPublisher::new(store.clone(), RECORD.into(), FIELD.into())
    }

    #[tokio::test]
    async fn test_creates_absent_record() {
        let store = Arc::new(MemoryStore::new());
        assert!(publisher(&store).publish("pod-a").await);

        let fields = store.record(RECORD).await.unwrap();
        assert_eq!(fields.get(FIELD).map(String::as_str), Some("pod-a"));
        assert_eq!(fields.len(), 1);
    }

    #[tokio::test]
    async fn test_updates_only_leader_field() {
        let store = Arc::new(MemoryStore::new());
        let mut fields = RecordFields::new();
        fields.insert(FIELD.into(), "pod-a".into());
        fields.insert("upstream".into(), "10.0.0.1".into());
        store.create_record(RECORD, &fields).await.unwrap();

        let p = publisher(&store);
        assert!(p.publish("pod-b").await);
        let fields = store.record(RECORD).await.unwrap();
        assert_eq!(fields.get(FIELD).map(String::as_str), Some("pod-b"));
        assert_eq!(fields.get("upstream").map(String::as_str), Some("10.0.0.1"));

        assert!(p.publish("").await);
        let fields = store.record(RECORD).await.unwrap();
        assert_eq!(fields.get(FIELD).map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_withdraw_respects_successor() {
        let store = Arc::new(MemoryStore::new());
        let p = publisher(&store);

        p.publish("pod-a").await;
        assert!(p.withdraw("pod-a").await);
        assert_eq!(store.record(RECORD).await.unwrap().get(FIELD).map(String::as_str), Some(""));

        p.publish("pod-b").await;
        assert!(p.withdraw("pod-a").await);
        assert_eq!(
            store.record(RECORD).await.unwrap().get(FIELD).map(String::as_str),
            Some("pod-b")
        );
    }

    /// Lets a successor publish right after the next record read
    struct SuccessorWritesAfterRead {
        inner: Arc<MemoryStore>,
        successor: String,
        armed: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for SuccessorWritesAfterRead {
        async fn get_lease(&self, name: &str) -> Result<(Lease, Version)> {
            self.inner.get_lease(name).await
        }

        async fn compare_and_swap_lease(
            &self,
            name: &str,
            lease: &Lease,
            expected: Option<&Version>,
        ) -> Result<Version> {
            self.inner.compare_and_swap_lease(name, lease, expected).await
        }

        async fn list_candidates_by_marker(&self, key: &str, value: &str) -> Result<CandidateStream> {
            self.inner.list_candidates_by_marker(key, value).await
        }

        async fn set_candidate_marker(&self, identity: &str, key: &str, value: Option<&str>) -> Result<()> {
            self.inner.set_candidate_marker(identity, key, value).await
        }

        async fn get_record(&self, name: &str) -> Result<(RecordFields, Version)> {
            let read = self.inner.get_record(name).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                let successor = StatusPublisher::new(self.inner.clone(), RECORD.into(), FIELD.into());
                assert!(successor.publish(&self.successor).await);
            }
            read
        }

        async fn create_record(&self, name: &str, fields: &RecordFields) -> Result<()> {
            self.inner.create_record(name, fields).await
        }

        async fn update_record(&self, name: &str, fields: &RecordFields, version: &Version) -> Result<()> {
            self.inner.update_record(name, fields, version).await
        }
    }

    #[tokio::test]
    async fn test_withdraw_loses_to_concurrent_successor() {
        let store = Arc::new(MemoryStore::new());
        publisher(&store).publish("pod-a").await;

        let racing = Arc::new(SuccessorWritesAfterRead {
            inner: store.clone(),
            successor: "pod-b".into(),
            armed: AtomicBool::new(true),
        });
        let p = StatusPublisher::new(racing, RECORD.into(), FIELD.into());

        assert!(p.withdraw("pod-a").await);
        assert_eq!(
            store.record(RECORD).await.unwrap().get(FIELD).map(String::as_str),
            Some("pod-b")
        );
    }

    #[tokio::test]
    async fn test_withdraw_creates_cleared_record() {
        let store = Arc::new(MemoryStore::new());
        assert!(publisher(&store).withdraw("pod-a").await);
        assert_eq!(store.record(RECORD).await.unwrap().get(FIELD).map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let p = publisher(&store);
        assert!(!p.publish("pod-a").await);
        assert_eq!(store.record_writes(), 0);

        store.set_unavailable(false);
        assert!(store.record(RECORD).await.is_none());
    }
}
