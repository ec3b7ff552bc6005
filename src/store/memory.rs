//! In-memory object store
//!
//! Process-local implementation of [`ObjectStore`]. Every candidate that
//! shares one `Arc<MemoryStore>` sees the same leases, markers and records,
//! which is what the test suite uses to run several engines side by side.
//! Faults can be injected to exercise retry and best-effort paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;

use super::{CandidateStream, Lease, ObjectStore, RecordFields, Version};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    leases: HashMap<String, (Lease, u64)>,
    markers: BTreeMap<String, HashMap<String, String>>,
    records: HashMap<String, (RecordFields, u64)>,
}

/// Shared in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    next_version: AtomicU64,
    unavailable: AtomicBool,
    rewrite_before_lease_write: AtomicBool,
    failing_markers: RwLock<HashSet<String>>,
    marker_writes: AtomicU64,
    record_writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".into()));
        }
        Ok(())
    }

    /// Make every operation fail with `StoreUnavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Rewrite the stored lease unchanged, under a new version, just before
    /// the next lease write checks its expected version
    pub fn rewrite_before_next_lease_write(&self) {
        self.rewrite_before_lease_write.store(true, Ordering::SeqCst);
    }

    /// Make marker writes on one candidate fail
    pub async fn fail_marker_writes(&self, identity: &str) {
        self.failing_markers.write().await.insert(identity.to_string());
    }

    /// Overwrite a lease without a version check
    pub async fn put_lease(&self, name: &str, lease: Lease) -> Version {
        let version = self.bump();
        self.inner.write().await.leases.insert(name.to_string(), (lease, version));
        Version::new(version.to_string())
    }

    /// Current lease, if one exists
    pub async fn lease(&self, name: &str) -> Option<Lease> {
        self.inner.read().await.leases.get(name).map(|(l, _)| l.clone())
    }

    /// Marker value on a candidate
    pub async fn marker(&self, identity: &str, key: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .markers
            .get(identity)
            .and_then(|m| m.get(key).cloned())
    }

    /// All candidates whose `key` marker equals `value`
    pub async fn marked(&self, key: &str, value: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .markers
            .iter()
            .filter(|(_, m)| m.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Fields of a record, if it exists
    pub async fn record(&self, name: &str) -> Option<RecordFields> {
        self.inner.read().await.records.get(name).map(|(f, _)| f.clone())
    }

    /// Number of marker writes performed so far
    pub fn marker_writes(&self) -> u64 {
        self.marker_writes.load(Ordering::SeqCst)
    }

    /// Number of record writes performed so far
    pub fn record_writes(&self) -> u64 {
        self.record_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_lease(&self, name: &str) -> Result<(Lease, Version)> {
        self.check_available()?;
        let inner = self.inner.read().await;
        match inner.leases.get(name) {
            Some((lease, version)) => Ok((lease.clone(), Version::new(version.to_string()))),
            None => Err(Error::NotFound(format!("lease/{}", name))),
        }
    }

    async fn compare_and_swap_lease(
        &self,
        name: &str,
        lease: &Lease,
        expected: Option<&Version>,
    ) -> Result<Version> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if self.rewrite_before_lease_write.swap(false, Ordering::SeqCst) {
            let version = self.bump();
            if let Some((_, v)) = inner.leases.get_mut(name) {
                *v = version;
            }
        }
        let current = inner.leases.get(name).map(|(_, v)| v.to_string());

        match (expected, current) {
            (None, None) => {}
            (Some(expected), Some(current)) if expected.as_str() == current => {}
            (None, Some(_)) => return Err(Error::Conflict(format!("lease/{} already exists", name))),
            (Some(_), None) => return Err(Error::NotFound(format!("lease/{}", name))),
            (Some(_), Some(_)) => return Err(Error::Conflict(format!("lease/{}", name))),
        }

        let version = self.bump();
        inner.leases.insert(name.to_string(), (lease.clone(), version));
        Ok(Version::new(version.to_string()))
    }

    async fn list_candidates_by_marker(&self, key: &str, value: &str) -> Result<CandidateStream> {
        self.check_available()?;
        let ids = self.marked(key, value).await;
        Ok(futures::stream::iter(ids.into_iter().map(Ok)).boxed())
    }

    async fn set_candidate_marker(&self, identity: &str, key: &str, value: Option<&str>) -> Result<()> {
        self.check_available()?;
        if self.failing_markers.read().await.contains(identity) {
            return Err(Error::StoreUnavailable(format!("candidate/{} rejected the write", identity)));
        }

        let mut inner = self.inner.write().await;
        match value {
            Some(value) => {
                inner
                    .markers
                    .entry(identity.to_string())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                if let Some(markers) = inner.markers.get_mut(identity) {
                    markers.remove(key);
                }
            }
        }
        self.marker_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_record(&self, name: &str) -> Result<(RecordFields, Version)> {
        self.check_available()?;
        let inner = self.inner.read().await;
        match inner.records.get(name) {
            Some((fields, version)) => Ok((fields.clone(), Version::new(version.to_string()))),
            None => Err(Error::NotFound(format!("record/{}", name))),
        }
    }

    async fn create_record(&self, name: &str, fields: &RecordFields) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(name) {
            return Err(Error::AlreadyExists(format!("record/{}", name)));
        }
        let version = self.bump();
        inner.records.insert(name.to_string(), (fields.clone(), version));
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_record(&self, name: &str, fields: &RecordFields, version: &Version) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let current = match inner.records.get(name) {
            Some((_, v)) => v.to_string(),
            None => return Err(Error::NotFound(format!("record/{}", name))),
        };
        if current != version.as_str() {
            return Err(Error::Conflict(format!("record/{}", name)));
        }
        let next = self.bump();
        inner.records.insert(name.to_string(), (fields.clone(), next));
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lease(holder: &str) -> Lease {
        Lease {
            holder_identity: holder.to_string(),
            lease_duration_secs: 15,
            acquire_time: Utc::now(),
            renew_time: Utc::now(),
            leader_transitions: 1,
        }
    }

    #[tokio::test]
    async fn test_lease_version_check() {
        let store = MemoryStore::new();
        assert!(store.get_lease("e").await.unwrap_err().is_not_found());

        let v1 = store.compare_and_swap_lease("e", &lease("pod-a"), None).await.unwrap();
        assert!(store
            .compare_and_swap_lease("e", &lease("pod-b"), None)
            .await
            .unwrap_err()
            .is_conflict());

        let v2 = store.compare_and_swap_lease("e", &lease("pod-a"), Some(&v1)).await.unwrap();
        assert_ne!(v1, v2);

        let stale = store.compare_and_swap_lease("e", &lease("pod-b"), Some(&v1)).await;
        assert!(stale.unwrap_err().is_conflict());
        assert_eq!(store.lease("e").await.unwrap().holder_identity, "pod-a");
    }

    #[tokio::test]
    async fn test_markers() {
        let store = MemoryStore::new();
        store.set_candidate_marker("a", "k", Some("true")).await.unwrap();
        store.set_candidate_marker("b", "k", Some("false")).await.unwrap();
        store.set_candidate_marker("c", "k", Some("true")).await.unwrap();

        let listed: Vec<String> = store
            .list_candidates_by_marker("k", "true")
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(listed, vec!["a".to_string(), "c".to_string()]);

        store.set_candidate_marker("c", "k", None).await.unwrap();
        assert_eq!(store.marker("c", "k").await, None);
        store.set_candidate_marker("unknown", "k", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_records() {
        let store = MemoryStore::new();
        let mut fields = RecordFields::new();
        fields.insert("leaderIdentity".into(), "pod-a".into());
        store.create_record("info", &fields).await.unwrap();
        assert!(matches!(
            store.create_record("info", &fields).await,
            Err(Error::AlreadyExists(_))
        ));

        let (_, version) = store.get_record("info").await.unwrap();
        store.update_record("info", &fields, &version).await.unwrap();
        assert!(store
            .update_record("info", &fields, &version)
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get_lease("e").await.unwrap_err().is_retryable());
        store.set_unavailable(false);
        assert!(store.get_lease("e").await.unwrap_err().is_not_found());
    }
}
