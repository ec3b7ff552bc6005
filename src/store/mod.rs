//! Cluster Object Store
//!
//! The election only ever talks to the shared store through [`ObjectStore`]:
//! one versioned lease record per election, a marker per candidate, and
//! named key/value records. Writes to leases and records are
//! version-checked; stale writers get [`Error::Conflict`](crate::Error::Conflict).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Fields of a shared key/value record
pub type RecordFields = BTreeMap<String, String>;

/// Lazy, finite sequence of candidate identities
pub type CandidateStream = BoxStream<'static, Result<String>>;

/// Opaque optimistic-concurrency token returned by every read and write
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The election lock record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of the current holder, empty when released
    pub holder_identity: String,
    /// Validity window after `renew_time`
    pub lease_duration_secs: u64,
    /// When the current holder acquired the lease
    pub acquire_time: DateTime<Utc>,
    /// Last successful renewal
    pub renew_time: DateTime<Utc>,
    /// Number of successful acquisitions
    pub leader_transitions: u64,
}

impl Lease {
    /// Whether `now` is past the end of the validity window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.renew_time);
        age > chrono::Duration::seconds(self.lease_duration_secs as i64)
    }

    /// Whether nobody holds the lease or the holder stopped renewing
    pub fn is_vacant(&self, now: DateTime<Utc>) -> bool {
        self.holder_identity.is_empty() || self.is_expired(now)
    }

    /// Whether the lease is recorded as held by `identity`
    pub fn is_held_by(&self, identity: &str) -> bool {
        !identity.is_empty() && self.holder_identity == identity
    }

    /// The holder identity, if any
    pub fn holder(&self) -> Option<&str> {
        if self.holder_identity.is_empty() {
            None
        } else {
            Some(&self.holder_identity)
        }
    }
}

/// Round a lease duration up to whole seconds, never below one second
pub fn duration_to_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Cluster object store client
///
/// Implementations must provide a strongly consistent view: a successful
/// version-checked write is visible to every later read.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the named lease and its version
    async fn get_lease(&self, name: &str) -> Result<(Lease, Version)>;

    /// Write the lease if its version still equals `expected`.
    ///
    /// `expected = None` creates the lease and fails with a conflict if it
    /// already exists.
    async fn compare_and_swap_lease(
        &self,
        name: &str,
        lease: &Lease,
        expected: Option<&Version>,
    ) -> Result<Version>;

    /// List candidates whose marker `key` equals `value`
    async fn list_candidates_by_marker(&self, key: &str, value: &str) -> Result<CandidateStream>;

    /// Set (`Some`) or clear (`None`) a marker on a candidate
    async fn set_candidate_marker(&self, identity: &str, key: &str, value: Option<&str>) -> Result<()>;

    /// Read a shared record
    async fn get_record(&self, name: &str) -> Result<(RecordFields, Version)>;

    /// Create a shared record
    async fn create_record(&self, name: &str, fields: &RecordFields) -> Result<()>;

    /// Replace a shared record's fields if its version still equals `version`
    async fn update_record(&self, name: &str, fields: &RecordFields, version: &Version) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: &str, age_secs: i64, duration: u64) -> Lease {
        let now = Utc::now();
        Lease {
            holder_identity: holder.to_string(),
            lease_duration_secs: duration,
            acquire_time: now - chrono::Duration::seconds(age_secs),
            renew_time: now - chrono::Duration::seconds(age_secs),
            leader_transitions: 1,
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(lease("pod-a", 20, 15).is_expired(now));
        assert!(!lease("pod-a", 5, 15).is_expired(now));
        assert!(lease("", 0, 15).is_vacant(now));
        assert!(!lease("pod-a", 0, 15).is_vacant(now));
    }

    #[test]
    fn test_holder() {
        let l = lease("pod-a", 0, 15);
        assert!(l.is_held_by("pod-a"));
        assert!(!l.is_held_by("pod-b"));
        assert_eq!(l.holder(), Some("pod-a"));
        assert_eq!(lease("", 0, 15).holder(), None);
        assert!(!lease("", 0, 15).is_held_by(""));
    }

    #[test]
    fn test_duration_to_secs() {
        assert_eq!(duration_to_secs(Duration::from_millis(300)), 1);
        assert_eq!(duration_to_secs(Duration::from_millis(1500)), 2);
        assert_eq!(duration_to_secs(Duration::from_secs(15)), 15);
    }
}
