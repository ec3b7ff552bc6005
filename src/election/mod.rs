//! Leader Election
//!
//! Lease-based election against the shared object store. The engine moves
//! between two externally visible states and reports every transition as a
//! [`LeadershipEvent`] on a channel, in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::WolfElectConfig;

mod engine;

pub use engine::ElectionEngine;

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Not holding the lease (possibly retrying acquisition)
    Idle,
    /// Holding and renewing the lease
    Leader,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "IDLE"),
            ElectionState::Leader => write!(f, "LEADER"),
        }
    }
}

/// Leadership transition reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This candidate acquired the lease
    BecameLeader(String),
    /// This candidate stopped holding the lease
    LostLeadership,
}

/// Point-in-time view of the engine, served by the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSnapshot {
    /// This candidate's identity
    pub identity: String,
    /// Current state
    pub state: ElectionState,
    /// Holder recorded in the last lease read or write
    pub holder: Option<String>,
    /// Transition counter from the last lease read or write
    pub leader_transitions: u64,
    /// Last successful acquisition or renewal by this candidate
    pub last_renewal: Option<DateTime<Utc>>,
}

/// Lease timings and behavior for one engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the lease record
    pub lease_name: String,
    /// Validity window written into the lease
    pub lease_duration: Duration,
    /// Maximum time the leader keeps retrying a failing renewal
    pub renew_deadline: Duration,
    /// Interval between attempts
    pub retry_period: Duration,
    /// Clear the holder when cancelled while leading
    pub release_on_cancel: bool,
}

impl EngineConfig {
    pub fn from_config(config: &WolfElectConfig) -> Self {
        Self {
            lease_name: config.election.lease_name.clone(),
            lease_duration: config.lease_duration(),
            renew_deadline: config.renew_deadline(),
            retry_period: config.retry_period(),
            release_on_cancel: config.election.release_on_cancel,
        }
    }
}
