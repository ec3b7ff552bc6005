//! WolfElect - Lease-Based Leader Election
//!
//! Elects a single active coordinator among a fixed set of candidate
//! processes and keeps exactly one of them visibly marked as the leader,
//! even across crashes, restarts and racing writers.
//!
//! # Architecture
//!
//! A versioned lease record in a shared object store is the only lock.
//! The [`election::ElectionEngine`] acquires, renews and releases it and
//! reports each transition. The [`supervisor::Supervisor`] reacts to those
//! transitions: it marks the new leader, strips stale markers from every
//! other candidate (once on acquisition and then periodically while
//! leading), and publishes the leader identity into a shared status record.
//!
//! # Features
//!
//! - Optimistic-concurrency lease acquisition, renewal and release
//! - Deadline-driven step-down when renewal keeps failing
//! - Self-healing leader markers, reconciled against the live lease holder
//! - Shared status record naming the current leader
//! - SQLite-backed shared store for candidates on one host
//! - HTTP status endpoint

pub mod config;
pub mod error;
pub mod store;
pub mod election;
pub mod reconcile;
pub mod status;
pub mod supervisor;
pub mod api;

pub use config::WolfElectConfig;
pub use error::{Error, Result};
