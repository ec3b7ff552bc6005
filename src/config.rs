//! WolfElect Configuration
//!
//! This module provides configuration structures for the lease-based
//! leader elector. Every option has a default; only the candidate identity
//! and its namespace must be resolved, either from the file, the command
//! line, or the `POD_NAME` / `POD_NAMESPACE` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding this candidate's identity
pub const IDENTITY_ENV: &str = "POD_NAME";

/// Environment variable holding this candidate's namespace
pub const NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Main WolfElect configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfElectConfig {
    /// Candidate identity and scope
    #[serde(default)]
    pub node: NodeConfig,

    /// Lease timings
    #[serde(default)]
    pub election: ElectionConfig,

    /// Leader marker settings
    #[serde(default)]
    pub marker: MarkerConfig,

    /// Shared status record settings
    #[serde(default)]
    pub status: StatusConfig,

    /// Object store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Candidate identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable per-replica identity (falls back to `POD_NAME`)
    #[serde(default)]
    pub identity: Option<String>,

    /// Namespace all records live in (falls back to `POD_NAMESPACE`)
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Lease election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Name of the lease record
    #[serde(default = "default_lease_name")]
    pub lease_name: String,

    /// How long a lease stays valid without renewal
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,

    /// How long the leader keeps retrying renewal before stepping down
    #[serde(default = "default_renew_deadline_secs")]
    pub renew_deadline_secs: u64,

    /// Interval between acquisition and renewal attempts
    #[serde(default = "default_retry_period_secs")]
    pub retry_period_secs: u64,

    /// Clear the holder on shutdown so a successor need not wait for expiry
    #[serde(default = "default_true")]
    pub release_on_cancel: bool,
}

/// Leader marker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Marker key set on the active candidate
    #[serde(default = "default_marker_key")]
    pub key: String,

    /// Marker value identifying the active candidate
    #[serde(default = "default_marker_value")]
    pub value: String,

    /// How often the leader removes stale markers
    #[serde(default = "default_reconcile_period_secs")]
    pub reconcile_period_secs: u64,
}

/// Shared status record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Name of the status record
    #[serde(default = "default_record_name")]
    pub record_name: String,

    /// Field holding the leader identity
    #[serde(default = "default_leader_field")]
    pub leader_field: String,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared SQLite file
    Sqlite,
    /// Process-local memory (single candidate only)
    Memory,
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Database path for the SQLite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long SQLite waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_lease_name() -> String {
    "wolfelect-election".to_string()
}

fn default_lease_duration_secs() -> u64 {
    15
}

fn default_renew_deadline_secs() -> u64 {
    10
}

fn default_retry_period_secs() -> u64 {
    2
}

fn default_marker_key() -> String {
    "wolfelect.io/leader".to_string()
}

fn default_marker_value() -> String {
    "true".to_string()
}

fn default_reconcile_period_secs() -> u64 {
    5
}

fn default_record_name() -> String {
    "wolfelect-leader-info".to_string()
}

fn default_leader_field() -> String {
    "leaderIdentity".to_string()
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/wolfelect/store.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: default_lease_name(),
            lease_duration_secs: default_lease_duration_secs(),
            renew_deadline_secs: default_renew_deadline_secs(),
            retry_period_secs: default_retry_period_secs(),
            release_on_cancel: true,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            key: default_marker_key(),
            value: default_marker_value(),
            reconcile_period_secs: default_reconcile_period_secs(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            record_name: default_record_name(),
            leader_field: default_leader_field(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfElectConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfElectConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Fill identity and namespace from explicit overrides, then from the
    /// environment, leaving values already present in the file untouched
    /// unless an override is given.
    pub fn resolve(&mut self, identity: Option<String>, namespace: Option<String>) {
        if identity.is_some() {
            self.node.identity = identity;
        }
        if namespace.is_some() {
            self.node.namespace = namespace;
        }
        if self.node.identity.is_none() {
            self.node.identity = non_empty_env(IDENTITY_ENV);
        }
        if self.node.namespace.is_none() {
            self.node.namespace = non_empty_env(NAMESPACE_ENV);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.identity().is_empty() {
            return Err(crate::Error::Config(format!(
                "node.identity is not set (use --identity or {})",
                IDENTITY_ENV
            )));
        }

        if self.namespace().is_empty() {
            return Err(crate::Error::Config(format!(
                "node.namespace is not set (use --namespace or {})",
                NAMESPACE_ENV
            )));
        }

        if self.election.lease_name.is_empty() {
            return Err(crate::Error::Config("election.lease_name cannot be empty".into()));
        }

        if self.election.retry_period_secs == 0 {
            return Err(crate::Error::Config("election.retry_period_secs must be positive".into()));
        }

        if self.election.renew_deadline_secs <= self.election.retry_period_secs {
            return Err(crate::Error::Config(
                "election.renew_deadline_secs must be greater than retry_period_secs".into(),
            ));
        }

        if self.election.lease_duration_secs <= self.election.renew_deadline_secs {
            return Err(crate::Error::Config(
                "election.lease_duration_secs must be greater than renew_deadline_secs".into(),
            ));
        }

        if self.marker.key.is_empty() || self.marker.value.is_empty() {
            return Err(crate::Error::Config("marker.key and marker.value cannot be empty".into()));
        }

        if self.marker.reconcile_period_secs == 0 {
            return Err(crate::Error::Config("marker.reconcile_period_secs must be positive".into()));
        }

        if self.status.record_name.is_empty() || self.status.leader_field.is_empty() {
            return Err(crate::Error::Config(
                "status.record_name and status.leader_field cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// This candidate's identity (empty if unresolved)
    pub fn identity(&self) -> &str {
        self.node.identity.as_deref().unwrap_or("")
    }

    /// This candidate's namespace (empty if unresolved)
    pub fn namespace(&self) -> &str {
        self.node.namespace.as_deref().unwrap_or("")
    }

    /// Get lease duration as Duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.election.lease_duration_secs)
    }

    /// Get renew deadline as Duration
    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.election.renew_deadline_secs)
    }

    /// Get retry period as Duration
    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.election.retry_period_secs)
    }

    /// Get reconciliation period as Duration
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.marker.reconcile_period_secs)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
