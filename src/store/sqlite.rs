//! SQLite object store
//!
//! Candidates on one host share a single SQLite database file. SQLite
//! serializes writers, and every lease and record write carries a
//! `WHERE version = ?` guard, which gives the compare-and-swap semantics
//! the election relies on. All rows are scoped by namespace.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{CandidateStream, Lease, ObjectStore, RecordFields, Version};
use crate::error::{Error, Result};

/// Object store backed by a shared SQLite file
pub struct SqliteStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Namespace every row belongs to
    namespace: String,
}

impl SqliteStore {
    /// Open or create the store database
    pub fn open(path: &Path, namespace: &str, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                holder_identity TEXT NOT NULL,
                lease_duration_secs INTEGER NOT NULL,
                acquire_time TEXT NOT NULL,
                renew_time TEXT NOT NULL,
                leader_transitions INTEGER NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            );

            CREATE TABLE IF NOT EXISTS candidate_markers (
                namespace TEXT NOT NULL,
                identity TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, identity, key)
            );

            CREATE INDEX IF NOT EXISTS idx_candidate_markers_kv
                ON candidate_markers(namespace, key, value);

            CREATE TABLE IF NOT EXISTS records (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                fields TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            namespace: namespace.to_string(),
        })
    }
}

fn parse_version(version: &Version) -> Result<i64> {
    version
        .as_str()
        .parse()
        .map_err(|_| Error::Conflict(format!("malformed version token {}", version)))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp {:?}: {}", value, e)))
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn get_lease(&self, name: &str) -> Result<(Lease, Version)> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT holder_identity, lease_duration_secs, acquire_time, renew_time,
                        leader_transitions, version
                 FROM leases WHERE namespace = ?1 AND name = ?2",
                params![self.namespace, name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let (holder, duration, acquired, renewed, transitions, version) =
            row.ok_or_else(|| Error::NotFound(format!("lease/{}/{}", self.namespace, name)))?;

        let lease = Lease {
            holder_identity: holder,
            lease_duration_secs: duration as u64,
            acquire_time: parse_time(&acquired)?,
            renew_time: parse_time(&renewed)?,
            leader_transitions: transitions as u64,
        };
        Ok((lease, Version::new(version.to_string())))
    }

    async fn compare_and_swap_lease(
        &self,
        name: &str,
        lease: &Lease,
        expected: Option<&Version>,
    ) -> Result<Version> {
        let conn = self.conn.lock().await;
        let acquired = lease.acquire_time.to_rfc3339();
        let renewed = lease.renew_time.to_rfc3339();

        match expected {
            None => {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO leases
                        (namespace, name, holder_identity, lease_duration_secs, acquire_time,
                         renew_time, leader_transitions, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                    params![
                        self.namespace,
                        name,
                        lease.holder_identity,
                        lease.lease_duration_secs as i64,
                        acquired,
                        renewed,
                        lease.leader_transitions as i64,
                    ],
                )?;
                if inserted == 0 {
                    return Err(Error::Conflict(format!("lease/{} already exists", name)));
                }
                Ok(Version::new("1"))
            }
            Some(expected) => {
                let expected = parse_version(expected)?;
                let updated = conn.execute(
                    "UPDATE leases
                     SET holder_identity = ?3, lease_duration_secs = ?4, acquire_time = ?5,
                         renew_time = ?6, leader_transitions = ?7, version = version + 1
                     WHERE namespace = ?1 AND name = ?2 AND version = ?8",
                    params![
                        self.namespace,
                        name,
                        lease.holder_identity,
                        lease.lease_duration_secs as i64,
                        acquired,
                        renewed,
                        lease.leader_transitions as i64,
                        expected,
                    ],
                )?;
                if updated == 0 {
                    return Err(Error::Conflict(format!("lease/{}", name)));
                }
                Ok(Version::new((expected + 1).to_string()))
            }
        }
    }

    async fn list_candidates_by_marker(&self, key: &str, value: &str) -> Result<CandidateStream> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT identity FROM candidate_markers
             WHERE namespace = ?1 AND key = ?2 AND value = ?3
             ORDER BY identity",
        )?;
        let ids = stmt
            .query_map(params![self.namespace, key, value], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(futures::stream::iter(ids.into_iter().map(Ok)).boxed())
    }

    async fn set_candidate_marker(&self, identity: &str, key: &str, value: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        match value {
            Some(value) => {
                conn.execute(
                    "INSERT INTO candidate_markers (namespace, identity, key, value)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(namespace, identity, key)
                     DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                    params![self.namespace, identity, key, value],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM candidate_markers WHERE namespace = ?1 AND identity = ?2 AND key = ?3",
                    params![self.namespace, identity, key],
                )?;
            }
        }
        Ok(())
    }

    async fn get_record(&self, name: &str) -> Result<(RecordFields, Version)> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT fields, version FROM records WHERE namespace = ?1 AND name = ?2",
                params![self.namespace, name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let (fields, version) =
            row.ok_or_else(|| Error::NotFound(format!("record/{}/{}", self.namespace, name)))?;
        Ok((serde_json::from_str(&fields)?, Version::new(version.to_string())))
    }

    async fn create_record(&self, name: &str, fields: &RecordFields) -> Result<()> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO records (namespace, name, fields, version) VALUES (?1, ?2, ?3, 1)",
            params![self.namespace, name, serde_json::to_string(fields)?],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("record/{}/{}", self.namespace, name)));
        }
        Ok(())
    }

    async fn update_record(&self, name: &str, fields: &RecordFields, version: &Version) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE records SET fields = ?3, version = version + 1
             WHERE namespace = ?1 AND name = ?2 AND version = ?4",
            params![self.namespace, name, serde_json::to_string(fields)?, parse_version(version)?],
        )?;
        if updated == 0 {
            return Err(Error::Conflict(format!("record/{}/{}", self.namespace, name)));
        }
        Ok(())
    }
}
