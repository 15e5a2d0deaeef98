//! Deployment and computer-sync store
//!
//! Operator approval state per revision index plus per-client last-sync
//! bookkeeping, persisted in `deploySync.db` (SQLite, WAL). Both tables are
//! upsert-with-timestamp: a write lands only when its change time is
//! strictly newer than the stored row, so concurrent approvers converge on
//! the most recent intent without extra locking.

use crate::store::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Operator decision for one update revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentAction {
    Install,
    Bundle,
    Evaluate,
    /// The "unapproved" sentinel.
    PreDeploymentCheck,
}

impl DeploymentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentAction::Install => "Install",
            DeploymentAction::Bundle => "Bundle",
            DeploymentAction::Evaluate => "Evaluate",
            DeploymentAction::PreDeploymentCheck => "PreDeploymentCheck",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Install" => Ok(DeploymentAction::Install),
            "Bundle" => Ok(DeploymentAction::Bundle),
            "Evaluate" => Ok(DeploymentAction::Evaluate),
            "PreDeploymentCheck" => Ok(DeploymentAction::PreDeploymentCheck),
            other => Err(Error::Serialization(format!(
                "unknown deployment action: {}",
                other
            ))),
        }
    }
}

/// One row of the `Deployments` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEntry {
    pub revision_id: u32,
    pub action: DeploymentAction,
    pub deadline: Option<DateTime<Utc>>,
    pub last_change_time: DateTime<Utc>,
}

/// One row of the `ComputerSyncStatus` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerSyncRow {
    pub computer_id: String,
    pub last_sync_time: DateTime<Utc>,
}

fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("bad timestamp {:?}: {}", s, e)))
}

/// Handle to `deploySync.db`.
pub struct DeploySyncStore {
    conn: Mutex<Connection>,
}

impl DeploySyncStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Deployments (
                RevisionId INTEGER PRIMARY KEY,
                Action TEXT NOT NULL,
                Deadline TEXT,
                LastChangeTime TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ComputerSyncStatus (
                ComputerId TEXT PRIMARY KEY,
                LastSyncTime TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests and ephemeral servers.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE Deployments (
                RevisionId INTEGER PRIMARY KEY,
                Action TEXT NOT NULL,
                Deadline TEXT,
                LastChangeTime TEXT NOT NULL
            );
            CREATE TABLE ComputerSyncStatus (
                ComputerId TEXT PRIMARY KEY,
                LastSyncTime TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Upsert a deployment. The new row wins only when its
    /// `last_change_time` is strictly greater than the stored one.
    pub fn save_deployment(&self, entry: &DeploymentEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO Deployments (RevisionId, Action, Deadline, LastChangeTime)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(RevisionId) DO UPDATE SET
                 Action = excluded.Action,
                 Deadline = excluded.Deadline,
                 LastChangeTime = excluded.LastChangeTime
             WHERE excluded.LastChangeTime > Deployments.LastChangeTime",
            rusqlite::params![
                entry.revision_id,
                entry.action.as_str(),
                entry.deadline.map(to_rfc3339),
                to_rfc3339(entry.last_change_time)
            ],
        )?;
        Ok(())
    }

    pub fn delete_deployment(&self, revision_id: u32) -> Result<()> {
        self.conn().execute(
            "DELETE FROM Deployments WHERE RevisionId = ?1",
            rusqlite::params![revision_id],
        )?;
        Ok(())
    }

    pub fn get_deployment(&self, revision_id: u32) -> Result<Option<DeploymentEntry>> {
        let conn = self.conn();
        let row: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT Action, Deadline, LastChangeTime FROM Deployments WHERE RevisionId = ?1",
                rusqlite::params![revision_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((action, deadline, changed)) => Ok(Some(DeploymentEntry {
                revision_id,
                action: DeploymentAction::parse(&action)?,
                deadline: deadline.as_deref().map(parse_rfc3339).transpose()?,
                last_change_time: parse_rfc3339(&changed)?,
            })),
        }
    }

    /// Upsert a client's last-sync time; newer time wins.
    pub fn update_computer_sync(&self, computer_id: &str, time: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO ComputerSyncStatus (ComputerId, LastSyncTime)
             VALUES (?1, ?2)
             ON CONFLICT(ComputerId) DO UPDATE SET
                 LastSyncTime = excluded.LastSyncTime
             WHERE excluded.LastSyncTime > ComputerSyncStatus.LastSyncTime",
            rusqlite::params![computer_id, to_rfc3339(time)],
        )?;
        Ok(())
    }

    pub fn get_computer_sync(&self, computer_id: &str) -> Result<Option<ComputerSyncRow>> {
        let conn = self.conn();
        let time: Option<String> = conn
            .query_row(
                "SELECT LastSyncTime FROM ComputerSyncStatus WHERE ComputerId = ?1",
                rusqlite::params![computer_id],
                |row| row.get(0),
            )
            .optional()?;
        match time {
            None => Ok(None),
            Some(t) => Ok(Some(ComputerSyncRow {
                computer_id: computer_id.to_string(),
                last_sync_time: parse_rfc3339(&t)?,
            })),
        }
    }

    pub fn delete_computer(&self, computer_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM ComputerSyncStatus WHERE ComputerId = ?1",
            rusqlite::params![computer_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_deployment_roundtrip() {
        let store = DeploySyncStore::open_in_memory().unwrap();
        let entry = DeploymentEntry {
            revision_id: 42,
            action: DeploymentAction::Install,
            deadline: Some(at(2_000_000)),
            last_change_time: at(1_000_000),
        };
        store.save_deployment(&entry).unwrap();
        assert_eq!(store.get_deployment(42).unwrap().unwrap(), entry);
        assert!(store.get_deployment(43).unwrap().is_none());
    }

    #[test]
    fn test_newer_change_time_wins() {
        let store = DeploySyncStore::open_in_memory().unwrap();
        store
            .save_deployment(&DeploymentEntry {
                revision_id: 1,
                action: DeploymentAction::Install,
                deadline: None,
                last_change_time: at(100),
            })
            .unwrap();
        // Stale write is ignored.
        store
            .save_deployment(&DeploymentEntry {
                revision_id: 1,
                action: DeploymentAction::PreDeploymentCheck,
                deadline: None,
                last_change_time: at(50),
            })
            .unwrap();
        assert_eq!(
            store.get_deployment(1).unwrap().unwrap().action,
            DeploymentAction::Install
        );
        // Newer write lands.
        store
            .save_deployment(&DeploymentEntry {
                revision_id: 1,
                action: DeploymentAction::Evaluate,
                deadline: None,
                last_change_time: at(200),
            })
            .unwrap();
        assert_eq!(
            store.get_deployment(1).unwrap().unwrap().action,
            DeploymentAction::Evaluate
        );
    }

    #[test]
    fn test_equal_change_time_does_not_overwrite() {
        let store = DeploySyncStore::open_in_memory().unwrap();
        for action in [DeploymentAction::Install, DeploymentAction::Bundle] {
            store
                .save_deployment(&DeploymentEntry {
                    revision_id: 9,
                    action,
                    deadline: None,
                    last_change_time: at(500),
                })
                .unwrap();
        }
        assert_eq!(
            store.get_deployment(9).unwrap().unwrap().action,
            DeploymentAction::Install
        );
    }

    #[test]
    fn test_computer_sync_upsert_and_delete() {
        let store = DeploySyncStore::open_in_memory().unwrap();
        store.update_computer_sync("pc-1", at(100)).unwrap();
        store.update_computer_sync("pc-1", at(50)).unwrap(); // stale, ignored
        assert_eq!(
            store.get_computer_sync("pc-1").unwrap().unwrap().last_sync_time,
            at(100)
        );
        store.update_computer_sync("pc-1", at(300)).unwrap();
        assert_eq!(
            store.get_computer_sync("pc-1").unwrap().unwrap().last_sync_time,
            at(300)
        );
        store.delete_computer("pc-1").unwrap();
        assert!(store.get_computer_sync("pc-1").unwrap().is_none());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deploySync.db");
        {
            let store = DeploySyncStore::open(&path).unwrap();
            store
                .save_deployment(&DeploymentEntry {
                    revision_id: 7,
                    action: DeploymentAction::Bundle,
                    deadline: None,
                    last_change_time: at(123),
                })
                .unwrap();
        }
        let store = DeploySyncStore::open(&path).unwrap();
        assert_eq!(
            store.get_deployment(7).unwrap().unwrap().action,
            DeploymentAction::Bundle
        );
    }

    #[test]
    fn test_delete_deployment() {
        let store = DeploySyncStore::open_in_memory().unwrap();
        store
            .save_deployment(&DeploymentEntry {
                revision_id: 3,
                action: DeploymentAction::Install,
                deadline: None,
                last_change_time: at(10),
            })
            .unwrap();
        store.delete_deployment(3).unwrap();
        assert!(store.get_deployment(3).unwrap().is_none());
    }
}
