use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use conductor_core::error::{ConductorError, Result};
use conductor_core::types::RunId;

use crate::state::RunSnapshot;

/// Listing row for a stored run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Persistent run snapshots backed by SQLite. One row per run, replaced on
/// every save.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| db_error("Failed to open snapshot store", e))?;
        Self::init(conn)
    }

    /// Private in-memory store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_error("Failed to open in-memory store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_updated
                 ON runs(updated_at DESC);",
        )
        .map_err(|e| db_error("Failed to initialize snapshot schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Save a snapshot, replacing any earlier one for the same run.
    pub fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO runs (run_id, status, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 snapshot_json = excluded.snapshot_json,
                 updated_at = excluded.updated_at",
            params![
                snapshot.run_id.0,
                snapshot.status.to_string(),
                json,
                snapshot.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| db_error("Failed to save snapshot", e))?;

        Ok(())
    }

    pub fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))?;

        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM runs WHERE run_id = ?1",
                params![run_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_error("Failed to load snapshot", e))?;

        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated runs first.
    pub fn list(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, status, updated_at FROM runs
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| db_error("Failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let ts: String = row.get(2)?;
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    status: row.get(1)?,
                    updated_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| db_error("Failed to list runs", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_error("Failed to read run row", e))
    }

    pub fn delete(&self, run_id: &RunId) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))?;
        let deleted = conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.0])
            .map_err(|e| db_error("Failed to delete snapshot", e))?;
        Ok(deleted > 0)
    }
}

fn db_error(context: &str, e: rusqlite::Error) -> ConductorError {
    ConductorError::Database(format!("{}: {}", context, e))
}
