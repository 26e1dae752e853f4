//! Job status store: in-memory snapshots backed by SQLite
//!
//! Reads are served from a concurrent map of immutable snapshots; every write
//! replaces a job's snapshot as a whole and is mirrored to the `jobs` table so
//! status survives a restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{JobSnapshot, JobState};

/// Cause recorded for jobs a previous process left unfinished
pub const INTERRUPTED_CAUSE: &str = "interrupted by restart";

/// Queryable mapping from job id to its latest snapshot
pub struct JobStatusStore {
    snapshots: DashMap<Uuid, Arc<JobSnapshot>>,
    conn: Mutex<Connection>,
}

impl JobStatusStore {
    /// Create or open the store at the given path and load persisted jobs
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("Failed to open database: {}", e)))?;

        let store = Self {
            snapshots: DashMap::new(),
            conn: Mutex::new(conn),
        };

        store.migrate()?;
        store.load()?;
        Ok(store)
    }

    /// Create a store with an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("Failed to open in-memory database: {}", e)))?;

        let store = Self {
            snapshots: DashMap::new(),
            conn: Mutex::new(conn),
        };

        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
        "#).map_err(|e| Error::storage(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                failed_records INTEGER NOT NULL DEFAULT 0,
                artifact TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
        "#).map_err(|e| Error::storage(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    /// Load persisted rows into memory
    fn load(&self) -> Result<usize> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                "SELECT id, state, completed, total, attempt, failed_records, artifact, error, \
                 created_at, started_at, updated_at, finished_at FROM jobs",
            )
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], row_to_snapshot)
            .map_err(|e| Error::storage(format!("Failed to load jobs: {}", e)))?;

        let mut loaded = 0;
        for row in rows {
            match row {
                Ok(Some(snapshot)) => {
                    self.snapshots.insert(snapshot.id, Arc::new(snapshot));
                    loaded += 1;
                }
                Ok(None) => tracing::warn!("Skipping unreadable job row"),
                Err(e) => tracing::warn!("Skipping job row: {}", e),
            }
        }

        if loaded > 0 {
            tracing::info!("Loaded {} persisted jobs", loaded);
        }
        Ok(loaded)
    }

    /// Store a newly created job. Fails if the id is already taken.
    pub fn insert(&self, snapshot: JobSnapshot) -> Result<Arc<JobSnapshot>> {
        let id = snapshot.id;
        if self.snapshots.contains_key(&id) {
            return Err(Error::InvalidState(format!("job {} already exists", id)));
        }
        // Persist first so a rejected write leaves no job behind
        self.persist(&snapshot)?;
        let snapshot = Arc::new(snapshot);
        self.snapshots.insert(id, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Replace a job's snapshot. Readers see either the old or the new snapshot.
    ///
    /// The in-memory replica is updated first so status queries are fresh even
    /// when the database write fails; the failure is still returned.
    pub fn replace(&self, snapshot: JobSnapshot) -> Result<Arc<JobSnapshot>> {
        let id = snapshot.id;
        if !self.snapshots.contains_key(&id) {
            return Err(Error::JobNotFound(id));
        }
        let snapshot = Arc::new(snapshot);
        self.snapshots.insert(id, Arc::clone(&snapshot));
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Latest snapshot of a job
    pub fn get(&self, id: Uuid) -> Result<Arc<JobSnapshot>> {
        self.snapshots
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::JobNotFound(id))
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<Arc<JobSnapshot>> {
        let mut jobs: Vec<_> = self.snapshots.iter().map(|e| Arc::clone(e.value())).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Count of jobs per state
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.snapshots.iter() {
            stats.total += 1;
            match entry.state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Success => stats.success += 1,
                JobState::Failure => stats.failure += 1,
            }
        }
        stats
    }

    /// Mark jobs left PENDING or RUNNING by a previous process as failed.
    ///
    /// Their input records were never persisted, so they cannot be resumed.
    pub fn fail_interrupted(&self) -> Result<Vec<Uuid>> {
        let stale: Vec<Arc<JobSnapshot>> = self
            .snapshots
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut failed = Vec::with_capacity(stale.len());
        for snapshot in stale {
            self.replace(snapshot.failed(INTERRUPTED_CAUSE)?)?;
            failed.push(snapshot.id);
        }
        Ok(failed)
    }

    /// Check that the database still answers queries
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn persist(&self, job: &JobSnapshot) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO jobs (
                id, state, completed, total, attempt, failed_records, artifact, error,
                created_at, started_at, updated_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                completed = excluded.completed,
                attempt = excluded.attempt,
                failed_records = excluded.failed_records,
                artifact = excluded.artifact,
                error = excluded.error,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at,
                finished_at = excluded.finished_at
            "#,
            params![
                job.id.to_string(),
                job.state.as_str(),
                job.completed as i64,
                job.total as i64,
                job.attempt as i64,
                job.failed_records as i64,
                job.artifact,
                job.error,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.updated_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        ).map_err(|e| Error::storage(format!("Failed to persist job {}: {}", job.id, e)))?;

        Ok(())
    }
}

/// Job counts by state
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failure: usize,
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// `Ok(None)` for rows whose id or state cannot be parsed
fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Option<JobSnapshot>> {
    let id_str: String = row.get(0)?;
    let state_str: String = row.get(1)?;
    let completed: i64 = row.get(2)?;
    let total: i64 = row.get(3)?;
    let attempt: i64 = row.get(4)?;
    let failed_records: i64 = row.get(5)?;
    let artifact: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    let started_at_str: Option<String> = row.get(9)?;
    let updated_at_str: String = row.get(10)?;
    let finished_at_str: Option<String> = row.get(11)?;

    let (Ok(id), Some(state)) = (Uuid::parse_str(&id_str), JobState::parse(&state_str)) else {
        return Ok(None);
    };
    let created_at = parse_time(&created_at_str).unwrap_or_else(Utc::now);

    Ok(Some(JobSnapshot {
        id,
        state,
        completed: completed.max(0) as usize,
        total: total.max(0) as usize,
        attempt: attempt.max(0) as u32,
        failed_records: failed_records.max(0) as usize,
        artifact,
        error,
        created_at,
        started_at: started_at_str.as_deref().and_then(parse_time),
        updated_at: parse_time(&updated_at_str).unwrap_or(created_at),
        finished_at: finished_at_str.as_deref().and_then(parse_time),
    }))
}
