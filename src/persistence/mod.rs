//! Durable session and checkpoint store with SQLite backend.
//!
//! Provides the [`StateStore`] trait (abstract base), a concrete
//! [`SqliteStateStore`] implementation, and the [`CheckpointWriter`]
//! single-writer worker that serializes all checkpoint writes so
//! concurrent agents never interleave and corrupt a record.
//!
//! Persistence is the durability contract crash recovery depends on: a
//! failed checkpoint write cancels a process-fatal token instead of
//! letting the run continue with unsound guarantees.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Lifecycle status of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Run in progress. At most one session is active at a time.
    Active,
    /// Run ended cleanly; resumable.
    Shutdown,
    /// Run ended uncleanly; resumable after in-flight work is reset.
    Crashed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Shutdown => "shutdown",
            SessionStatus::Crashed => "crashed",
        }
    }

    fn parse(raw: &str) -> Result<Self, PersistenceError> {
        match raw {
            "active" => Ok(SessionStatus::Active),
            "shutdown" => Ok(SessionStatus::Shutdown),
            "crashed" => Ok(SessionStatus::Crashed),
            other => Err(PersistenceError::Corrupt {
                detail: format!("unknown session status '{}'", other),
            }),
        }
    }
}

/// One durable record per orchestrator run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

/// Durable snapshot of one agent's state-machine instance, sufficient to
/// resume it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointRecord {
    pub agent_id: String,
    pub session_id: String,
    pub current_state: String,
    pub state_data: Value,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Status of one unit of work within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Pending,
    InFlight,
    Done,
}

impl WorkStatus {
    fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InFlight => "in_flight",
            WorkStatus::Done => "done",
        }
    }

    fn parse(raw: &str) -> Result<Self, PersistenceError> {
        match raw {
            "pending" => Ok(WorkStatus::Pending),
            "in_flight" => Ok(WorkStatus::InFlight),
            "done" => Ok(WorkStatus::Done),
            other => Err(PersistenceError::Corrupt {
                detail: format!("unknown work status '{}'", other),
            }),
        }
    }
}

/// In-flight work tracking record, used to reset leases after a crash.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub session_id: String,
    pub work_id: String,
    pub assigned_agent: Option<String>,
    pub status: WorkStatus,
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying SQLite failure.
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored JSON could not be decoded.
    #[error("stored record decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// A stored value violates the schema contract.
    #[error("corrupt record: {detail}")]
    Corrupt { detail: String },

    /// The checkpoint writer has shut down (a prior write failed or the
    /// process is exiting); no further durability is possible.
    #[error("checkpoint queue closed")]
    QueueClosed,
}

/// Abstract base trait for the durable store.
///
/// The core treats this as a durable key-value checkpoint store plus a
/// session-status table; the embedded SQL schema is an implementation
/// detail of [`SqliteStateStore`].
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Create tables and indexes. Idempotent.
    fn init_db(&self) -> Result<(), PersistenceError>;

    /// Upsert the checkpoint for `(agent_id, session_id)`.
    fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<(), PersistenceError>;

    /// Load the checkpoint for `(agent_id, session_id)`, if any.
    fn load_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<Option<CheckpointRecord>, PersistenceError>;

    /// Open a new active session. Any session still marked active is a
    /// leftover from an unclean exit and is demoted to crashed first, so
    /// at most one session is ever active.
    fn begin_session(&self, session_id: &str) -> Result<SessionRecord, PersistenceError>;

    /// Update a session's lifecycle status.
    fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), PersistenceError>;

    /// Demote any session still marked active to crashed. Called before
    /// resume: a session that is active while no orchestrator is running
    /// is the residue of an unclean exit. Returns the number demoted.
    fn mark_active_crashed(&self) -> Result<usize, PersistenceError>;

    /// The most recent non-active session, if any. Resume logic starts
    /// here.
    fn most_recent_resumable(&self) -> Result<Option<SessionRecord>, PersistenceError>;

    /// Upsert one work item record.
    fn upsert_work_item(&self, item: &WorkItem) -> Result<(), PersistenceError>;

    /// Demote all in-flight work items of a session back to pending,
    /// clearing their agent assignment. Returns the number reset.
    fn reset_in_flight(&self, session_id: &str) -> Result<usize, PersistenceError>;

    /// All pending work items of a session.
    fn pending_work(&self, session_id: &str) -> Result<Vec<WorkItem>, PersistenceError>;
}

/// SQLite-based implementation of the durable store.
///
/// A single connection guarded by a mutex; suitable for the write rates
/// of a small agent fleet, where every write already funnels through the
/// [`CheckpointWriter`].
#[derive(Debug)]
pub struct SqliteStateStore {
    /// Path to the SQLite database file.
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open (or create) the database at `db_path` and initialize the
    /// schema.
    pub fn open(db_path: impl Into<String>) -> Result<Self, PersistenceError> {
        let path = db_path.into();
        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(&path)?;
        let store = Self {
            db_path: path,
            conn: Mutex::new(conn),
        };
        store.init_db()?;
        Ok(store)
    }

    /// Open an in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let store = Self {
            db_path: ":memory:".to_string(),
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_db()?;
        Ok(store)
    }
}

impl StateStore for SqliteStateStore {
    fn init_db(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                current_state TEXT NOT NULL,
                state_json TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE(agent_id, session_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_session
             ON checkpoints(session_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS work_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                work_id TEXT NOT NULL,
                assigned_agent TEXT,
                status TEXT NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE(session_id, work_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_work_items_session
             ON work_items(session_id)",
            [],
        )?;

        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        let state_json = serde_json::to_string(&checkpoint.state_data)?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints
             (agent_id, session_id, current_state, state_json, retry_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.agent_id,
                checkpoint.session_id,
                checkpoint.current_state,
                state_json,
                checkpoint.retry_count,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        log::debug!(
            "checkpoint saved: agent={} session={} state={}",
            checkpoint.agent_id,
            checkpoint.session_id,
            checkpoint.current_state
        );
        Ok(())
    }

    fn load_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<Option<CheckpointRecord>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT current_state, state_json, retry_count, updated_at
             FROM checkpoints
             WHERE agent_id = ?1 AND session_id = ?2",
        )?;
        let row: Option<(String, String, u32, String)> = stmt
            .query_row(params![agent_id, session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .ok();

        match row {
            Some((current_state, state_json, retry_count, updated_at)) => {
                let state_data: Value = serde_json::from_str(&state_json)?;
                let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| PersistenceError::Corrupt {
                        detail: format!("bad checkpoint timestamp: {}", e),
                    })?
                    .with_timezone(&Utc);
                Ok(Some(CheckpointRecord {
                    agent_id: agent_id.to_string(),
                    session_id: session_id.to_string(),
                    current_state,
                    state_data,
                    retry_count,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn begin_session(&self, session_id: &str) -> Result<SessionRecord, PersistenceError> {
        let demoted = self.mark_active_crashed()?;
        if demoted > 0 {
            log::warn!(
                "{} stale active session(s) demoted to crashed before starting '{}'",
                demoted,
                session_id
            );
        }

        let conn = self.conn.lock();
        let started_at = Utc::now();
        conn.execute(
            "INSERT INTO sessions (session_id, status, started_at) VALUES (?1, 'active', ?2)",
            params![session_id, started_at.to_rfc3339()],
        )?;
        Ok(SessionRecord {
            session_id: session_id.to_string(),
            status: SessionStatus::Active,
            started_at,
        })
    }

    fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET status = ?1 WHERE session_id = ?2",
            params![status.as_str(), session_id],
        )?;
        log::info!("session '{}' marked {}", session_id, status.as_str());
        Ok(())
    }

    fn mark_active_crashed(&self) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock();
        let demoted = conn.execute(
            "UPDATE sessions SET status = 'crashed' WHERE status = 'active'",
            [],
        )?;
        Ok(demoted)
    }

    fn most_recent_resumable(&self) -> Result<Option<SessionRecord>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, status, started_at FROM sessions
             WHERE status != 'active'
             ORDER BY id DESC
             LIMIT 1",
        )?;
        let row: Option<(String, String, String)> = stmt
            .query_row([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .ok();

        match row {
            Some((session_id, status, started_at)) => {
                let started_at = DateTime::parse_from_rfc3339(&started_at)
                    .map_err(|e| PersistenceError::Corrupt {
                        detail: format!("bad session timestamp: {}", e),
                    })?
                    .with_timezone(&Utc);
                Ok(Some(SessionRecord {
                    session_id,
                    status: SessionStatus::parse(&status)?,
                    started_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn upsert_work_item(&self, item: &WorkItem) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO work_items
             (session_id, work_id, assigned_agent, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                item.session_id,
                item.work_id,
                item.assigned_agent,
                item.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn reset_in_flight(&self, session_id: &str) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock();
        let reset = conn.execute(
            "UPDATE work_items
             SET status = 'pending', assigned_agent = NULL, updated_at = ?1
             WHERE session_id = ?2 AND status = 'in_flight'",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        if reset > 0 {
            log::info!(
                "{} in-flight work item(s) reset to pending for session '{}'",
                reset,
                session_id
            );
        }
        Ok(reset)
    }

    fn pending_work(&self, session_id: &str) -> Result<Vec<WorkItem>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT work_id, assigned_agent, status FROM work_items
             WHERE session_id = ?1 AND status = 'pending'
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (work_id, assigned_agent, status) = row?;
            items.push(WorkItem {
                session_id: session_id.to_string(),
                work_id,
                assigned_agent,
                status: WorkStatus::parse(&status)?,
            });
        }
        Ok(items)
    }
}

enum WriteJob {
    Save(CheckpointRecord),
    Flush(oneshot::Sender<()>),
}

/// Single-writer checkpoint queue.
///
/// All checkpoint writes from all agents funnel through one worker task,
/// so writes never interleave and no fine-grained locks are needed across
/// the schema. Saves are fire-and-forget from the agent's perspective;
/// a write failure cancels the process-fatal token and closes the queue.
pub struct CheckpointWriter {
    tx: mpsc::Sender<WriteJob>,
    fatal: CancellationToken,
}

impl CheckpointWriter {
    /// Spawn the worker. `fatal` is cancelled on the first write failure;
    /// the supervisor watches it and halts the process.
    pub fn spawn(
        store: Arc<dyn StateStore>,
        queue_capacity: usize,
        fatal: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(queue_capacity);
        let worker_fatal = fatal.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Save(checkpoint) => {
                        let store = Arc::clone(&store);
                        let agent_id = checkpoint.agent_id.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            store.save_checkpoint(&checkpoint)
                        })
                        .await;
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                log::error!(
                                    "checkpoint write failed for agent '{}': {}; halting",
                                    agent_id,
                                    e
                                );
                                rx.close();
                                worker_fatal.cancel();
                                break;
                            }
                            Err(e) => {
                                log::error!("checkpoint writer panicked: {}; halting", e);
                                rx.close();
                                worker_fatal.cancel();
                                break;
                            }
                        }
                    }
                    WriteJob::Flush(ack) => {
                        // All prior saves have been applied in order; ack.
                        let _ = ack.send(());
                    }
                }
            }
            log::debug!("checkpoint writer stopped");
        });

        Self { tx, fatal }
    }

    /// Enqueue a checkpoint write. Backpressure from the bounded queue is
    /// applied here; durability is not awaited.
    pub async fn save(&self, checkpoint: CheckpointRecord) -> Result<(), PersistenceError> {
        self.tx
            .send(WriteJob::Save(checkpoint))
            .await
            .map_err(|_| PersistenceError::QueueClosed)
    }

    /// Wait until every previously enqueued write has been applied. Used
    /// as the shutdown barrier.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Flush(ack_tx))
            .await
            .map_err(|_| PersistenceError::QueueClosed)?;
        ack_rx.await.map_err(|_| PersistenceError::QueueClosed)
    }

    /// Token cancelled when a write has failed and durability is gone.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }
}

impl std::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("fatal", &self.fatal.is_cancelled())
            .finish()
    }
}
