//! `SQLite`-backed [`LocalStore`].
//!
//! Two tables keyed by string primary key:
//!
//! - `tasks`: one row per task.
//! - `pending_changes`: one row per queued remote operation. Besides the
//!   textual op tag and postcard payload each row carries a `seq` column that
//!   breaks timestamp ties in insertion order.
//!
//! The database runs in WAL mode and every write is a single transaction.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use tasksync_proto::change::{ChangeId, OpKind, PendingChange, PendingOp};
use tasksync_proto::task::{Task, TaskId, TaskPatch, Timestamp, UserId};

use super::{LocalStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY NOT NULL,
    title        TEXT NOT NULL,
    description  TEXT,
    is_completed INTEGER NOT NULL DEFAULT 0,
    due_date     INTEGER,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    user_id      TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS pending_changes (
    id         TEXT PRIMARY KEY NOT NULL,
    seq        INTEGER NOT NULL,
    op         TEXT NOT NULL,
    task_id    TEXT NOT NULL,
    payload    BLOB,
    timestamp  INTEGER NOT NULL,
    attempts   INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_changes_order
    ON pending_changes (timestamp, seq);
";

const TASK_COLUMNS: &str =
    "id, title, description, is_completed, due_date, created_at, updated_at, user_id";

/// Durable [`LocalStore`] backed by a single `SQLite` connection.
///
/// The connection sits behind a mutex, so writes are serialized. After
/// [`close`](Self::close) every operation fails with [`StoreError::Closed`].
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and prepares the schema.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created, or
    /// [`StoreError::Sqlite`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "opened task database");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
        })
    }

    /// Database file path, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Closes the connection. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if `SQLite` fails to release the handle.
    pub fn close(&self) -> Result<(), StoreError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        tracing::debug!("closed task database");
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }
}

impl LocalStore for SqliteStore {
    fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            write_task(conn, task)?;
            Ok(())
        })
    }

    fn patch_task(
        &self,
        id: &TaskId,
        patch: &TaskPatch,
        now: Timestamp,
    ) -> Result<Option<Task>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(mut task) = read_task(&tx, id)? else {
                return Ok(None);
            };
            task.apply_patch(patch, now);
            write_task(&tx, &task)?;
            tx.commit()?;
            Ok(Some(task))
        })
    }

    fn claim_task(&self, id: &TaskId, user: &UserId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let claimed = conn.execute(
                "UPDATE tasks SET user_id = ?2 WHERE id = ?1 AND user_id = ''",
                params![id.as_str(), user.as_str()],
            )?;
            Ok(claimed > 0)
        })
    }

    fn delete_task(&self, id: &TaskId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.as_str()])?;
            Ok(removed > 0)
        })
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.with_conn(|conn| read_task(conn, id))
    }

    fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks"))?;
            let rows = stmt.query_map([], TaskRow::from_row)?;
            rows.map(|row| row?.into_task()).collect()
        })
    }

    fn enqueue_pending_change(&self, change: &PendingChange) -> Result<(), StoreError> {
        let payload = change.op.encode_payload()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_changes
                     (id, seq, op, task_id, payload, timestamp, attempts, last_error)
                 VALUES
                     (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM pending_changes),
                      ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    change.id.to_string(),
                    change.op.kind().as_str(),
                    change.task_id.as_str(),
                    payload,
                    to_sql_millis(change.timestamp),
                    change.attempts,
                    change.last_error,
                ],
            )?;
            Ok(())
        })
    }

    fn pending_changes_ordered(&self) -> Result<Vec<PendingChange>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, op, task_id, payload, timestamp, attempts, last_error
                 FROM pending_changes
                 ORDER BY timestamp ASC, seq ASC",
            )?;
            let rows = stmt.query_map([], ChangeRow::from_row)?;
            rows.map(|row| row?.into_change()).collect()
        })
    }

    fn remove_pending_change(&self, id: &ChangeId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM pending_changes WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    fn record_pending_failure(&self, id: &ChangeId, reason: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_changes
                 SET attempts = attempts + 1, last_error = ?2
                 WHERE id = ?1",
                params![id.to_string(), reason],
            )?;
            Ok(())
        })
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM pending_changes", [], |row| row.get(0))?;
            usize::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative row count {count}")))
        })
    }

    fn latest_pending_timestamp(&self) -> Result<Option<Timestamp>, StoreError> {
        self.with_conn(|conn| {
            let latest: Option<i64> =
                conn.query_row("SELECT MAX(timestamp) FROM pending_changes", [], |row| {
                    row.get(0)
                })?;
            latest.map(from_sql_millis).transpose()
        })
    }
}

fn read_task(conn: &Connection, id: &TaskId) -> Result<Option<Task>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.as_str()],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

fn write_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tasks
             (id, title, description, is_completed, due_date, created_at, updated_at, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             description = excluded.description,
             is_completed = excluded.is_completed,
             due_date = excluded.due_date,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at,
             user_id = excluded.user_id",
        params![
            task.id.as_str(),
            task.title,
            task.description,
            task.is_completed,
            task.due_date.map(to_sql_millis),
            to_sql_millis(task.created_at),
            to_sql_millis(task.updated_at),
            task.user_id.as_str(),
        ],
    )?;
    Ok(())
}

/// Raw `tasks` row before timestamp validation.
struct TaskRow {
    id: String,
    title: String,
    description: Option<String>,
    is_completed: bool,
    due_date: Option<i64>,
    created_at: i64,
    updated_at: i64,
    user_id: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            is_completed: row.get(3)?,
            due_date: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            user_id: row.get(7)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: TaskId::new(self.id),
            title: self.title,
            description: self.description,
            is_completed: self.is_completed,
            due_date: self.due_date.map(from_sql_millis).transpose()?,
            created_at: from_sql_millis(self.created_at)?,
            updated_at: from_sql_millis(self.updated_at)?,
            user_id: UserId::new(self.user_id),
        })
    }
}

/// Raw `pending_changes` row before the op is reassembled.
struct ChangeRow {
    id: String,
    op: String,
    task_id: String,
    payload: Option<Vec<u8>>,
    timestamp: i64,
    attempts: u32,
    last_error: Option<String>,
}

impl ChangeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            op: row.get(1)?,
            task_id: row.get(2)?,
            payload: row.get(3)?,
            timestamp: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
        })
    }

    fn into_change(self) -> Result<PendingChange, StoreError> {
        let kind: OpKind = self.op.parse()?;
        Ok(PendingChange {
            id: self.id.parse()?,
            task_id: TaskId::new(self.task_id),
            op: PendingOp::from_parts(kind, self.payload.as_deref())?,
            timestamp: from_sql_millis(self.timestamp)?,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

fn to_sql_millis(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn from_sql_millis(millis: i64) -> Result<Timestamp, StoreError> {
    u64::try_from(millis)
        .map(Timestamp::from_millis)
        .map_err(|_| StoreError::Corrupt(format!("negative timestamp {millis}")))
}
