//! Local durable storage of tasks and pending changes.
//!
//! Defines the [`LocalStore`] trait used by the repository façade, the
//! pending change queue and the sync processor, plus two implementations:
//!
//! - [`SqliteStore`]: durable, crash-safe storage in a `SQLite` database.
//! - [`InMemoryStore`]: ephemeral storage for tests and `--ephemeral` runs.
//!
//! Every write is a single transaction: a concurrent reader observes either
//! the whole write or none of it.

pub mod memory;
pub mod sqlite;

use std::path::PathBuf;

use tasksync_proto::change::{ChangeId, PendingChange};
use tasksync_proto::codec::CodecError;
use tasksync_proto::task::{Task, TaskId, TaskPatch, Timestamp, UserId};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Errors raised by local storage. Always fatal for the calling operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database reported an error (disk full, I/O, constraint).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row does not describe a valid record.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A pending change payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// The database directory could not be prepared.
    #[error("cannot prepare {}: {source}", path.display())]
    Io {
        /// Path that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Durable storage of [`Task`] and [`PendingChange`] records.
///
/// Methods are synchronous: implementations hold their lock only for the
/// duration of one transaction, which is short enough to run on the async
/// executor directly.
pub trait LocalStore: Send + Sync {
    /// Inserts or fully replaces the task with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn upsert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Applies `patch` to the stored task inside one transaction.
    ///
    /// Returns the updated task, or `None` if no task has that id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read or write fails.
    fn patch_task(
        &self,
        id: &TaskId,
        patch: &TaskPatch,
        now: Timestamp,
    ) -> Result<Option<Task>, StoreError>;

    /// Sets the owner of a task that has none yet.
    ///
    /// Returns `true` if the task existed with an empty owner and now
    /// belongs to `user`. Tasks that already have an owner are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn claim_task(&self, id: &TaskId, user: &UserId) -> Result<bool, StoreError>;

    /// Removes the task if present. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn delete_task(&self, id: &TaskId) -> Result<bool, StoreError>;

    /// Point read of a single task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Snapshot of every stored task, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Appends a pending change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn enqueue_pending_change(&self, change: &PendingChange) -> Result<(), StoreError>;

    /// Every pending change in replay order: ascending timestamp, ties
    /// broken by insertion order. Reads only; nothing is removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or a payload is corrupt.
    fn pending_changes_ordered(&self) -> Result<Vec<PendingChange>, StoreError>;

    /// Removes a pending change. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn remove_pending_change(&self, id: &ChangeId) -> Result<bool, StoreError>;

    /// Bumps the attempt counter of a pending change and stores `reason`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn record_pending_failure(&self, id: &ChangeId, reason: &str) -> Result<(), StoreError>;

    /// Number of pending changes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn pending_count(&self) -> Result<usize, StoreError>;

    /// Largest timestamp among pending changes, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn latest_pending_timestamp(&self) -> Result<Option<Timestamp>, StoreError>;
}
