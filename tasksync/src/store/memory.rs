//! In-memory [`LocalStore`] for tests and ephemeral sessions.

use std::collections::HashMap;

use parking_lot::Mutex;

use tasksync_proto::change::{ChangeId, PendingChange};
use tasksync_proto::task::{Task, TaskId, TaskPatch, Timestamp, UserId};

use super::{LocalStore, StoreError};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// Pending changes with their insertion sequence number.
    pending: Vec<(u64, PendingChange)>,
    next_seq: u64,
}

/// Non-persistent [`LocalStore`]. All data is lost when the value is dropped.
///
/// Each operation holds a single lock for its whole duration, which makes
/// every write atomic with respect to concurrent readers.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for InMemoryStore {
    fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.lock().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn patch_task(
        &self,
        id: &TaskId,
        patch: &TaskPatch,
        now: Timestamp,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner.tasks.get_mut(id).map(|task| {
            task.apply_patch(patch, now);
            task.clone()
        }))
    }

    fn claim_task(&self, id: &TaskId, user: &UserId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(id) {
            Some(task) if task.user_id.is_unclaimed() => {
                task.user_id = user.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_task(&self, id: &TaskId) -> Result<bool, StoreError> {
        Ok(self.inner.lock().tasks.remove(id).is_some())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().tasks.get(id).cloned())
    }

    fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.inner.lock().tasks.values().cloned().collect())
    }

    fn enqueue_pending_change(&self, change: &PendingChange) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.pending.iter().any(|(_, c)| c.id == change.id) {
            return Err(StoreError::Corrupt(format!(
                "duplicate pending change id {}",
                change.id
            )));
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.pending.push((seq, change.clone()));
        Ok(())
    }

    fn pending_changes_ordered(&self) -> Result<Vec<PendingChange>, StoreError> {
        let inner = self.inner.lock();
        let mut entries: Vec<&(u64, PendingChange)> = inner.pending.iter().collect();
        entries.sort_by_key(|(seq, change)| (change.timestamp, *seq));
        Ok(entries.into_iter().map(|(_, c)| c.clone()).collect())
    }

    fn remove_pending_change(&self, id: &ChangeId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        inner.pending.retain(|(_, c)| c.id != *id);
        Ok(inner.pending.len() < before)
    }

    fn record_pending_failure(&self, id: &ChangeId, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some((_, change)) = inner.pending.iter_mut().find(|(_, c)| c.id == *id) {
            change.attempts = change.attempts.saturating_add(1);
            change.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().pending.len())
    }

    fn latest_pending_timestamp(&self) -> Result<Option<Timestamp>, StoreError> {
        Ok(self
            .inner
            .lock()
            .pending
            .iter()
            .map(|(_, c)| c.timestamp)
            .max())
    }
}
