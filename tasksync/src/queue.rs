//! The pending change queue.
//!
//! A thin ordering layer over the [`LocalStore`] pending-change table. Changes
//! are replayed in enqueue order and are never reordered or coalesced: an
//! `Add` followed by two `Update`s and a `Delete` of the same task stays four
//! entries.
//!
//! Enqueue timestamps are monotonic. Each change is stamped with
//! `max(now, last assigned)`, seeded from the newest stored change, so a
//! wall clock that steps backwards cannot move a new change ahead of an old
//! one. Equal timestamps fall back to the store's insertion order.

use std::sync::Arc;

use parking_lot::Mutex;

use tasksync_proto::change::{ChangeId, PendingChange, PendingOp};
use tasksync_proto::task::{TaskId, Timestamp};

use crate::store::{LocalStore, StoreError};

/// FIFO queue of remote operations awaiting replay.
pub struct PendingQueue<S: LocalStore> {
    store: Arc<S>,
    /// Largest timestamp handed out so far.
    high_water: Mutex<Timestamp>,
}

impl<S: LocalStore> PendingQueue<S> {
    /// Creates a queue over `store`, seeding the timestamp high-water mark
    /// from the changes already stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn new(store: Arc<S>) -> Result<Self, StoreError> {
        let seed = store.latest_pending_timestamp()?.unwrap_or_default();
        Ok(Self {
            store,
            high_water: Mutex::new(seed),
        })
    }

    /// Appends a change for `task_id` and returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be written.
    pub fn enqueue(&self, task_id: TaskId, op: PendingOp) -> Result<PendingChange, StoreError> {
        self.enqueue_at(task_id, op, Timestamp::now())
    }

    /// Like [`enqueue`](Self::enqueue) with an explicit wall-clock reading.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be written.
    pub fn enqueue_at(
        &self,
        task_id: TaskId,
        op: PendingOp,
        now: Timestamp,
    ) -> Result<PendingChange, StoreError> {
        // The lock spans the insert so stamps and insertion order agree.
        let mut high_water = self.high_water.lock();
        let stamp = now.max(*high_water);
        let change = PendingChange::new(task_id, op, stamp);
        self.store.enqueue_pending_change(&change)?;
        *high_water = stamp;

        tracing::debug!(
            change_id = %change.id,
            task_id = %change.task_id,
            op = %change.op.kind(),
            timestamp = stamp.as_millis(),
            "queued pending change"
        );
        Ok(change)
    }

    /// Every pending change in replay order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn ordered(&self) -> Result<Vec<PendingChange>, StoreError> {
        self.store.pending_changes_ordered()
    }

    /// Removes a replayed change. Returns whether it was still queued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be written.
    pub fn remove(&self, id: &ChangeId) -> Result<bool, StoreError> {
        self.store.remove_pending_change(id)
    }

    /// Records a failed replay attempt on the change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be written.
    pub fn record_failure(&self, id: &ChangeId, reason: &str) -> Result<(), StoreError> {
        self.store.record_pending_failure(id, reason)
    }

    /// Number of queued changes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.store.pending_count()
    }

    /// `true` if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}
