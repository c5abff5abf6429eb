//! Fire-and-forget notifications for UI consumers.
//!
//! Events are broadcast through [`tokio::sync::broadcast`]; a slow or absent
//! subscriber never blocks a mutation. Consumers re-read
//! [`TaskRepository::list_tasks`](crate::repo::TaskRepository::list_tasks)
//! and must not treat any event as proof of remote success, except
//! [`ChangeEvent::ChangeReplayed`].

use tasksync_proto::change::{ChangeId, OpKind};
use tasksync_proto::task::TaskId;

use crate::sync::DrainOutcome;

/// A change to local or queued state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A task was written locally (added, updated or claimed).
    TaskSaved(TaskId),
    /// A task was deleted locally.
    TaskDeleted(TaskId),
    /// A remote write was deferred into the pending queue.
    ChangeQueued {
        /// The queued change.
        change_id: ChangeId,
        /// Task it applies to.
        task_id: TaskId,
        /// Operation kind.
        op: OpKind,
    },
    /// A queued change was applied remotely and removed.
    ChangeReplayed {
        /// The replayed change.
        change_id: ChangeId,
        /// Task it applied to.
        task_id: TaskId,
    },
    /// A drain ended.
    DrainFinished {
        /// How it ended.
        outcome: DrainOutcome,
        /// Entries still queued.
        remaining: usize,
    },
}

/// Sending half shared by the façade and the processor.
pub(crate) type EventSender = tokio::sync::broadcast::Sender<ChangeEvent>;

/// Publishes `event`; having no subscribers is fine.
pub(crate) fn emit(tx: &EventSender, event: ChangeEvent) {
    let _ = tx.send(event);
}
