//! The remote task service, as seen by the sync engine.
//!
//! [`RemoteBackend`] is the collaborator the repository façade and the sync
//! processor write through. Implementations:
//!
//! - [`InMemoryRemote`]: in-process backend with sign-in and failure
//!   injection, used by tests and ephemeral sessions.
//! - [`WsRemote`]: WebSocket client for `tasksync-server`.
//!
//! Every remote operation is idempotent by task id: creating with the same id
//! overwrites, deleting a missing task succeeds, and updates carry absolute
//! values. Replaying an entry whose success was never recorded locally is
//! therefore safe.

pub mod memory;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tasksync_proto::change::PendingOp;
use tasksync_proto::remote::RemoteReply;
use tasksync_proto::task::{TaskFields, TaskId, TaskPatch, UserId};

pub use memory::InMemoryRemote;
pub use ws::WsRemote;

/// Failures of a remote call. All of them are recoverable: the façade queues
/// the change and the processor stops the current drain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// No authenticated identity is available.
    #[error("not signed in")]
    Unauthenticated,

    /// The service could not be reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The call did not complete in time.
    #[error("remote call timed out")]
    Timeout,

    /// An update targeted a document the service does not have.
    #[error("task {0} not found remotely")]
    NotFound(TaskId),

    /// The service refused the operation.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The service answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Backend task service consumed by the sync engine.
pub trait RemoteBackend: Send + Sync {
    /// Sets the whole document for `id`, creating it if needed.
    fn create_with_id(
        &self,
        id: &TaskId,
        fields: &TaskFields,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Merges `patch` into the existing document for `id`.
    fn update(
        &self,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Deletes the document for `id`; succeeds if it does not exist.
    fn delete(&self, id: &TaskId) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// The authenticated account, or `None` when signed out.
    ///
    /// Checked before every remote attempt; `None` means skip and queue.
    fn current_user_id(&self) -> Option<UserId>;
}

/// A single write to send to the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteWrite {
    /// `create_with_id` with these fields.
    Create(TaskFields),
    /// `update` with this patch.
    Update(TaskPatch),
    /// `delete`.
    Delete,
}

impl RemoteWrite {
    /// The queue entry that replays this write later.
    #[must_use]
    pub fn into_pending_op(self) -> PendingOp {
        match self {
            Self::Create(fields) => PendingOp::add(fields),
            Self::Update(patch) => PendingOp::Update(patch),
            Self::Delete => PendingOp::Delete,
        }
    }
}

/// Sends `write` for `task_id`, bounded by `timeout`.
///
/// # Errors
///
/// Returns the backend's [`RemoteError`], or [`RemoteError::Timeout`] if the
/// call does not finish in time.
pub async fn submit<R: RemoteBackend>(
    remote: &R,
    task_id: &TaskId,
    write: &RemoteWrite,
    timeout: Duration,
) -> Result<(), RemoteError> {
    let call = async {
        match write {
            RemoteWrite::Create(fields) => remote.create_with_id(task_id, fields).await,
            RemoteWrite::Update(patch) => remote.update(task_id, patch).await,
            RemoteWrite::Delete => remote.delete(task_id).await,
        }
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| RemoteError::Timeout)?
}

/// Interprets the service's reply to a write.
pub(crate) fn write_outcome(reply: RemoteReply) -> Result<(), RemoteError> {
    match reply {
        RemoteReply::Done => Ok(()),
        RemoteReply::NotFound(id) => Err(RemoteError::NotFound(id)),
        RemoteReply::Rejected(reason) => Err(RemoteError::Rejected(reason)),
        RemoteReply::Tasks(_) => Err(RemoteError::Protocol(
            "task list returned for a write".to_string(),
        )),
    }
}

/// Serializes remote writes between the façade's outbound worker and the
/// sync processor, so a direct write never interleaves with a drain.
#[derive(Debug, Clone, Default)]
pub struct RemoteLane(Arc<tokio::sync::Mutex<()>>);

impl RemoteLane {
    /// Creates a free lane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive use of the lane.
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.0.lock().await
    }
}
