//! The repository façade: the only entry point for task mutations.
//!
//! Every mutation is optimistic. The local write happens synchronously,
//! before the method returns, and is never rolled back. The matching remote
//! write is handed to a single outbound worker that runs them in call order;
//! if the caller is signed out, the remote call fails, or older changes are
//! still queued, the write is deferred into the [`PendingQueue`] instead.
//!
//! Callers get a [`Mutation`] back: the local result plus a
//! [`RemoteReceipt`] that resolves once the remote side has either synced or
//! queued the change. Awaiting the receipt is optional.

mod outbound;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use tasksync_proto::change::ChangeId;
use tasksync_proto::task::{
    Task, TaskFields, TaskId, TaskPatch, Timestamp, ValidationError, validate_title,
};

use crate::events::{ChangeEvent, EventSender, emit};
use crate::queue::PendingQueue;
use crate::remote::{RemoteBackend, RemoteLane, RemoteWrite};
use crate::store::{LocalStore, StoreError};

use outbound::{Job, Outbound};

/// Errors returned by the façade.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Local storage failed; nothing was written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The input was rejected before any write.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The task to update does not exist locally.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// The outbound worker is gone (runtime shutting down).
    #[error("repository is closed")]
    Closed,
}

/// Where a mutation's remote write ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied remotely right away.
    Synced,
    /// Deferred into the pending queue as this change.
    Queued(ChangeId),
}

/// Completion handle for the remote half of a mutation.
///
/// Dropping it discards the notification; the remote work still happens as
/// long as the repository is shut down with [`TaskRepository::close`].
#[derive(Debug)]
pub struct RemoteReceipt(oneshot::Receiver<Result<RemoteOutcome, StoreError>>);

impl RemoteReceipt {
    /// Waits until the remote write is synced or queued.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Store`] if the change could not be queued, or
    /// [`RepoError::Closed`] if the outbound worker stopped first.
    pub async fn wait(self) -> Result<RemoteOutcome, RepoError> {
        match self.0.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RepoError::Closed),
        }
    }
}

/// Result of a façade mutation.
#[derive(Debug)]
pub struct Mutation<T> {
    /// The local result, already durable.
    pub value: T,
    /// Completion of the remote half.
    pub receipt: RemoteReceipt,
}

impl<T> Mutation<T> {
    /// Splits into the local value and the receipt.
    pub fn into_parts(self) -> (T, RemoteReceipt) {
        (self.value, self.receipt)
    }

    /// Waits for the remote half and returns both results.
    ///
    /// # Errors
    ///
    /// See [`RemoteReceipt::wait`].
    pub async fn settle(self) -> Result<(T, RemoteOutcome), RepoError> {
        let outcome = self.receipt.wait().await?;
        Ok((self.value, outcome))
    }
}

/// Input for [`TaskRepository::add_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Caller-chosen id; a fresh UUID v7 is generated when `None`.
    pub id: Option<TaskId>,
    /// Task title.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional due date.
    pub due_date: Option<Timestamp>,
    /// Initial completion flag.
    pub is_completed: bool,
}

impl NewTask {
    /// A task with only a title.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the due date.
    #[must_use]
    pub const fn with_due_date(mut self, due: Timestamp) -> Self {
        self.due_date = Some(due);
        self
    }

    /// Uses a caller-chosen id.
    #[must_use]
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    fn fields(&self) -> TaskFields {
        TaskFields {
            title: self.title.clone(),
            description: self.description.clone(),
            is_completed: self.is_completed,
            due_date: self.due_date,
        }
    }
}

/// Optimistic task repository over a local store and a remote backend.
///
/// Must be created inside a Tokio runtime (it spawns its outbound worker).
/// Call [`close`](Self::close) before closing the store: it waits for every
/// accepted remote write to be synced or queued.
pub struct TaskRepository<S: LocalStore, R: RemoteBackend> {
    store: Arc<S>,
    queue: Arc<PendingQueue<S>>,
    remote: Arc<R>,
    events: EventSender,
    outbound: mpsc::UnboundedSender<Job>,
    worker: tokio::task::JoinHandle<()>,
}

impl<S, R> TaskRepository<S, R>
where
    S: LocalStore + 'static,
    R: RemoteBackend + 'static,
{
    /// Builds the façade and starts its outbound worker.
    pub fn new(
        store: Arc<S>,
        queue: Arc<PendingQueue<S>>,
        remote: Arc<R>,
        lane: RemoteLane,
        events: EventSender,
        remote_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Outbound {
            queue: Arc::clone(&queue),
            remote: Arc::clone(&remote),
            lane,
            events: events.clone(),
            remote_timeout,
        };
        let worker = tokio::spawn(worker.run(rx));

        Self {
            store,
            queue,
            remote,
            events,
            outbound: tx,
            worker,
        }
    }

    /// Creates a task locally and schedules its remote creation.
    ///
    /// The task belongs to the signed-in account, or to nobody (empty
    /// `user_id`) when signed out; the sync processor claims it later.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Validation`] for a bad title and
    /// [`RepoError::Store`] if the local write fails.
    pub fn add_task(&self, input: NewTask) -> Result<Mutation<TaskId>, RepoError> {
        validate_title(&input.title)?;
        self.ensure_open()?;

        let id = input.id.clone().unwrap_or_else(TaskId::generate);
        let fields = input.fields();
        let owner = self.remote.current_user_id().unwrap_or_default();
        let task = Task::from_fields(id.clone(), fields.clone(), owner, Timestamp::now());
        self.store.upsert_task(&task)?;

        tracing::info!(task_id = %id, "task added locally");
        emit(&self.events, ChangeEvent::TaskSaved(id.clone()));

        let receipt = self.schedule(id.clone(), RemoteWrite::Create(fields));
        Ok(Mutation { value: id, receipt })
    }

    /// Applies `patch` locally and schedules the same patch remotely.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::TaskNotFound`] if the task does not exist locally
    /// (nothing is queued), [`RepoError::Validation`] for a bad title and
    /// [`RepoError::Store`] if the local write fails.
    pub fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Mutation<Task>, RepoError> {
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        self.ensure_open()?;

        let task = self
            .store
            .patch_task(id, &patch, Timestamp::now())?
            .ok_or_else(|| RepoError::TaskNotFound(id.clone()))?;

        tracing::info!(task_id = %id, "task updated locally");
        emit(&self.events, ChangeEvent::TaskSaved(id.clone()));

        let receipt = self.schedule(id.clone(), RemoteWrite::Update(patch));
        Ok(Mutation {
            value: task,
            receipt,
        })
    }

    /// Marks a task complete or incomplete.
    ///
    /// # Errors
    ///
    /// See [`update_task`](Self::update_task).
    pub fn set_completed(&self, id: &TaskId, done: bool) -> Result<Mutation<Task>, RepoError> {
        self.update_task(id, TaskPatch::completed(done))
    }

    /// Deletes a task locally and schedules the remote delete.
    ///
    /// Deleting an id that is not stored locally is not an error; the remote
    /// delete is still scheduled. `value` reports whether a local row existed.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Store`] if the local delete fails.
    pub fn delete_task(&self, id: &TaskId) -> Result<Mutation<bool>, RepoError> {
        self.ensure_open()?;

        let existed = self.store.delete_task(id)?;
        if existed {
            tracing::info!(task_id = %id, "task deleted locally");
            emit(&self.events, ChangeEvent::TaskDeleted(id.clone()));
        } else {
            tracing::debug!(task_id = %id, "delete of unknown task, remote delete only");
        }

        let receipt = self.schedule(id.clone(), RemoteWrite::Delete);
        Ok(Mutation {
            value: existed,
            receipt,
        })
    }

    /// Every local task, most recently created first.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Store`] if the read fails.
    pub fn list_tasks(&self) -> Result<Vec<Task>, RepoError> {
        let mut tasks = self.store.list_tasks()?;
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// A single local task.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Store`] if the read fails.
    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>, RepoError> {
        Ok(self.store.get_task(id)?)
    }

    /// Number of changes waiting for replay.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Store`] if the read fails.
    pub fn pending_count(&self) -> Result<usize, RepoError> {
        Ok(self.queue.len()?)
    }

    /// Subscribes to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Stops the façade and waits for its outbound worker to finish every
    /// remote write already accepted.
    pub async fn close(self) {
        let Self {
            outbound, worker, ..
        } = self;
        drop(outbound);
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "outbound worker ended abnormally");
        }
        tracing::debug!("repository closed");
    }

    fn ensure_open(&self) -> Result<(), RepoError> {
        if self.outbound.is_closed() {
            return Err(RepoError::Closed);
        }
        Ok(())
    }

    fn schedule(&self, task_id: TaskId, write: RemoteWrite) -> RemoteReceipt {
        let (reply, rx) = oneshot::channel();
        if self
            .outbound
            .send(Job {
                task_id,
                write,
                reply,
            })
            .is_err()
        {
            // The dropped job closes the receipt, which then reports Closed.
            tracing::warn!("outbound worker stopped, remote write abandoned");
        }
        RemoteReceipt(rx)
    }
}
