//! The façade's outbound worker: runs remote writes one at a time, in the
//! order the façade accepted them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use tasksync_proto::task::TaskId;

use crate::events::{ChangeEvent, EventSender, emit};
use crate::queue::PendingQueue;
use crate::remote::{self, RemoteBackend, RemoteLane, RemoteWrite};
use crate::store::{LocalStore, StoreError};

use super::RemoteOutcome;

/// One remote write handed over by the façade.
pub(super) struct Job {
    pub task_id: TaskId,
    pub write: RemoteWrite,
    pub reply: oneshot::Sender<Result<RemoteOutcome, StoreError>>,
}

pub(super) struct Outbound<S: LocalStore, R: RemoteBackend> {
    pub queue: Arc<PendingQueue<S>>,
    pub remote: Arc<R>,
    pub lane: RemoteLane,
    pub events: EventSender,
    pub remote_timeout: Duration,
}

impl<S: LocalStore, R: RemoteBackend> Outbound<S, R> {
    pub async fn run(self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let result = self.deliver(job.task_id, job.write).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "could not queue pending change");
            }
            let _ = job.reply.send(result);
        }
        tracing::debug!("outbound worker exiting");
    }

    async fn deliver(
        &self,
        task_id: TaskId,
        write: RemoteWrite,
    ) -> Result<RemoteOutcome, StoreError> {
        let _lane = self.lane.acquire().await;

        if self.remote.current_user_id().is_none() {
            tracing::debug!(task_id = %task_id, "signed out, deferring remote write");
            return self.defer(task_id, write);
        }
        // Older changes must reach the remote first.
        if !self.queue.is_empty()? {
            tracing::debug!(task_id = %task_id, "backlog present, deferring remote write");
            return self.defer(task_id, write);
        }

        match remote::submit(self.remote.as_ref(), &task_id, &write, self.remote_timeout).await {
            Ok(()) => {
                tracing::debug!(task_id = %task_id, "remote write applied");
                Ok(RemoteOutcome::Synced)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "remote write failed, queueing");
                self.defer(task_id, write)
            }
        }
    }

    fn defer(&self, task_id: TaskId, write: RemoteWrite) -> Result<RemoteOutcome, StoreError> {
        let change = self.queue.enqueue(task_id, write.into_pending_op())?;
        emit(
            &self.events,
            ChangeEvent::ChangeQueued {
                change_id: change.id.clone(),
                task_id: change.task_id,
                op: change.op.kind(),
            },
        );
        Ok(RemoteOutcome::Queued(change.id))
    }
}
