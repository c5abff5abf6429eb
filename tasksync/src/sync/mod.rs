//! The sync processor: drains the pending change queue against the remote.
//!
//! One drain walks the queue in order and replays each change. A change that
//! still fails after its retries stops the whole drain; later changes stay
//! queued untouched until the next drain, so change N+1 never reaches the
//! remote before change N.
//!
//! Drains are single-flight: a drain requested while another is running
//! returns [`DrainOutcome::AlreadyRunning`] at once. Drains also hold the
//! [`RemoteLane`], so they never interleave with the façade's direct writes.

mod backoff;
mod handle;

use std::sync::Arc;
use std::time::Duration;

use tasksync_proto::change::{ChangeId, PendingChange, PendingOp};
use tasksync_proto::task::UserId;

use crate::events::{ChangeEvent, EventSender, emit};
use crate::queue::PendingQueue;
use crate::remote::{self, RemoteBackend, RemoteError, RemoteLane, RemoteWrite};
use crate::store::{LocalStore, StoreError};

pub use backoff::Backoff;
pub use handle::SyncHandle;

/// Default period between scheduled drains.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Retry and timeout policy for replays.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Limit for a single remote call.
    pub remote_timeout: Duration,
    /// Attempts per change within one drain before the drain stalls.
    pub max_attempts: u32,
    /// Delay growth between attempts.
    pub backoff: Backoff,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Signed out; the queue was not touched.
    NoIdentity,
    /// Another drain was in progress.
    AlreadyRunning,
    /// Every change was replayed.
    Drained,
    /// A change kept failing; it and everything after it remain queued.
    Stalled {
        /// The change that failed.
        change_id: ChangeId,
        /// Its last error.
        error: RemoteError,
    },
}

/// Summary of one [`SyncProcessor::process_queue`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// How the drain ended.
    pub outcome: DrainOutcome,
    /// Changes replayed and removed.
    pub applied: usize,
    /// Changes still queued afterwards.
    pub remaining: usize,
}

/// Result of replaying one change.
enum Replay {
    Applied,
    /// The change can never be replayed (an `Add` whose task is gone).
    Unreplayable,
    Failed(RemoteError),
}

/// Replays queued changes against the remote backend.
pub struct SyncProcessor<S: LocalStore, R: RemoteBackend> {
    store: Arc<S>,
    queue: Arc<PendingQueue<S>>,
    remote: Arc<R>,
    lane: RemoteLane,
    events: EventSender,
    settings: SyncSettings,
    in_flight: tokio::sync::Mutex<()>,
}

impl<S: LocalStore, R: RemoteBackend> SyncProcessor<S, R> {
    /// Creates a processor sharing `lane` with the repository façade.
    pub fn new(
        store: Arc<S>,
        queue: Arc<PendingQueue<S>>,
        remote: Arc<R>,
        lane: RemoteLane,
        events: EventSender,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            lane,
            events,
            settings,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs one drain.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the local store fails; remote failures are
    /// reported through [`DrainOutcome::Stalled`] instead.
    pub async fn process_queue(&self) -> Result<DrainReport, StoreError> {
        if self.remote.current_user_id().is_none() {
            tracing::debug!("no authenticated identity, skipping drain");
            return self.finish(DrainOutcome::NoIdentity, 0);
        }
        let Ok(_flight) = self.in_flight.try_lock() else {
            tracing::debug!("drain already in progress");
            return Ok(DrainReport {
                outcome: DrainOutcome::AlreadyRunning,
                applied: 0,
                remaining: self.queue.len()?,
            });
        };
        let _lane = self.lane.acquire().await;

        // The session may have ended while waiting for the lane.
        let Some(user) = self.remote.current_user_id() else {
            return self.finish(DrainOutcome::NoIdentity, 0);
        };

        let changes = self.queue.ordered()?;
        if changes.is_empty() {
            return self.finish(DrainOutcome::Drained, 0);
        }
        tracing::info!(pending = changes.len(), user_id = %user, "draining pending changes");

        let mut applied = 0;
        for change in changes {
            match self.replay(&change, &user).await? {
                Replay::Applied => {
                    self.queue.remove(&change.id)?;
                    applied += 1;
                    tracing::debug!(
                        change_id = %change.id,
                        task_id = %change.task_id,
                        op = %change.op.kind(),
                        "replayed pending change"
                    );
                    emit(
                        &self.events,
                        ChangeEvent::ChangeReplayed {
                            change_id: change.id,
                            task_id: change.task_id,
                        },
                    );
                }
                Replay::Unreplayable => {
                    tracing::warn!(
                        change_id = %change.id,
                        task_id = %change.task_id,
                        "add without payload for a task that no longer exists, dropping"
                    );
                    self.queue.remove(&change.id)?;
                }
                Replay::Failed(error) => {
                    tracing::warn!(
                        change_id = %change.id,
                        task_id = %change.task_id,
                        error = %error,
                        "replay failed, stopping drain"
                    );
                    let outcome = DrainOutcome::Stalled {
                        change_id: change.id,
                        error,
                    };
                    return self.finish(outcome, applied);
                }
            }
        }

        self.finish(DrainOutcome::Drained, applied)
    }

    /// Drains repeatedly until the queue is empty or stops shrinking.
    ///
    /// `applied` in the returned report is the total over all passes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the local store fails.
    pub async fn process_until_idle(&self) -> Result<DrainReport, StoreError> {
        let mut total = 0;
        loop {
            let report = self.process_queue().await?;
            total += report.applied;
            let settled = report.outcome != DrainOutcome::Drained
                || report.applied == 0
                || report.remaining == 0;
            if settled {
                return Ok(DrainReport {
                    applied: total,
                    ..report
                });
            }
        }
    }

    /// Replays one change, retrying with backoff.
    async fn replay(&self, change: &PendingChange, user: &UserId) -> Result<Replay, StoreError> {
        let write = match &change.op {
            PendingOp::Add {
                fields: Some(fields),
            } => RemoteWrite::Create(fields.clone()),
            PendingOp::Add { fields: None } => match self.store.get_task(&change.task_id)? {
                Some(task) => RemoteWrite::Create(task.fields()),
                None => return Ok(Replay::Unreplayable),
            },
            PendingOp::Update(patch) => RemoteWrite::Update(patch.clone()),
            PendingOp::Delete => RemoteWrite::Delete,
        };

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = remote::submit(
                self.remote.as_ref(),
                &change.task_id,
                &write,
                self.settings.remote_timeout,
            )
            .await;

            let error = match result {
                Ok(()) => {
                    if matches!(write, RemoteWrite::Create(_))
                        && self.store.claim_task(&change.task_id, user)?
                    {
                        tracing::debug!(task_id = %change.task_id, user_id = %user, "claimed task");
                        emit(&self.events, ChangeEvent::TaskSaved(change.task_id.clone()));
                    }
                    return Ok(Replay::Applied);
                }
                Err(error) => error,
            };

            self.queue.record_failure(&change.id, &error.to_string())?;
            attempt += 1;
            if attempt >= max_attempts || error == RemoteError::Unauthenticated {
                return Ok(Replay::Failed(error));
            }

            let delay = self.settings.backoff.delay(attempt - 1);
            tracing::debug!(
                change_id = %change.id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying pending change"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn finish(&self, outcome: DrainOutcome, applied: usize) -> Result<DrainReport, StoreError> {
        let remaining = self.queue.len()?;
        if applied > 0 || remaining > 0 {
            tracing::info!(?outcome, applied, remaining, "drain finished");
        }
        emit(
            &self.events,
            ChangeEvent::DrainFinished {
                outcome: outcome.clone(),
                remaining,
            },
        );
        Ok(DrainReport {
            outcome,
            applied,
            remaining,
        })
    }
}

impl<S, R> SyncProcessor<S, R>
where
    S: LocalStore + 'static,
    R: RemoteBackend + 'static,
{
    /// Starts the background loop: one drain right away, then one every
    /// `interval`, plus one per [`SyncHandle::trigger`].
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> SyncHandle {
        handle::spawn(Arc::clone(self), interval)
    }
}
