//! Wiring of the façade and the processor around one store and one remote.

use std::sync::Arc;
use std::time::Duration;

use crate::events::ChangeEvent;
use crate::queue::PendingQueue;
use crate::remote::{RemoteBackend, RemoteLane};
use crate::repo::TaskRepository;
use crate::store::{LocalStore, StoreError};
use crate::sync::{SyncHandle, SyncProcessor, SyncSettings};

/// Settings shared by the façade and the processor.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Replay policy; its `remote_timeout` also bounds the façade's direct
    /// remote writes.
    pub sync: SyncSettings,
    /// Capacity of the change event broadcast channel.
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            event_buffer: 64,
        }
    }
}

/// A [`TaskRepository`] and a [`SyncProcessor`] sharing one store handle,
/// one pending queue, one remote lane and one event channel.
pub struct SyncEngine<S: LocalStore, R: RemoteBackend> {
    store: Arc<S>,
    remote: Arc<R>,
    repo: TaskRepository<S, R>,
    processor: Arc<SyncProcessor<S, R>>,
}

impl<S, R> SyncEngine<S, R>
where
    S: LocalStore + 'static,
    R: RemoteBackend + 'static,
{
    /// Builds the engine. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the pending queue cannot be read.
    pub fn new(store: Arc<S>, remote: Arc<R>, settings: EngineSettings) -> Result<Self, StoreError> {
        let queue = Arc::new(PendingQueue::new(Arc::clone(&store))?);
        let lane = RemoteLane::new();
        let (events, _) = tokio::sync::broadcast::channel::<ChangeEvent>(settings.event_buffer.max(1));

        let repo = TaskRepository::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&remote),
            lane.clone(),
            events.clone(),
            settings.sync.remote_timeout,
        );
        let processor = Arc::new(SyncProcessor::new(
            Arc::clone(&store),
            queue,
            Arc::clone(&remote),
            lane,
            events,
            settings.sync,
        ));

        Ok(Self {
            store,
            remote,
            repo,
            processor,
        })
    }

    /// The mutation façade.
    pub const fn repo(&self) -> &TaskRepository<S, R> {
        &self.repo
    }

    /// The queue processor.
    pub const fn processor(&self) -> &Arc<SyncProcessor<S, R>> {
        &self.processor
    }

    /// The local store handle.
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The remote backend.
    pub const fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Starts periodic draining (startup drain included).
    pub fn spawn_sync(&self, interval: Duration) -> SyncHandle {
        self.processor.spawn(interval)
    }

    /// Waits until every mutation accepted so far has been synced or queued.
    ///
    /// Call this before closing the store; a store closed earlier can lose
    /// changes whose receipts were never awaited.
    pub async fn shutdown(self) {
        self.repo.close().await;
    }
}
