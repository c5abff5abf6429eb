//! Background scheduling of drains.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::remote::RemoteBackend;
use crate::store::LocalStore;

use super::SyncProcessor;

/// Shortest period the loop will tick at; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Control handle for a running sync loop.
///
/// Dropping the handle stops the loop after the current drain.
pub struct SyncHandle {
    trigger: mpsc::Sender<()>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncHandle {
    /// Requests a drain as soon as possible (e.g. right after sign-in).
    ///
    /// Requests made while one is already pending are merged.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// `true` once the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and waits for the current drain to complete.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "sync loop ended abnormally");
        }
    }
}

pub(super) fn spawn<S, R>(processor: Arc<SyncProcessor<S, R>>, interval: Duration) -> SyncHandle
where
    S: LocalStore + 'static,
    R: RemoteBackend + 'static,
{
    let interval = interval.max(MIN_PERIOD);
    let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        // The first tick fires immediately: that is the startup drain.
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "sync loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tick.tick() => {}
                Some(()) = trigger_rx.recv() => {}
            }
            match processor.process_queue().await {
                Ok(report) => tracing::debug!(
                    outcome = ?report.outcome,
                    applied = report.applied,
                    remaining = report.remaining,
                    "scheduled drain done"
                ),
                Err(e) => tracing::error!(error = %e, "drain failed on local store"),
            }
        }
        tracing::info!("sync loop stopped");
    });

    SyncHandle {
        trigger: trigger_tx,
        shutdown: Some(shutdown_tx),
        task,
    }
}
