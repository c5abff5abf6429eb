// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Durability of the SQLite store across close/reopen.
//!
//! These tests validate:
//! - Tasks and pending changes written before close are readable after reopen
//! - A drain after reopen replays what the previous session queued
//! - Changes whose receipts were dropped are still queued after shutdown
//! - Queue timestamps stay monotonic across sessions
//! - A closed store refuses further work

use std::sync::Arc;
use std::time::Duration;

use tasksync::engine::{EngineSettings, SyncEngine};
use tasksync::queue::PendingQueue;
use tasksync::remote::InMemoryRemote;
use tasksync::repo::{NewTask, RepoError};
use tasksync::store::{LocalStore, SqliteStore, StoreError};
use tasksync::sync::DrainOutcome;
use tasksync_proto::change::{OpKind, PendingOp};
use tasksync_proto::task::{TaskId, TaskPatch, Timestamp, UserId};

fn settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.sync.remote_timeout = Duration::from_secs(1);
    settings.sync.max_attempts = 1;
    settings
}

#[tokio::test]
async fn offline_session_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tasks.db");

    let id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine =
            SyncEngine::new(Arc::clone(&store), Arc::new(InMemoryRemote::new()), settings()).unwrap();

        let input = NewTask::titled("Pay rent")
            .with_description("before the 5th")
            .with_due_date(Timestamp::from_millis(1_800_000_000_000));
        let (id, _) = engine.repo().add_task(input).unwrap().settle().await.unwrap();
        engine
            .repo()
            .update_task(&id, TaskPatch::completed(true))
            .unwrap()
            .settle()
            .await
            .unwrap();
        assert_eq!(engine.repo().pending_count().unwrap(), 2);

        engine.shutdown().await;
        store.close().unwrap();
        id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let task = store.get_task(&id).unwrap().unwrap();
    assert_eq!(task.title, "Pay rent");
    assert_eq!(task.description.as_deref(), Some("before the 5th"));
    assert_eq!(task.due_date, Some(Timestamp::from_millis(1_800_000_000_000)));
    assert!(task.is_completed);
    assert!(task.created_at <= task.updated_at);

    let pending = store.pending_changes_ordered().unwrap();
    let kinds: Vec<_> = pending.iter().map(|c| c.op.kind()).collect();
    assert_eq!(kinds, vec![OpKind::Add, OpKind::Update]);

    let engine = SyncEngine::new(
        Arc::clone(&store),
        Arc::new(InMemoryRemote::signed_in("alice")),
        settings(),
    )
    .unwrap();
    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Drained);
    assert_eq!(report.applied, 2);

    let remote = engine.remote().tasks(&UserId::new("alice"));
    assert_eq!(remote.len(), 1);
    assert!(remote[0].is_completed);
    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(store.get_task(&id).unwrap().unwrap().user_id, UserId::new("alice"));
}

#[tokio::test]
async fn unawaited_receipts_survive_shutdown_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine =
            SyncEngine::new(Arc::clone(&store), Arc::new(InMemoryRemote::new()), settings()).unwrap();

        let (id, receipt) = engine.repo().add_task(NewTask::titled("A")).unwrap().into_parts();
        drop(receipt);
        engine.shutdown().await;
        store.close().unwrap();
        id
    };

    let store = SqliteStore::open(&path).unwrap();
    assert!(store.get_task(&id).unwrap().is_some());
    let pending = store.pending_changes_ordered().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, id);
    assert_eq!(pending[0].op.kind(), OpKind::Add);
}

#[tokio::test]
async fn timestamps_stay_monotonic_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let future = Timestamp::from_millis(u64::from(u32::MAX) * 1_000);

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let queue = PendingQueue::new(Arc::clone(&store)).unwrap();
        queue
            .enqueue_at(TaskId::new("a"), PendingOp::Delete, future)
            .unwrap();
        store.close().unwrap();
    }

    // The wall clock is now far behind the stored high-water mark.
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let queue = PendingQueue::new(Arc::clone(&store)).unwrap();
    let later = queue.enqueue(TaskId::new("b"), PendingOp::Delete).unwrap();
    assert_eq!(later.timestamp, future);

    let order: Vec<_> = queue
        .ordered()
        .unwrap()
        .into_iter()
        .map(|c| c.task_id)
        .collect();
    assert_eq!(order, vec![TaskId::new("a"), TaskId::new("b")]);
}

#[tokio::test]
async fn closed_store_rejects_mutations() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine =
        SyncEngine::new(Arc::clone(&store), Arc::new(InMemoryRemote::new()), settings()).unwrap();

    store.close().unwrap();
    store.close().unwrap();

    let err = engine.repo().add_task(NewTask::titled("late")).unwrap_err();
    assert!(matches!(err, RepoError::Store(StoreError::Closed)));
    assert!(matches!(
        engine.repo().list_tasks(),
        Err(RepoError::Store(StoreError::Closed))
    ));
}

#[tokio::test]
async fn failure_diagnostics_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let remote = InMemoryRemote::new();
        let engine = SyncEngine::new(Arc::clone(&store), Arc::new(remote), settings()).unwrap();
        let (id, _) = engine
            .repo()
            .add_task(NewTask::titled("doomed"))
            .unwrap()
            .settle()
            .await
            .unwrap();
        engine.remote().sign_in("alice");
        engine.remote().reject_task(id);

        let report = engine.processor().process_queue().await.unwrap();
        assert!(matches!(report.outcome, DrainOutcome::Stalled { .. }));
        engine.shutdown().await;
        store.close().unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let pending = store.pending_changes_ordered().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());
}
