// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Replay order and drain control.
//!
//! These tests validate:
//! - Changes for one task reach the remote in enqueue order
//! - A failing entry stops the drain and leaves later entries untouched
//! - Concurrent drains never submit the same operation twice
//! - A direct write never overtakes an older queued change
//! - Change events are published for queued and replayed changes

use std::sync::Arc;
use std::time::Duration;

use tasksync::engine::{EngineSettings, SyncEngine};
use tasksync::events::ChangeEvent;
use tasksync::remote::{InMemoryRemote, RemoteError};
use tasksync::repo::{NewTask, RemoteOutcome};
use tasksync::store::{InMemoryStore, LocalStore};
use tasksync::sync::{Backoff, DrainOutcome, SyncSettings};
use tasksync_proto::remote::RemoteOp;
use tasksync_proto::task::{TaskId, TaskPatch, UserId};

type Engine = SyncEngine<InMemoryStore, InMemoryRemote>;

fn engine_with(remote: InMemoryRemote, max_attempts: u32) -> Engine {
    let settings = EngineSettings {
        sync: SyncSettings {
            remote_timeout: Duration::from_secs(1),
            max_attempts,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        },
        event_buffer: 256,
    };
    SyncEngine::new(Arc::new(InMemoryStore::new()), Arc::new(remote), settings).unwrap()
}

async fn add(engine: &Engine, title: &str) -> TaskId {
    engine
        .repo()
        .add_task(NewTask::titled(title))
        .unwrap()
        .settle()
        .await
        .unwrap()
        .0
}

fn target(op: &RemoteOp) -> Option<&TaskId> {
    match op {
        RemoteOp::CreateWithId { id, .. } | RemoteOp::Update { id, .. } | RemoteOp::Delete { id } => {
            Some(id)
        }
        RemoteOp::List => None,
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn changes_for_one_task_replay_in_enqueue_order() {
    let engine = engine_with(InMemoryRemote::new(), 1);

    let id = add(&engine, "draft").await;
    let repo = engine.repo();
    repo.update_task(&id, TaskPatch::title("final")).unwrap().settle().await.unwrap();
    repo.set_completed(&id, true).unwrap().settle().await.unwrap();
    repo.delete_task(&id).unwrap().settle().await.unwrap();
    assert_eq!(repo.pending_count().unwrap(), 4);

    engine.remote().sign_in("alice");
    engine.processor().process_queue().await.unwrap();

    let applied = engine.remote().applied();
    assert_eq!(applied.len(), 4);
    assert!(matches!(&applied[0], RemoteOp::CreateWithId { fields, .. } if fields.title == "draft"));
    assert!(matches!(&applied[1], RemoteOp::Update { patch, .. } if patch.title.as_deref() == Some("final")));
    assert!(matches!(&applied[2], RemoteOp::Update { patch, .. } if patch.is_completed == Some(true)));
    assert!(matches!(&applied[3], RemoteOp::Delete { .. }));
}

#[tokio::test]
async fn queue_timestamps_never_decrease() {
    let engine = engine_with(InMemoryRemote::new(), 1);
    for title in ["a", "b", "c", "d", "e"] {
        add(&engine, title).await;
    }
    let changes = engine.store().pending_changes_ordered().unwrap();
    assert_eq!(changes.len(), 5);
    assert!(changes.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

// =============================================================================
// Abort on failure
// =============================================================================

#[tokio::test]
async fn failing_entry_stops_the_drain() {
    let engine = engine_with(InMemoryRemote::new(), 2);
    let first = add(&engine, "first").await;
    let stuck = add(&engine, "stuck").await;
    let third = add(&engine, "third").await;

    engine.remote().sign_in("alice");
    engine.remote().reject_task(stuck.clone());

    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.remaining, 2);
    match &report.outcome {
        DrainOutcome::Stalled { error, .. } => assert!(matches!(error, RemoteError::Rejected(_))),
        other => panic!("expected Stalled, got {other:?}"),
    }

    // Only the first entry reached the remote; the third was never tried.
    let touched: Vec<_> = engine.remote().calls().iter().filter_map(|c| target(&c.op).cloned()).collect();
    assert!(touched.contains(&first));
    assert!(!touched.contains(&third));

    let remaining = engine.store().pending_changes_ordered().unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].task_id, stuck);
    assert_eq!(remaining[0].attempts, 2);
    assert!(remaining[0].last_error.as_deref().unwrap().contains("refused"));
    assert_eq!(remaining[1].task_id, third);
    assert_eq!(remaining[1].attempts, 0);
    assert!(remaining[1].last_error.is_none());

    // Once the remote accepts it, the next drain finishes the queue.
    engine.remote().accept_task(&stuck);
    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Drained);
    assert_eq!(report.applied, 2);
    assert_eq!(engine.remote().tasks(&UserId::new("alice")).len(), 3);
}

#[tokio::test]
async fn transient_failure_is_retried_within_one_drain() {
    let engine = engine_with(InMemoryRemote::new(), 3);
    add(&engine, "flaky").await;
    engine.remote().sign_in("alice");
    engine.remote().fail_next(2);

    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Drained);
    assert_eq!(report.applied, 1);
    assert_eq!(engine.remote().calls().len(), 3);
}

#[tokio::test]
async fn signed_out_drain_leaves_queue_alone() {
    let engine = engine_with(InMemoryRemote::new(), 1);
    add(&engine, "offline").await;

    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::NoIdentity);
    assert_eq!(report.remaining, 1);
    assert!(engine.remote().calls().is_empty());
    assert_eq!(engine.store().pending_changes_ordered().unwrap()[0].attempts, 0);
}

// =============================================================================
// Single flight and backlog
// =============================================================================

#[tokio::test]
async fn concurrent_drains_do_not_double_submit() {
    let engine = engine_with(InMemoryRemote::new(), 1);
    for title in ["a", "b", "c"] {
        add(&engine, title).await;
    }
    engine.remote().sign_in("alice");
    engine.remote().set_latency(Some(Duration::from_millis(30)));

    let processor = Arc::clone(engine.processor());
    let (left, right) = tokio::join!(processor.process_queue(), engine.processor().process_queue());
    let outcomes = [left.unwrap().outcome, right.unwrap().outcome];
    assert!(outcomes.contains(&DrainOutcome::AlreadyRunning));
    assert!(outcomes.contains(&DrainOutcome::Drained));

    assert_eq!(engine.remote().calls().len(), 3);
    assert_eq!(engine.repo().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn direct_write_waits_behind_backlog() {
    let engine = engine_with(InMemoryRemote::new(), 1);
    let id = add(&engine, "queued first").await;

    engine.remote().sign_in("alice");
    let (_, outcome) = engine
        .repo()
        .set_completed(&id, true)
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(matches!(outcome, RemoteOutcome::Queued(_)));
    assert!(engine.remote().calls().is_empty());

    engine.processor().process_queue().await.unwrap();
    let applied = engine.remote().applied();
    assert!(matches!(applied[0], RemoteOp::CreateWithId { .. }));
    assert!(matches!(applied[1], RemoteOp::Update { .. }));

    // With the backlog gone, writes go straight through again.
    let (_, outcome) = engine
        .repo()
        .set_completed(&id, false)
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcome, RemoteOutcome::Synced);
}

#[tokio::test]
async fn remote_timeout_counts_as_failure() {
    let remote = InMemoryRemote::signed_in("alice");
    remote.set_latency(Some(Duration::from_millis(200)));
    let settings = EngineSettings {
        sync: SyncSettings {
            remote_timeout: Duration::from_millis(20),
            max_attempts: 1,
            backoff: Backoff::default(),
        },
        event_buffer: 16,
    };
    let engine = SyncEngine::new(Arc::new(InMemoryStore::new()), Arc::new(remote), settings).unwrap();

    let (_, outcome) = engine
        .repo()
        .add_task(NewTask::titled("slow"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(matches!(outcome, RemoteOutcome::Queued(_)));

    let report = engine.processor().process_queue().await.unwrap();
    assert!(matches!(
        report.outcome,
        DrainOutcome::Stalled {
            error: RemoteError::Timeout,
            ..
        }
    ));
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn events_report_queue_and_replay() {
    let engine = engine_with(InMemoryRemote::new(), 1);
    let mut events = engine.repo().subscribe();

    let id = add(&engine, "watched").await;
    engine.remote().sign_in("alice");
    engine.processor().process_queue().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(matches!(&seen[0], ChangeEvent::TaskSaved(t) if *t == id));
    assert!(seen.iter().any(|e| matches!(e, ChangeEvent::ChangeQueued { task_id, .. } if *task_id == id)));
    assert!(seen.iter().any(|e| matches!(e, ChangeEvent::ChangeReplayed { task_id, .. } if *task_id == id)));
    assert!(matches!(
        seen.last(),
        Some(ChangeEvent::DrainFinished {
            outcome: DrainOutcome::Drained,
            remaining: 0
        })
    ));
}
