// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::too_many_lines
)]

//! Offline editing followed by sign-in converges local and remote state.
//!
//! Covers:
//! - Scenario 1: add while signed out, sign in, drain
//! - Scenario 2: two opposite completion updates while offline
//! - Scenario 3: add then delete while offline
//! - Property: any offline/online mix of add/update/delete converges once
//!   the queue is drained to a fixed point

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tasksync::engine::{EngineSettings, SyncEngine};
use tasksync::remote::InMemoryRemote;
use tasksync::repo::{NewTask, RemoteOutcome, RepoError};
use tasksync::store::{InMemoryStore, LocalStore};
use tasksync::sync::{Backoff, DrainOutcome, SyncSettings};
use tasksync_proto::change::OpKind;
use tasksync_proto::remote::RemoteOp;
use tasksync_proto::task::{Task, TaskId, TaskPatch, UserId};

type Engine = SyncEngine<InMemoryStore, InMemoryRemote>;

// =============================================================================
// Helpers
// =============================================================================

fn fast_settings() -> EngineSettings {
    EngineSettings {
        sync: SyncSettings {
            remote_timeout: Duration::from_millis(500),
            max_attempts: 2,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        },
        event_buffer: 256,
    }
}

fn engine(remote: InMemoryRemote) -> Engine {
    SyncEngine::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(remote),
        fast_settings(),
    )
    .unwrap()
}

fn alice() -> UserId {
    UserId::new("alice")
}

/// The client-visible fields of a task, keyed by id, ignoring timestamps.
type Snapshot = BTreeMap<TaskId, (String, Option<String>, bool, Option<u64>, UserId)>;

fn snapshot(tasks: &[Task]) -> Snapshot {
    tasks
        .iter()
        .map(|t| {
            (
                t.id.clone(),
                (
                    t.title.clone(),
                    t.description.clone(),
                    t.is_completed,
                    t.due_date.map(|d| d.as_millis()),
                    t.user_id.clone(),
                ),
            )
        })
        .collect()
}

fn queued_kinds(engine: &Engine) -> Vec<OpKind> {
    engine
        .store()
        .pending_changes_ordered()
        .unwrap()
        .iter()
        .map(|c| c.op.kind())
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn add_while_signed_out_syncs_after_sign_in() {
    let engine = engine(InMemoryRemote::new());

    let (id, outcome) = engine
        .repo()
        .add_task(NewTask::titled("A"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(matches!(outcome, RemoteOutcome::Queued(_)));

    let local = engine.repo().list_tasks().unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].title, "A");
    assert!(local[0].user_id.is_unclaimed());
    assert_eq!(queued_kinds(&engine), vec![OpKind::Add]);

    engine.remote().sign_in("alice");
    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Drained);
    assert_eq!(report.applied, 1);

    let remote = engine.remote().tasks(&alice());
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].id, id);
    assert_eq!(remote[0].title, "A");
    assert_eq!(engine.repo().pending_count().unwrap(), 0);

    // The local copy is claimed by the account that synced it.
    let local = engine.repo().get_task(&id).unwrap().unwrap();
    assert_eq!(local.user_id, alice());
    assert_eq!(
        snapshot(&engine.repo().list_tasks().unwrap()),
        snapshot(&remote)
    );
}

#[tokio::test]
async fn opposite_updates_offline_leave_last_value() {
    let engine = engine(InMemoryRemote::signed_in("alice"));

    let (id, outcome) = engine
        .repo()
        .add_task(NewTask::titled("B"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcome, RemoteOutcome::Synced);

    engine.remote().set_online(false);
    engine.repo().set_completed(&id, true).unwrap().settle().await.unwrap();
    engine.repo().set_completed(&id, false).unwrap().settle().await.unwrap();
    assert_eq!(queued_kinds(&engine), vec![OpKind::Update, OpKind::Update]);

    engine.remote().set_online(true);
    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.remaining, 0);

    let remote = engine.remote().tasks(&alice());
    assert_eq!(remote.len(), 1);
    assert!(!remote[0].is_completed);
}

#[tokio::test]
async fn add_then_delete_offline_nets_out() {
    let engine = engine(InMemoryRemote::signed_in("alice"));
    engine.remote().set_online(false);

    let (id, _) = engine
        .repo()
        .add_task(NewTask::titled("C"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    let (existed, _) = engine.repo().delete_task(&id).unwrap().settle().await.unwrap();
    assert!(existed);
    assert_eq!(queued_kinds(&engine), vec![OpKind::Add, OpKind::Delete]);
    assert!(engine.repo().get_task(&id).unwrap().is_none());

    engine.remote().set_online(true);
    engine.processor().process_until_idle().await.unwrap();

    assert!(engine.remote().tasks(&alice()).is_empty());
    assert!(engine.repo().list_tasks().unwrap().is_empty());
    assert_eq!(engine.repo().pending_count().unwrap(), 0);

    // Both operations reached the remote, in order.
    let applied = engine.remote().applied();
    assert_eq!(applied.len(), 2);
    assert!(matches!(applied[0], RemoteOp::CreateWithId { .. }));
    assert!(matches!(applied[1], RemoteOp::Delete { .. }));
}

#[tokio::test]
async fn update_of_unknown_task_queues_nothing() {
    let engine = engine(InMemoryRemote::new());
    let err = engine
        .repo()
        .update_task(&TaskId::new("ghost"), TaskPatch::completed(true))
        .unwrap_err();
    assert!(matches!(err, RepoError::TaskNotFound(_)));
    assert_eq!(engine.repo().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn drain_is_idempotent() {
    let engine = engine(InMemoryRemote::new());
    for title in ["one", "two", "three"] {
        engine
            .repo()
            .add_task(NewTask::titled(title))
            .unwrap()
            .settle()
            .await
            .unwrap();
    }
    engine.remote().sign_in("alice");

    let first = engine.processor().process_queue().await.unwrap();
    assert_eq!(first.applied, 3);
    let calls_after_first = engine.remote().calls().len();

    let second = engine.processor().process_queue().await.unwrap();
    assert_eq!(second.outcome, DrainOutcome::Drained);
    assert_eq!(second.applied, 0);
    assert_eq!(engine.remote().calls().len(), calls_after_first);
}

// =============================================================================
// Convergence property
// =============================================================================

/// Connectivity while an operation is issued.
#[derive(Debug, Clone, Copy)]
enum Link {
    SignedOut,
    Offline,
    Online,
}

#[derive(Debug, Clone)]
enum Step {
    Add(String),
    Update {
        target: usize,
        title: Option<String>,
        done: Option<bool>,
        clear_description: bool,
    },
    Delete(usize),
}

fn arb_link() -> impl Strategy<Value = Link> {
    prop_oneof![Just(Link::SignedOut), Just(Link::Offline), Just(Link::Online)]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => "[a-z]{1,8}".prop_map(Step::Add),
        3 => (0usize..8, proptest::option::of("[a-z]{1,8}"), proptest::option::of(any::<bool>()), any::<bool>())
            .prop_map(|(target, title, done, clear_description)| Step::Update {
                target,
                title,
                done,
                clear_description,
            }),
        1 => (0usize..8).prop_map(Step::Delete),
    ]
}

fn set_link(remote: &InMemoryRemote, link: Link) {
    match link {
        Link::SignedOut => {
            remote.sign_out();
            remote.set_online(true);
        }
        Link::Offline => {
            remote.sign_in("alice");
            remote.set_online(false);
        }
        Link::Online => {
            remote.sign_in("alice");
            remote.set_online(true);
        }
    }
}

async fn run_steps(steps: Vec<(Link, Step)>) -> (Snapshot, Snapshot, usize) {
    let engine = engine(InMemoryRemote::new());
    let mut ids: Vec<TaskId> = Vec::new();

    for (link, step) in steps {
        set_link(engine.remote(), link);
        match step {
            Step::Add(title) => {
                let input = NewTask::titled(title).with_description("notes");
                let (id, _) = engine.repo().add_task(input).unwrap().settle().await.unwrap();
                ids.push(id);
            }
            Step::Update {
                target,
                title,
                done,
                clear_description,
            } => {
                let Some(id) = ids.get(target % ids.len().max(1)) else {
                    continue;
                };
                let patch = TaskPatch {
                    title,
                    description: clear_description.then_some(None),
                    is_completed: done,
                    due_date: None,
                };
                match engine.repo().update_task(id, patch) {
                    Ok(mutation) => {
                        mutation.settle().await.unwrap();
                    }
                    Err(RepoError::TaskNotFound(_)) => {}
                    Err(e) => panic!("unexpected update error: {e}"),
                }
            }
            Step::Delete(target) => {
                let Some(id) = ids.get(target % ids.len().max(1)) else {
                    continue;
                };
                engine.repo().delete_task(id).unwrap().settle().await.unwrap();
            }
        }
    }

    set_link(engine.remote(), Link::Online);
    let report = engine.processor().process_until_idle().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Drained);

    let local = snapshot(&engine.repo().list_tasks().unwrap());
    let remote = snapshot(&engine.remote().tasks(&alice()));
    (local, remote, report.remaining)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn offline_edits_converge(steps in proptest::collection::vec((arb_link(), arb_step()), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (local, remote, remaining) = runtime.block_on(run_steps(steps));
        prop_assert_eq!(remaining, 0);
        prop_assert_eq!(local, remote);
    }
}
