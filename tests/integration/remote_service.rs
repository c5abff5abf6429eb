// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! `WsRemote` against an in-process `tasksync-server`.
//!
//! These tests validate:
//! - Direct writes sync when the server is reachable
//! - Writes made while the server is down are queued and replayed after
//!   it comes back on the same address
//! - A refused token surfaces as a stalled drain, not a lost change
//! - Remote update of a missing document reports `NotFound`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tasksync::engine::{EngineSettings, SyncEngine};
use tasksync::remote::ws::{WsRemote, WsRemoteConfig};
use tasksync::remote::{RemoteBackend, RemoteError};
use tasksync::repo::{NewTask, RemoteOutcome};
use tasksync::store::{InMemoryStore, LocalStore};
use tasksync::sync::{Backoff, DrainOutcome, SyncSettings};
use tasksync_proto::remote::MAX_FRAME_SIZE;
use tasksync_proto::task::{TaskFields, TaskId, TaskPatch, UserId};
use tasksync_server::server::{self, ServerState};

// =============================================================================
// Helpers
// =============================================================================

struct RunningServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    async fn start_on(addr: &str, state: ServerState) -> Self {
        let state = Arc::new(state);
        let (addr, handle) = server::start_server_with_state(addr, Arc::clone(&state))
            .await
            .unwrap();
        Self {
            addr,
            state,
            handle,
        }
    }

    async fn start() -> Self {
        Self::start_on("127.0.0.1:0", ServerState::new()).await
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Drops every client connection and stops listening.
    async fn stop(self) -> SocketAddr {
        self.state.close_all_connections().await;
        self.handle.abort();
        let _ = self.handle.await;
        self.addr
    }
}

fn client(url: &str, user: Option<&str>, token: Option<&str>) -> WsRemote {
    WsRemote::new(WsRemoteConfig {
        url: url.to_string(),
        user_id: user.map(UserId::new),
        token: token.map(str::to_string),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
    })
    .unwrap()
}

fn settings() -> EngineSettings {
    EngineSettings {
        sync: SyncSettings {
            remote_timeout: Duration::from_secs(3),
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
        },
        event_buffer: 64,
    }
}

fn engine(remote: WsRemote) -> SyncEngine<InMemoryStore, WsRemote> {
    SyncEngine::new(Arc::new(InMemoryStore::new()), Arc::new(remote), settings()).unwrap()
}

fn alice() -> UserId {
    UserId::new("alice")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn online_writes_sync_directly() {
    let server = RunningServer::start().await;
    let engine = engine(client(&server.url(), Some("alice"), None));

    let (id, outcome) = engine
        .repo()
        .add_task(NewTask::titled("Call plumber"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcome, RemoteOutcome::Synced);

    let (_, outcome) = engine
        .repo()
        .set_completed(&id, true)
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert_eq!(outcome, RemoteOutcome::Synced);

    let remote = server.state.tasks(&alice()).await;
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].id, id);
    assert!(remote[0].is_completed);
    assert_eq!(remote[0].user_id, alice());
    assert!(engine.remote().is_connected().await);

    // The client can read the account back.
    let listed = engine.remote().list().await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn writes_while_server_down_replay_after_restart() {
    let server = RunningServer::start().await;
    let url = server.url();
    let engine = engine(client(&url, Some("alice"), None));

    engine
        .repo()
        .add_task(NewTask::titled("before outage"))
        .unwrap()
        .settle()
        .await
        .unwrap();

    let addr = server.stop().await;

    let (during, outcome) = engine
        .repo()
        .add_task(NewTask::titled("during outage"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(matches!(outcome, RemoteOutcome::Queued(_)));
    assert_eq!(engine.repo().pending_count().unwrap(), 1);

    let report = engine.processor().process_queue().await.unwrap();
    assert!(matches!(report.outcome, DrainOutcome::Stalled { .. }));
    assert_eq!(report.remaining, 1);

    let restarted = RunningServer::start_on(&addr.to_string(), ServerState::new()).await;
    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Drained);
    assert_eq!(report.applied, 1);

    let remote = restarted.state.tasks(&alice()).await;
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].id, during);
}

#[tokio::test]
async fn refused_token_stalls_instead_of_dropping() {
    let server = RunningServer::start_on(
        "127.0.0.1:0",
        ServerState::with_config(Some("s3cret".to_string()), MAX_FRAME_SIZE),
    )
    .await;
    let engine = engine(client(&server.url(), Some("alice"), Some("wrong")));

    let (_, outcome) = engine
        .repo()
        .add_task(NewTask::titled("locked out"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(matches!(outcome, RemoteOutcome::Queued(_)));

    let report = engine.processor().process_queue().await.unwrap();
    match &report.outcome {
        DrainOutcome::Stalled { error, .. } => {
            assert!(matches!(error, RemoteError::Rejected(reason) if reason.contains("authentication")));
        }
        other => panic!("expected Stalled, got {other:?}"),
    }

    let pending = engine.store().pending_changes_ordered().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 3);
    assert!(server.state.tasks(&alice()).await.is_empty());
}

#[tokio::test]
async fn signed_out_client_never_connects() {
    let server = RunningServer::start().await;
    let engine = engine(client(&server.url(), None, None));

    let (_, outcome) = engine
        .repo()
        .add_task(NewTask::titled("anonymous"))
        .unwrap()
        .settle()
        .await
        .unwrap();
    assert!(matches!(outcome, RemoteOutcome::Queued(_)));

    let report = engine.processor().process_queue().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::NoIdentity);
    assert!(!engine.remote().is_connected().await);
    assert_eq!(server.state.connection_count().await, 0);
}

#[tokio::test]
async fn update_of_missing_document_is_not_found() {
    let server = RunningServer::start().await;
    let remote = client(&server.url(), Some("alice"), None);

    let id = TaskId::new("never-created");
    let err = remote
        .update(&id, &TaskPatch::completed(true))
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::NotFound(id.clone()));

    // Delete of an absent document succeeds, create is an idempotent overwrite.
    remote.delete(&id).await.unwrap();
    remote.create_with_id(&id, &TaskFields::titled("v1")).await.unwrap();
    remote.create_with_id(&id, &TaskFields::titled("v1")).await.unwrap();
    let tasks = remote.list().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "v1");
}

#[tokio::test]
async fn invalid_url_is_rejected_up_front() {
    let result = WsRemote::new(WsRemoteConfig {
        url: "http://127.0.0.1:9100/ws".to_string(),
        user_id: Some(alice()),
        token: None,
        connect_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(1),
    });
    assert!(matches!(result, Err(RemoteError::Protocol(_))));
}
