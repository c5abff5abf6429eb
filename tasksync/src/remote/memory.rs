//! In-process [`RemoteBackend`] with controllable connectivity.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;

use tasksync_proto::documents::Documents;
use tasksync_proto::remote::RemoteOp;
use tasksync_proto::task::{Task, TaskFields, TaskId, TaskPatch, Timestamp, UserId};

use super::{RemoteBackend, RemoteError, write_outcome};

/// One call that reached the backend, with its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    /// The requested operation.
    pub op: RemoteOp,
    /// What the caller was told.
    pub outcome: Result<(), RemoteError>,
}

#[derive(Default)]
struct State {
    user: Option<UserId>,
    online: bool,
    accounts: HashMap<UserId, Documents>,
    fail_next: usize,
    rejected: HashSet<TaskId>,
    calls: Vec<RemoteCall>,
    latency: Option<Duration>,
}

/// A remote task service living in the current process.
///
/// Documents follow the same rules as `tasksync-server` (both go through
/// [`Documents`]). Connectivity, sign-in and failures are switched by the
/// test or session driving it.
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl InMemoryRemote {
    /// Creates an online, signed-out backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                online: true,
                ..State::default()
            }),
        }
    }

    /// Creates an online backend already signed in as `user`.
    pub fn signed_in(user: impl Into<String>) -> Self {
        let remote = Self::new();
        remote.sign_in(user);
        remote
    }

    /// Starts a session for `user`.
    pub fn sign_in(&self, user: impl Into<String>) {
        let user = UserId::new(user);
        tracing::debug!(user_id = %user, "remote session started");
        self.state.lock().user = Some(user);
    }

    /// Ends the current session.
    pub fn sign_out(&self) {
        self.state.lock().user = None;
    }

    /// Switches connectivity. Offline calls fail with
    /// [`RemoteError::Unreachable`].
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Makes the next `count` calls fail as unreachable.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Makes every write to `id` fail with [`RemoteError::Rejected`].
    pub fn reject_task(&self, id: TaskId) {
        self.state.lock().rejected.insert(id);
    }

    /// Lifts a rejection set by [`reject_task`](Self::reject_task).
    pub fn accept_task(&self, id: &TaskId) {
        self.state.lock().rejected.remove(id);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// The documents of `user`, newest first.
    #[must_use]
    pub fn tasks(&self, user: &UserId) -> Vec<Task> {
        self.state
            .lock()
            .accounts
            .get(user)
            .map(Documents::list)
            .unwrap_or_default()
    }

    /// Every call that reached the backend, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Calls that were applied successfully, oldest first.
    #[must_use]
    pub fn applied(&self) -> Vec<RemoteOp> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.outcome.is_ok())
            .map(|c| c.op.clone())
            .collect()
    }

    async fn execute(&self, op: RemoteOp) -> Result<(), RemoteError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let outcome = state.run(&op);
        state.calls.push(RemoteCall {
            op,
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl State {
    fn run(&mut self, op: &RemoteOp) -> Result<(), RemoteError> {
        let user = self.user.clone().ok_or(RemoteError::Unauthenticated)?;
        if !self.online {
            return Err(RemoteError::Unreachable("offline".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(RemoteError::Unreachable("injected failure".to_string()));
        }
        if let RemoteOp::CreateWithId { id, .. } | RemoteOp::Update { id, .. } = op
            && self.rejected.contains(id)
        {
            return Err(RemoteError::Rejected(format!("task {id} refused")));
        }

        let docs = self.accounts.entry(user.clone()).or_default();
        write_outcome(docs.apply(op, &user, Timestamp::now()))
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteBackend for InMemoryRemote {
    async fn create_with_id(&self, id: &TaskId, fields: &TaskFields) -> Result<(), RemoteError> {
        self.execute(RemoteOp::CreateWithId {
            id: id.clone(),
            fields: fields.clone(),
        })
        .await
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), RemoteError> {
        self.execute(RemoteOp::Update {
            id: id.clone(),
            patch: patch.clone(),
        })
        .await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), RemoteError> {
        self.execute(RemoteOp::Delete { id: id.clone() }).await
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.state.lock().user.clone()
    }
}
