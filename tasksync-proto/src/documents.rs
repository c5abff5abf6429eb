//! Per-account task document semantics of the remote service.
//!
//! Both the WebSocket task server and the in-process test backend apply
//! [`RemoteOp`]s through [`Documents::apply`], so they agree on what each
//! operation means:
//!
//! - `CreateWithId` overwrites the whole document and stamps server
//!   timestamps and the session owner. Repeating it is harmless.
//! - `Update` merges the supplied fields and fails if the document is missing.
//! - `Delete` succeeds whether or not the document exists.

use std::collections::HashMap;

use crate::remote::{RemoteOp, RemoteReply};
use crate::task::{Task, TaskId, Timestamp, UserId, validate_title};

/// The task documents of one account.
#[derive(Debug, Clone, Default)]
pub struct Documents {
    tasks: HashMap<TaskId, Task>,
}

impl Documents {
    /// Creates an empty account.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one operation on behalf of `owner` at server time `now`.
    pub fn apply(&mut self, op: &RemoteOp, owner: &UserId, now: Timestamp) -> RemoteReply {
        match op {
            RemoteOp::CreateWithId { id, fields } => {
                if let Err(e) = validate_title(&fields.title) {
                    return RemoteReply::Rejected(e.to_string());
                }
                let task = Task::from_fields(id.clone(), fields.clone(), owner.clone(), now);
                self.tasks.insert(id.clone(), task);
                RemoteReply::Done
            }
            RemoteOp::Update { id, patch } => {
                if let Some(title) = &patch.title
                    && let Err(e) = validate_title(title)
                {
                    return RemoteReply::Rejected(e.to_string());
                }
                match self.tasks.get_mut(id) {
                    Some(task) => {
                        task.apply_patch(patch, now);
                        RemoteReply::Done
                    }
                    None => RemoteReply::NotFound(id.clone()),
                }
            }
            RemoteOp::Delete { id } => {
                self.tasks.remove(id);
                RemoteReply::Done
            }
            RemoteOp::List => RemoteReply::Tasks(self.list()),
        }
    }

    /// Returns every document, most recently created first.
    #[must_use]
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Looks up a single document.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// `true` if the account holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
