//! Task record types for `TaskSync`.
//!
//! A [`Task`] is the unit the client owns locally and mirrors to the remote
//! task service. Writes travel as either a full [`TaskFields`] set (create)
//! or a partial [`TaskPatch`] (update). Patch values are always absolute, so
//! replaying the same patch twice leaves the record unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed task title length in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 256;

/// Client-assigned task identifier.
///
/// Freshly created ids are UUID v7 strings so that offline-created tasks
/// sort roughly by creation time, but any non-empty string is accepted
/// (ids created by other clients are opaque).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a new time-ordered task identifier (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the account that owns a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps an account identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for the placeholder owner of tasks created before sign-in.
    #[must_use]
    pub fn is_unclaimed(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock instant in milliseconds since the UNIX epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Reasons a task field set is rejected before it is written anywhere.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Task title cannot be empty.
    #[error("task title cannot be empty")]
    TitleEmpty,
    /// Task title exceeds [`MAX_TASK_TITLE_LENGTH`].
    #[error("task title too long (max {MAX_TASK_TITLE_LENGTH} characters)")]
    TitleTooLong,
}

/// Checks a title against the length rules shared by client and server.
///
/// Length is counted in characters, not bytes.
///
/// # Errors
///
/// Returns [`ValidationError::TitleEmpty`] or [`ValidationError::TitleTooLong`].
pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.is_empty() {
        return Err(ValidationError::TitleEmpty);
    }
    if title.chars().count() > MAX_TASK_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong);
    }
    Ok(())
}

/// A task record.
///
/// Invariant: `created_at <= updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Primary key, assigned by the client that created the task.
    pub id: TaskId,
    /// Short title shown in lists.
    pub title: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Whether the task has been completed.
    pub is_completed: bool,
    /// Optional due date.
    pub due_date: Option<Timestamp>,
    /// When the task was created.
    pub created_at: Timestamp,
    /// When the task was last modified.
    pub updated_at: Timestamp,
    /// Owning account; empty while the task was created signed-out.
    pub user_id: UserId,
}

impl Task {
    /// Builds a new task from a field set, stamping both timestamps with `now`.
    #[must_use]
    pub fn from_fields(id: TaskId, fields: TaskFields, user_id: UserId, now: Timestamp) -> Self {
        Self {
            id,
            title: fields.title,
            description: fields.description,
            is_completed: fields.is_completed,
            due_date: fields.due_date,
            created_at: now,
            updated_at: now,
            user_id,
        }
    }

    /// Returns the client-writable fields of this task.
    #[must_use]
    pub fn fields(&self) -> TaskFields {
        TaskFields {
            title: self.title.clone(),
            description: self.description.clone(),
            is_completed: self.is_completed,
            due_date: self.due_date,
        }
    }

    /// Applies the supplied fields of `patch` and refreshes `updated_at`.
    ///
    /// `updated_at` never moves before `created_at`, even if `now` does.
    pub fn apply_patch(&mut self, patch: &TaskPatch, now: Timestamp) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(is_completed) = patch.is_completed {
            self.is_completed = is_completed;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        self.updated_at = now.max(self.created_at);
    }
}

/// The full set of client-writable task fields, used to create a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFields {
    /// Task title.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Completion flag.
    pub is_completed: bool,
    /// Optional due date.
    pub due_date: Option<Timestamp>,
}

impl TaskFields {
    /// Field set with only a title, everything else at its default.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// A partial update. `None` leaves a field untouched.
///
/// The nullable fields use a nested `Option`: `Some(None)` clears the value,
/// `None` leaves it as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New description, or `Some(None)` to clear it.
    pub description: Option<Option<String>>,
    /// New completion flag.
    pub is_completed: Option<bool>,
    /// New due date, or `Some(None)` to clear it.
    pub due_date: Option<Option<Timestamp>>,
}

impl TaskPatch {
    /// Patch that only sets the completion flag.
    #[must_use]
    pub fn completed(is_completed: bool) -> Self {
        Self {
            is_completed: Some(is_completed),
            ..Self::default()
        }
    }

    /// Patch that only sets the title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// `true` if no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.is_completed.is_none()
            && self.due_date.is_none()
    }
}
