//! Pending change records: recorded intent to replay a task mutation against
//! the remote service once it becomes reachable.
//!
//! Each [`PendingChange`] carries a tagged [`PendingOp`] whose payload is
//! statically typed per operation kind. For storage the op is split into a
//! textual [`OpKind`] tag plus an optional postcard payload, and reassembled
//! with [`PendingOp::from_parts`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::task::{TaskFields, TaskId, TaskPatch, Timestamp};

/// Unique identifier for a pending change (UUID v7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Creates a new time-ordered change identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ChangeId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChangeId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CodecError::Malformed(format!("change id {s:?}: {e}")))
    }
}

/// Operation kind tag, stored alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Remote create-with-id.
    Add,
    /// Remote partial update.
    Update,
    /// Remote delete by id.
    Delete,
}

impl OpKind {
    /// Stable lowercase tag used in the storage layer.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(CodecError::Malformed(format!("unknown op kind {other:?}"))),
        }
    }
}

/// A queued remote operation with its typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOp {
    /// Create the task remotely with the given id.
    ///
    /// `fields` is `None` only for records written without a payload; the
    /// replay then falls back to the current local snapshot of the task.
    Add {
        /// Field set to create the remote task with.
        fields: Option<TaskFields>,
    },
    /// Apply exactly these fields remotely.
    Update(TaskPatch),
    /// Delete the remote task.
    Delete,
}

impl PendingOp {
    /// Add carrying a concrete field set.
    #[must_use]
    pub const fn add(fields: TaskFields) -> Self {
        Self::Add {
            fields: Some(fields),
        }
    }

    /// Returns the operation kind tag.
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Add { .. } => OpKind::Add,
            Self::Update(_) => OpKind::Update,
            Self::Delete => OpKind::Delete,
        }
    }

    /// Encodes the payload half of this op, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if encoding fails.
    pub fn encode_payload(&self) -> Result<Option<Vec<u8>>, CodecError> {
        match self {
            Self::Add { fields: Some(fields) } => codec::encode(fields).map(Some),
            Self::Add { fields: None } | Self::Delete => Ok(None),
            Self::Update(patch) => codec::encode(patch).map(Some),
        }
    }

    /// Reassembles an op from its stored tag and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if an `Update` has no payload, or
    /// [`CodecError::Serialization`] if the payload does not decode.
    pub fn from_parts(kind: OpKind, payload: Option<&[u8]>) -> Result<Self, CodecError> {
        match (kind, payload) {
            (OpKind::Add, None) => Ok(Self::Add { fields: None }),
            (OpKind::Add, Some(bytes)) => Ok(Self::add(codec::decode(bytes)?)),
            (OpKind::Update, Some(bytes)) => Ok(Self::Update(codec::decode(bytes)?)),
            (OpKind::Update, None) => Err(CodecError::Malformed(
                "update change without payload".to_string(),
            )),
            // A delete never needs a payload; anything stored is ignored.
            (OpKind::Delete, _) => Ok(Self::Delete),
        }
    }
}

/// A recorded intent to replay a mutation against the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Unique change id.
    pub id: ChangeId,
    /// Task the change applies to.
    pub task_id: TaskId,
    /// Operation and payload.
    pub op: PendingOp,
    /// Enqueue time; queue order is ascending by this value.
    pub timestamp: Timestamp,
    /// Number of failed replay attempts so far.
    pub attempts: u32,
    /// Error message of the most recent failed replay.
    pub last_error: Option<String>,
}

impl PendingChange {
    /// Creates a fresh change with no recorded attempts.
    #[must_use]
    pub fn new(task_id: TaskId, op: PendingOp, timestamp: Timestamp) -> Self {
        Self {
            id: ChangeId::new(),
            task_id,
            op,
            timestamp,
            attempts: 0,
            last_error: None,
        }
    }
}
