//! Wire protocol between the `TaskSync` client and the remote task service.
//!
//! Frames are postcard-encoded and carried in WebSocket binary messages.
//! A session starts with [`ClientFrame::Authenticate`]; the server answers
//! [`ServerFrame::Authenticated`] and from then on every
//! [`ClientFrame::Request`] gets exactly one [`ServerFrame::Response`] with
//! the same `request_id`. Responses may arrive out of request order.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::task::{Task, TaskFields, TaskId, TaskPatch};

/// Maximum accepted frame size in bytes (256 KB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Opens an authenticated session for `user_id`.
    ///
    /// Must be the first frame after the WebSocket handshake.
    Authenticate {
        /// Account to act as.
        user_id: String,
        /// Shared secret, if the server requires one.
        token: Option<String>,
    },
    /// A task operation to run in the authenticated account.
    Request {
        /// Correlation id echoed in the response.
        request_id: u64,
        /// The operation.
        op: RemoteOp,
    },
}

/// Task operations understood by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Set the whole document for `id` (create or overwrite).
    CreateWithId {
        /// Client-assigned task id.
        id: TaskId,
        /// Field set to store.
        fields: TaskFields,
    },
    /// Merge the supplied fields into an existing document.
    Update {
        /// Target task.
        id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Remove the document; succeeds if it does not exist.
    Delete {
        /// Target task.
        id: TaskId,
    },
    /// List every document in the account, newest first.
    List,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// The session is authenticated.
    Authenticated {
        /// Account the session acts as (echoed back).
        user_id: String,
    },
    /// Result of a [`ClientFrame::Request`].
    Response {
        /// Correlation id from the request.
        request_id: u64,
        /// Outcome.
        reply: RemoteReply,
    },
    /// Session-level error (bad frame, rejected authentication).
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Outcome of a single remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteReply {
    /// The write was applied.
    Done,
    /// Result of [`RemoteOp::List`].
    Tasks(Vec<Task>),
    /// The target document does not exist.
    NotFound(TaskId),
    /// The service refused the operation (validation, permission).
    Rejected(String),
}

/// Encodes a [`ClientFrame`].
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if encoding fails.
pub fn encode_client(frame: &ClientFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a [`ClientFrame`].
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid frame.
pub fn decode_client(bytes: &[u8]) -> Result<ClientFrame, CodecError> {
    codec::decode(bytes)
}

/// Encodes a [`ServerFrame`].
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if encoding fails.
pub fn encode_server(frame: &ServerFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a [`ServerFrame`].
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid frame.
pub fn decode_server(bytes: &[u8]) -> Result<ServerFrame, CodecError> {
    codec::decode(bytes)
}
