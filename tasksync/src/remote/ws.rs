//! WebSocket client for `tasksync-server`.
//!
//! The connection is opened lazily by the first request and reopened by the
//! next request after it drops, so an unreachable server simply surfaces as
//! [`RemoteError::Unreachable`] and the caller queues the change.
//!
//! Requests are correlated by id: each request parks a oneshot sender in a
//! shared map, and a background reader task completes it when the matching
//! [`ServerFrame::Response`] arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tasksync_proto::remote::{self, ClientFrame, RemoteOp, RemoteReply, ServerFrame};
use tasksync_proto::task::{Task, TaskFields, TaskId, TaskPatch, UserId};

use super::{RemoteBackend, RemoteError, write_outcome};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Requests awaiting a response, keyed by request id.
type PendingReplies = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<RemoteReply>>>>;

/// Connection settings for [`WsRemote`].
#[derive(Debug, Clone)]
pub struct WsRemoteConfig {
    /// Server endpoint, e.g. `ws://127.0.0.1:9100/ws`.
    pub url: String,
    /// Account to act as; `None` keeps the client signed out.
    pub user_id: Option<UserId>,
    /// Shared secret presented when authenticating.
    pub token: Option<String>,
    /// Limit for connecting and authenticating.
    pub connect_timeout: Duration,
    /// Limit for a single request/response round trip.
    pub request_timeout: Duration,
}

/// A live, authenticated session.
struct Session {
    sender: WsSender,
    connected: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

/// [`RemoteBackend`] speaking the `tasksync` wire protocol over WebSocket.
pub struct WsRemote {
    config: WsRemoteConfig,
    session: tokio::sync::Mutex<Option<Session>>,
    pending: PendingReplies,
    next_request_id: AtomicU64,
}

impl WsRemote {
    /// Creates a client for `config.url`. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if the URL is not a `ws://` or
    /// `wss://` URL.
    pub fn new(config: WsRemoteConfig) -> Result<Self, RemoteError> {
        let parsed = url::Url::parse(&config.url)
            .map_err(|e| RemoteError::Protocol(format!("invalid remote url {:?}: {e}", config.url)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RemoteError::Protocol(format!(
                "remote url must use ws:// or wss://, got {:?}",
                config.url
            )));
        }
        Ok(Self {
            config,
            session: tokio::sync::Mutex::new(None),
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// `true` while a session is open.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::Relaxed))
    }

    /// Lists every task in the account, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] if the request fails.
    pub async fn list(&self) -> Result<Vec<Task>, RemoteError> {
        match self.request(RemoteOp::List).await? {
            RemoteReply::Tasks(tasks) => Ok(tasks),
            other => Err(RemoteError::Protocol(format!(
                "unexpected reply to list: {other:?}"
            ))),
        }
    }

    /// Closes the session, if any. The next request reconnects.
    pub async fn disconnect(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            let _ = session.sender.send(Message::Close(None)).await;
            session.reader.abort();
            session.connected.store(false, Ordering::Relaxed);
        }
        self.pending.lock().clear();
    }

    async fn request(&self, op: RemoteOp) -> Result<RemoteReply, RemoteError> {
        let Some(user) = self.current_user_id() else {
            return Err(RemoteError::Unauthenticated);
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let bytes = remote::encode_client(&ClientFrame::Request { request_id, op })
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.session.lock().await;
            let live = guard
                .as_ref()
                .is_some_and(|s| s.connected.load(Ordering::Relaxed));
            if !live {
                if let Some(stale) = guard.take() {
                    stale.reader.abort();
                }
                *guard = Some(self.open_session(&user).await?);
            }
            let Some(session) = guard.as_mut() else {
                return Err(RemoteError::Unreachable("no session".to_string()));
            };

            self.pending.lock().insert(request_id, tx);
            if let Err(e) = session.sender.send(Message::Binary(bytes.into())).await {
                tracing::warn!(error = %e, request_id, "remote send failed");
                session.connected.store(false, Ordering::Relaxed);
                self.pending.lock().remove(&request_id);
                return Err(RemoteError::Unreachable(e.to_string()));
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RemoteError::Unreachable(
                "connection closed before reply".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id, "remote request timed out");
                Err(RemoteError::Timeout)
            }
        }
    }

    /// Connects and authenticates, then starts the reader task.
    async fn open_session(&self, user: &UserId) -> Result<Session, RemoteError> {
        let url = self.config.url.as_str();
        let (stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url))
                .await
                .map_err(|_| {
                    tracing::warn!(url, "remote connect timed out");
                    RemoteError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url, error = %e, "remote connect failed");
                    RemoteError::Unreachable(e.to_string())
                })?;

        let (mut sender, mut reader) = stream.split();

        let hello = remote::encode_client(&ClientFrame::Authenticate {
            user_id: user.as_str().to_string(),
            token: self.config.token.clone(),
        })
        .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        sender
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        let ack = tokio::time::timeout(self.config.connect_timeout, reader.next())
            .await
            .map_err(|_| RemoteError::Timeout)?;
        match ack {
            Some(Ok(Message::Binary(data))) => match remote::decode_server(&data) {
                Ok(ServerFrame::Authenticated { user_id }) => {
                    tracing::info!(user_id = %user_id, url, "authenticated with task server");
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "task server refused authentication");
                    return Err(RemoteError::Rejected(format!(
                        "authentication refused: {reason}"
                    )));
                }
                Ok(other) => {
                    return Err(RemoteError::Protocol(format!(
                        "unexpected frame during authentication: {other:?}"
                    )));
                }
                Err(e) => return Err(RemoteError::Protocol(e.to_string())),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(RemoteError::Unreachable(
                    "server closed the connection during authentication".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(RemoteError::Protocol(
                    "non-binary frame during authentication".to_string(),
                ));
            }
            Some(Err(e)) => return Err(RemoteError::Unreachable(e.to_string())),
        }

        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(reader_loop(
            reader,
            Arc::clone(&self.pending),
            Arc::clone(&connected),
        ));
        Ok(Session {
            sender,
            connected,
            reader,
        })
    }
}

impl RemoteBackend for WsRemote {
    async fn create_with_id(&self, id: &TaskId, fields: &TaskFields) -> Result<(), RemoteError> {
        let reply = self
            .request(RemoteOp::CreateWithId {
                id: id.clone(),
                fields: fields.clone(),
            })
            .await?;
        write_outcome(reply)
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), RemoteError> {
        let reply = self
            .request(RemoteOp::Update {
                id: id.clone(),
                patch: patch.clone(),
            })
            .await?;
        write_outcome(reply)
    }

    async fn delete(&self, id: &TaskId) -> Result<(), RemoteError> {
        let reply = self.request(RemoteOp::Delete { id: id.clone() }).await?;
        write_outcome(reply)
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.config
            .user_id
            .clone()
            .filter(|user| !user.is_unclaimed())
    }
}

impl Drop for WsRemote {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.reader.abort();
        }
    }
}

/// Completes pending requests as responses arrive.
///
/// Malformed frames are logged and skipped. When the socket closes, every
/// outstanding request is failed by dropping its sender.
async fn reader_loop(mut reader: WsReader, pending: PendingReplies, connected: Arc<AtomicBool>) {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => match remote::decode_server(&data) {
                Ok(ServerFrame::Response { request_id, reply }) => {
                    let waiter = pending.lock().remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => tracing::debug!(request_id, "reply for abandoned request"),
                    }
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "task server error");
                }
                Ok(ServerFrame::Authenticated { .. }) => {
                    tracing::debug!("duplicate authentication ack");
                }
                Err(e) => tracing::warn!(error = %e, "malformed server frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("task server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "task server read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::debug!("remote reader task exiting");
}
