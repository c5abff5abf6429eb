//! Task server core: per-account documents, WebSocket handler and request
//! dispatch.
//!
//! Each connection authenticates once as an account and from then on every
//! request is applied to that account's [`Documents`]. Responses go back
//! through a per-connection channel drained by a writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tasksync_proto::documents::Documents;
use tasksync_proto::remote::{self, ClientFrame, MAX_FRAME_SIZE, RemoteOp, RemoteReply, ServerFrame};
use tasksync_proto::task::{Task, Timestamp, UserId};
use tokio::sync::{RwLock, mpsc};

/// Shared server state: account documents and live connections.
pub struct ServerState {
    accounts: RwLock<HashMap<UserId, Documents>>,
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_connection: AtomicU64,
    auth_token: Option<String>,
    max_frame_size: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Open server (no token) with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(None, MAX_FRAME_SIZE)
    }

    /// Server requiring `auth_token` (if set) and rejecting frames larger
    /// than `max_frame_size`.
    #[must_use]
    pub fn with_config(auth_token: Option<String>, max_frame_size: usize) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            auth_token,
            max_frame_size,
        }
    }

    /// Applies `op` to `user`'s documents.
    pub async fn apply(&self, user: &UserId, op: &RemoteOp) -> RemoteReply {
        let mut accounts = self.accounts.write().await;
        accounts
            .entry(user.clone())
            .or_default()
            .apply(op, user, Timestamp::now())
    }

    /// Snapshot of `user`'s tasks, newest first.
    pub async fn tasks(&self, user: &UserId) -> Vec<Task> {
        let accounts = self.accounts.read().await;
        accounts.get(user).map(Documents::list).unwrap_or_default()
    }

    /// Number of authenticated connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends a WebSocket Close frame to every connected client.
    ///
    /// Clients see the session drop and reconnect on their next request.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, sender) in conns.iter() {
            tracing::info!(connection = id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }

    fn check_token(&self, presented: Option<&str>) -> bool {
        self.auth_token
            .as_deref()
            .is_none_or(|expected| presented == Some(expected))
    }
}

/// Result of the authentication handshake.
enum Handshake {
    Accepted(UserId),
    Refused(String),
    Closed,
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for an `Authenticate` frame and check the token.
/// 2. Answer `Authenticated` (or `Error` and hang up).
/// 3. Serve requests until either side closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user = match wait_for_authenticate(&mut ws_receiver, &state).await {
        Handshake::Accepted(user) => user,
        Handshake::Refused(reason) => {
            tracing::warn!(reason = %reason, "authentication refused");
            let _ = send_server_msg(&mut ws_sender, &ServerFrame::Error { reason }).await;
            return;
        }
        Handshake::Closed => {
            tracing::warn!("connection closed before authentication");
            return;
        }
    };

    let ack = ServerFrame::Authenticated {
        user_id: user.as_str().to_string(),
    };
    if let Err(e) = send_server_msg(&mut ws_sender, &ack).await {
        tracing::error!(user_id = %user, error = %e, "failed to send Authenticated ack");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.next_connection.fetch_add(1, Ordering::Relaxed);
    state.connections.write().await.insert(connection, tx.clone());
    tracing::info!(user_id = %user, connection, "client authenticated");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    if let Some(reply) = handle_binary_message(&reader_user, &data, &reader_state).await {
                        send_frame(&tx, &reply);
                    }
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.connections.write().await.remove(&connection);
    tracing::info!(user_id = %user, connection, "client disconnected");
}

/// Waits for the first binary frame, expecting `Authenticate`.
async fn wait_for_authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &ServerState,
) -> Handshake {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match remote::decode_client(&data) {
                    Ok(ClientFrame::Authenticate { user_id, token }) => {
                        if user_id.is_empty() {
                            Handshake::Refused("empty user id".to_string())
                        } else if !state.check_token(token.as_deref()) {
                            Handshake::Refused("invalid token".to_string())
                        } else {
                            Handshake::Accepted(UserId::new(user_id))
                        }
                    }
                    Ok(other) => {
                        tracing::warn!(frame = ?other, "expected Authenticate");
                        Handshake::Refused("authenticate first".to_string())
                    }
                    Err(e) => Handshake::Refused(format!("malformed frame: {e}")),
                };
            }
            Message::Close(_) => return Handshake::Closed,
            _ => {}
        }
    }
    Handshake::Closed
}

/// Handles a binary frame from an authenticated client, returning the frame
/// to send back (if any).
async fn handle_binary_message(
    user: &UserId,
    data: &[u8],
    state: &ServerState,
) -> Option<ServerFrame> {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            user_id = %user,
            size = data.len(),
            max = state.max_frame_size,
            "frame exceeds size limit"
        );
        return Some(ServerFrame::Error {
            reason: format!(
                "frame too large: {} bytes (max {})",
                data.len(),
                state.max_frame_size
            ),
        });
    }

    match remote::decode_client(data) {
        Ok(ClientFrame::Request { request_id, op }) => {
            let reply = state.apply(user, &op).await;
            tracing::debug!(user_id = %user, request_id, ?reply, "request served");
            Some(ServerFrame::Response { request_id, reply })
        }
        Ok(ClientFrame::Authenticate { .. }) => {
            tracing::warn!(user_id = %user, "duplicate Authenticate ignored");
            None
        }
        Err(e) => {
            tracing::warn!(user_id = %user, error = %e, "failed to decode frame");
            Some(ServerFrame::Error {
                reason: format!("malformed frame: {e}"),
            })
        }
    }
}

/// Queues a frame on a connection's writer channel.
fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match remote::encode_server(frame) {
        Ok(bytes) => {
            let _ = tx.send(Message::Binary(bytes.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode server frame"),
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_server_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let bytes = remote::encode_server(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts an open server on `addr` and returns the bound address and a join
/// handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the server with a pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "task server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
