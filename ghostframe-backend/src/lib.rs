use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use ghostframe_core::{
    ChatEvent, EVENT_PATH, FileId, LoginRequest, MAX_EVENT_FRAME_BYTES, MessageRecord,
    OutgoingMessage, PeerId, PeerRecord, Sender, SessionRecord, SharedFileRecord, encode_event,
};
use sha2::{Digest, Sha256};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

pub const MAX_SHARED_FILE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Display names seeded into the directory as `u1`, `u2`, ...
    pub peers: Vec<String>,
    /// Echo every message posted to a peer back as a `message` event from it.
    pub echo: bool,
}

#[derive(Debug, Clone)]
struct StoredFile {
    name: String,
    bytes: Bytes,
}

#[derive(Debug, Default)]
struct BackendState {
    user_name: Option<String>,
    peers: BTreeMap<PeerId, PeerRecord>,
    conversations: HashMap<PeerId, Vec<MessageRecord>>,
    files: HashMap<FileId, StoredFile>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Message>>,
    next_peer_index: u64,
    next_message_id: u64,
    next_file_index: u64,
    next_subscriber_id: u64,
    echo: bool,
}

impl BackendState {
    fn insert_peer(&mut self, name: &str) -> PeerId {
        self.next_peer_index += 1;
        let id = format!("u{}", self.next_peer_index);
        self.peers.insert(
            id.clone(),
            PeerRecord {
                id: None,
                name: name.to_owned(),
                avatar: None,
            },
        );
        self.conversations.entry(id.clone()).or_default();
        id
    }

    fn mint_message_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("m{}", self.next_message_id)
    }

    fn recipients(&self) -> Vec<mpsc::UnboundedSender<Message>> {
        self.subscribers.values().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<BackendState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(BackendOptions::default())
    }

    #[must_use]
    pub fn with_options(options: BackendOptions) -> Self {
        let mut state = BackendState {
            echo: options.echo,
            ..BackendState::default()
        };
        for name in &options.peers {
            state.insert_peer(name);
        }
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Registers a peer and announces it to every open event connection.
    pub async fn add_peer(&self, name: &str) -> PeerId {
        let (peer_id, recipients) = {
            let mut state = self.inner.write().await;
            let peer_id = state.insert_peer(name);
            (peer_id, state.recipients())
        };
        broadcast_event(
            recipients,
            &ChatEvent::PeerJoined {
                peer_id: peer_id.clone(),
                peer_name: name.to_owned(),
            },
        );
        peer_id
    }

    /// Records an incoming message from `from` and pushes it to subscribers.
    pub async fn deliver_message(&self, from: &str, text: &str) {
        let recipients = {
            let mut state = self.inner.write().await;
            let id = state.mint_message_id();
            state
                .conversations
                .entry(from.to_owned())
                .or_default()
                .push(MessageRecord {
                    id,
                    text: text.to_owned(),
                    sender: Sender::Them,
                });
            state.recipients()
        };
        broadcast_event(
            recipients,
            &ChatEvent::Message {
                from: from.to_owned(),
                text: text.to_owned(),
            },
        );
    }

    pub async fn push_event(&self, event: &ChatEvent) {
        let recipients = self.inner.read().await.recipients();
        broadcast_event(recipients, event);
    }

    /// Sends an arbitrary text frame, valid JSON or not.
    pub async fn push_raw_frame(&self, frame: &str) {
        let recipients = self.inner.read().await.recipients();
        for tx in recipients {
            let _ = tx.send(Message::Text(frame.to_owned().into()));
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }

    pub async fn user_name(&self) -> Option<String> {
        self.inner.read().await.user_name.clone()
    }

    pub async fn forget_file(&self, file_id: &str) -> bool {
        self.inner.write().await.files.remove(file_id).is_some()
    }

    /// Closes every event connection, as a dying backend would.
    pub async fn disconnect_all(&self) {
        let subscribers = std::mem::take(&mut self.inner.write().await.subscribers);
        for tx in subscribers.into_values() {
            let _ = tx.send(Message::Close(None));
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/users", get(users_handler))
        .route("/users/login/{user_name}", post(login_handler))
        .route("/users/logout", post(logout_handler))
        .route(
            "/messages/{user_id}",
            get(history_handler).post(send_handler),
        )
        .route(
            "/shareFile",
            post(share_file_handler).layer(DefaultBodyLimit::max(MAX_SHARED_FILE_BYTES + 64 * 1024)),
        )
        .route("/requestFile/{file_id}", get(request_file_handler))
        .route(EVENT_PATH, get(ws_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "backend listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn users_handler(State(state): State<AppState>) -> impl IntoResponse {
    let peers = state.inner.read().await.peers.clone();
    Json(peers)
}

async fn login_handler(
    State(state): State<AppState>,
    Path(user_name): Path<String>,
    body: Bytes,
) -> Response {
    // The path segment wins; the body is optional and only logged.
    let body_name = serde_json::from_slice::<LoginRequest>(&body)
        .ok()
        .map(|request| request.user_name);
    if user_name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user name cannot be empty");
    }
    if let Some(body_name) = body_name.filter(|name| name != &user_name) {
        debug!(path = %user_name, body = %body_name, "login body disagrees with path");
    }

    state.inner.write().await.user_name = Some(user_name.clone());
    info!(user = %user_name, "logged in");
    (
        StatusCode::CREATED,
        Json(SessionRecord {
            user_name: user_name.clone(),
        }),
    )
        .into_response()
}

async fn logout_handler(State(state): State<AppState>) -> impl IntoResponse {
    let previous = state.inner.write().await.user_name.take();
    info!(user = ?previous, "logged out");
    StatusCode::NO_CONTENT
}

async fn history_handler(
    State(state): State<AppState>,
    Path(user_id): Path<PeerId>,
) -> Response {
    let backend = state.inner.read().await;
    if !backend.peers.contains_key(&user_id) {
        return error_response(StatusCode::NOT_FOUND, format!("unknown user {user_id}"));
    }
    let history = backend
        .conversations
        .get(&user_id)
        .cloned()
        .unwrap_or_default();
    Json(history).into_response()
}

async fn send_handler(
    State(state): State<AppState>,
    Path(user_id): Path<PeerId>,
    Json(outgoing): Json<OutgoingMessage>,
) -> Response {
    if outgoing.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message text cannot be empty");
    }

    let (created, echo) = {
        let mut backend = state.inner.write().await;
        if !backend.peers.contains_key(&user_id) {
            return error_response(StatusCode::NOT_FOUND, format!("unknown user {user_id}"));
        }
        let created = MessageRecord {
            id: backend.mint_message_id(),
            text: outgoing.text.clone(),
            sender: outgoing.sender,
        };
        backend
            .conversations
            .entry(user_id.clone())
            .or_default()
            .push(created.clone());
        (created, backend.echo)
    };

    if echo {
        state.deliver_message(&user_id, &outgoing.text).await;
    }

    (StatusCode::CREATED, Json(created)).into_response()
}

async fn share_file_handler(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut file: Option<(String, Bytes)> = None;
    let mut recipient: Option<PeerId> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, format!("multipart error: {err}"));
            }
        };

        match field.name().unwrap_or("") {
            "file" => {
                let name = field.file_name().unwrap_or("file.bin").to_owned();
                match field.bytes().await {
                    Ok(bytes) => file = Some((name, bytes)),
                    Err(err) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read file field: {err}"),
                        );
                    }
                }
            }
            "recipientId" => match field.text().await {
                Ok(text) => recipient = Some(text),
                Err(err) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        format!("failed to read recipientId: {err}"),
                    );
                }
            },
            other => debug!(field = other, "ignoring unexpected multipart field"),
        }
    }

    let Some((name, bytes)) = file else {
        return error_response(StatusCode::BAD_REQUEST, "missing 'file' field");
    };
    let Some(recipient) = recipient.filter(|r| !r.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing 'recipientId' field");
    };
    if bytes.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "file is empty");
    }

    let mut backend = state.inner.write().await;
    backend.next_file_index += 1;
    let digest = Sha256::digest(
        format!("{}:{}:{}:{}", backend.next_file_index, recipient, name, bytes.len()).as_bytes(),
    );
    let id = hex::encode(&digest[..8]);
    let sender = backend.user_name.clone();
    info!(file_id = %id, size = bytes.len(), recipient = %recipient, "file shared");
    backend.files.insert(
        id.clone(),
        StoredFile {
            name: name.clone(),
            bytes,
        },
    );

    (
        StatusCode::CREATED,
        Json(SharedFileRecord { id, name, sender }),
    )
        .into_response()
}

async fn request_file_handler(
    State(state): State<AppState>,
    Path(file_id): Path<FileId>,
) -> Response {
    let stored = state.inner.read().await.files.get(&file_id).cloned();
    match stored {
        Some(file) => {
            debug!(file_id = %file_id, name = %file.name, "serving file");
            (
                [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
                file.bytes,
            )
                .into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("file {file_id} not found")),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_EVENT_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: axum::extract::ws::WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(Message::Close(frame)) => {
                            let _ = ws_sender.send(Message::Close(frame)).await;
                            break;
                        }
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let subscriber_id = {
        let mut backend = state.inner.write().await;
        backend.next_subscriber_id += 1;
        let id = backend.next_subscriber_id;
        backend.subscribers.insert(id, outbound_tx.clone());

        // Presence snapshot for the new connection.
        for (peer_id, peer) in &backend.peers {
            send_event(
                &outbound_tx,
                &ChatEvent::PeerJoined {
                    peer_id: peer_id.clone(),
                    peer_name: peer.name.clone(),
                },
            );
        }
        id
    };
    drop(outbound_tx);

    info!(subscriber_id, "event subscriber connected");

    while let Some(next_message) = ws_receiver.next().await {
        match next_message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        }
    }

    state.inner.write().await.subscribers.remove(&subscriber_id);
    send_task.abort();
    info!(subscriber_id, "event subscriber disconnected");
}

fn send_event(tx: &mpsc::UnboundedSender<Message>, event: &ChatEvent) {
    match encode_event(event) {
        Ok(frame) => {
            let _ = tx.send(Message::Text(frame.into()));
        }
        Err(err) => error!("failed to serialize event: {}", err),
    }
}

fn broadcast_event(recipients: Vec<mpsc::UnboundedSender<Message>>, event: &ChatEvent) {
    let frame = match encode_event(event) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize event: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Text(frame.clone().into()));
    }
}
