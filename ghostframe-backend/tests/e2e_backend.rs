use std::time::Duration;

use ghostframe_backend::{AppState, BackendOptions, build_router};
use ghostframe_core::{ChatEvent, DirectoryRecord, MessageRecord, Sender, decode_event};
use futures::StreamExt;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[tokio::test]
async fn new_event_connection_receives_presence_snapshot() {
    let (address, _state, shutdown_tx) = start_backend(&["Bob", "Carol"], false).await;

    let mut events = connect_events(&address).await;
    let first = recv_event(&mut events, Duration::from_secs(2)).await;
    let second = recv_event(&mut events, Duration::from_secs(2)).await;

    assert_eq!(
        first,
        Some(ChatEvent::PeerJoined {
            peer_id: "u1".to_owned(),
            peer_name: "Bob".to_owned(),
        })
    );
    assert_eq!(
        second,
        Some(ChatEvent::PeerJoined {
            peer_id: "u2".to_owned(),
            peer_name: "Carol".to_owned(),
        })
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn echo_mode_pushes_sent_message_back_as_event() {
    let (address, _state, shutdown_tx) = start_backend(&["Bob"], true).await;
    let mut events = connect_events(&address).await;
    drain_events(&mut events).await;

    let http = reqwest::Client::new();
    let created: MessageRecord = http
        .post(format!("http://{address}/messages/u1"))
        .json(&serde_json::json!({"text": "ping", "sender": "me"}))
        .send()
        .await
        .expect("post message")
        .error_for_status()
        .expect("message accepted")
        .json()
        .await
        .expect("created message body");
    assert_eq!(created.text, "ping");
    assert_eq!(created.sender, Sender::Me);

    let echoed = recv_event(&mut events, Duration::from_secs(2)).await;
    assert_eq!(
        echoed,
        Some(ChatEvent::Message {
            from: "u1".to_owned(),
            text: "ping".to_owned(),
        })
    );

    let history: Vec<MessageRecord> = http
        .get(format!("http://{address}/messages/u1"))
        .send()
        .await
        .expect("get history")
        .json()
        .await
        .expect("history body");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].sender, Sender::Them);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn directory_is_served_as_mapping() {
    let (address, _state, shutdown_tx) = start_backend(&["Bob"], false).await;

    let directory: DirectoryRecord = reqwest::get(format!("http://{address}/users"))
        .await
        .expect("get users")
        .json()
        .await
        .expect("users body");
    match directory {
        DirectoryRecord::Map(map) => {
            assert_eq!(map.len(), 1);
            assert_eq!(map["u1"].name, "Bob");
        }
        DirectoryRecord::List(_) => panic!("expected mapping form"),
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unknown_history_and_blank_login_are_rejected() {
    let (address, state, shutdown_tx) = start_backend(&[], false).await;
    let http = reqwest::Client::new();

    let missing = http
        .get(format!("http://{address}/messages/nobody"))
        .send()
        .await
        .expect("get history");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let blank = http
        .post(format!("http://{address}/users/login/%20%20"))
        .send()
        .await
        .expect("post login");
    assert_eq!(blank.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(state.user_name().await, None);

    let ok = http
        .post(format!("http://{address}/users/login/Alice"))
        .json(&serde_json::json!({"userName": "Alice"}))
        .send()
        .await
        .expect("post login");
    assert_eq!(ok.status(), reqwest::StatusCode::CREATED);
    assert_eq!(state.user_name().await.as_deref(), Some("Alice"));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn shared_file_can_be_fetched_until_forgotten() {
    let (address, state, shutdown_tx) = start_backend(&["Bob"], false).await;
    let http = reqwest::Client::new();

    let part = reqwest::multipart::Part::bytes(b"hello".to_vec()).file_name("a.txt");
    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("recipientId", "u1");
    let shared: serde_json::Value = http
        .post(format!("http://{address}/shareFile"))
        .multipart(form)
        .send()
        .await
        .expect("share file")
        .error_for_status()
        .expect("share accepted")
        .json()
        .await
        .expect("share body");
    let file_id = shared["id"].as_str().expect("file id").to_owned();
    assert_eq!(shared["name"], "a.txt");

    let bytes = http
        .get(format!("http://{address}/requestFile/{file_id}"))
        .send()
        .await
        .expect("request file")
        .bytes()
        .await
        .expect("file bytes");
    assert_eq!(bytes.as_ref(), b"hello");

    assert!(state.forget_file(&file_id).await);
    let gone = http
        .get(format!("http://{address}/requestFile/{file_id}"))
        .send()
        .await
        .expect("request file");
    assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);

    let _ = shutdown_tx.send(());
}

async fn start_backend(
    peers: &[&str],
    echo: bool,
) -> (String, AppState, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral backend socket");
    let address = listener.local_addr().expect("backend local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let state = AppState::with_options(BackendOptions {
        peers: peers.iter().map(|name| (*name).to_owned()).collect(),
        echo,
    });
    let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (address.to_string(), state, shutdown_tx)
}

async fn connect_events(address: &str) -> WsStream {
    let (ws_stream, _) = connect_async(format!("ws://{address}/ws/chat"))
        .await
        .expect("connect websocket");
    ws_stream
}

async fn drain_events(stream: &mut WsStream) {
    while recv_event(stream, Duration::from_millis(100)).await.is_some() {}
}

async fn recv_event(stream: &mut WsStream, wait: Duration) -> Option<ChatEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let next = timeout(remaining, stream.next()).await.ok()??;
        match next.ok()? {
            Message::Text(text) => return decode_event(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}
