#![allow(dead_code)]

use std::time::Duration;

use ghostframe_backend::{AppState, BackendOptions, build_router};
use ghostframe_core::{BackendEndpoint, ChatEvent};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::timeout,
};

pub struct TestBackend {
    pub endpoint: BackendEndpoint,
    pub state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn start_backend(peers: &[&str], echo: bool) -> TestBackend {
    let state = AppState::with_options(BackendOptions {
        peers: peers.iter().map(|name| (*name).to_owned()).collect(),
        echo,
    });
    serve_router(build_router(state.clone()), state).await
}

pub async fn serve_router(router: axum::Router, state: AppState) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral backend socket");
    let port = listener.local_addr().expect("backend local addr").port();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestBackend {
        endpoint: BackendEndpoint::new(port),
        state,
        shutdown_tx: Some(shutdown_tx),
    }
}

/// Event connections register asynchronously on the server side.
pub async fn wait_for_subscribers(state: &AppState, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.subscriber_count().await < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "backend never saw {expected} event subscriber(s)"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_no_subscribers(state: &AppState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.subscriber_count().await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "backend still holds an event subscriber"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<ChatEvent>, wait: Duration) -> Option<ChatEvent> {
    timeout(wait, rx.recv()).await.ok().flatten()
}

pub async fn drain_events(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = recv_event(rx, Duration::from_millis(150)).await {
        events.push(event);
    }
    events
}
