mod common;

use std::time::Duration;

use common::{
    drain_events, recv_event, start_backend, wait_for_no_subscribers, wait_for_subscribers,
};
use ghostframe_client::{ChannelError, ChannelState, EventChannel};
use ghostframe_core::{BackendEndpoint, ChatEvent};
use tokio::{net::TcpListener, time::timeout};

fn message(from: &str, text: &str) -> ChatEvent {
    ChatEvent::Message {
        from: from.to_owned(),
        text: text.to_owned(),
    }
}

#[tokio::test]
async fn presence_sent_before_subscribe_is_not_lost() {
    let backend = start_backend(&["Bob"], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut rx = channel.subscribe_queue();
    assert_eq!(
        recv_event(&mut rx, Duration::from_secs(2)).await,
        Some(ChatEvent::PeerJoined {
            peer_id: "u1".to_owned(),
            peer_name: "Bob".to_owned(),
        })
    );
}

#[tokio::test]
async fn every_subscriber_sees_every_event_in_order() {
    let backend = start_backend(&[], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    let mut first = channel.subscribe_queue();
    let mut second = channel.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;

    backend.state.push_event(&message("u1", "one")).await;
    backend.state.push_event(&message("u2", "two")).await;

    let expected = vec![message("u1", "one"), message("u2", "two")];
    assert_eq!(drain_events(&mut first).await, expected);
    assert_eq!(drain_events(&mut second).await, expected);
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_reading_continues() {
    let backend = start_backend(&[], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    let mut rx = channel.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;

    backend.state.push_raw_frame("{not json").await;
    backend.state.push_raw_frame(r#"{"type":"message","from":"u1"}"#).await;
    backend.state.push_event(&message("u1", "still here")).await;

    assert_eq!(drain_events(&mut rx).await, vec![message("u1", "still here")]);
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test]
async fn unknown_event_types_reach_subscribers_as_unknown() {
    let backend = start_backend(&[], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    let mut rx = channel.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;

    backend
        .state
        .push_raw_frame(r#"{"type":"typing","from":"u1"}"#)
        .await;

    assert_eq!(
        recv_event(&mut rx, Duration::from_secs(2)).await,
        Some(ChatEvent::Unknown)
    );
}

#[tokio::test]
async fn close_is_idempotent_and_stops_dispatch() {
    let backend = start_backend(&[], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    let mut rx = channel.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;

    channel.close();
    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    timeout(Duration::from_secs(1), channel.closed())
        .await
        .expect("closed resolves after close");

    backend.state.push_event(&message("u1", "too late")).await;
    assert_eq!(drain_events(&mut rx).await, Vec::new());
}

#[tokio::test]
async fn remote_close_is_observable() {
    let backend = start_backend(&[], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    let _rx = channel.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;
    assert!(channel.is_open());

    backend.state.disconnect_all().await;

    timeout(Duration::from_secs(2), channel.closed())
        .await
        .expect("channel notices remote close");
    assert_eq!(channel.state(), ChannelState::Closed);
    channel.close();
}

#[tokio::test]
async fn remote_close_is_observable_without_subscribers() {
    let backend = start_backend(&["Bob"], false).await;
    let channel = EventChannel::open(backend.endpoint).await.expect("open channel");
    wait_for_subscribers(&backend.state, 1).await;

    backend.state.disconnect_all().await;
    drop(backend);

    timeout(Duration::from_secs(3), channel.closed())
        .await
        .expect("channel notices remote close before anyone subscribes");
    assert_eq!(channel.state(), ChannelState::Closed);

    let mut rx = channel.subscribe_queue();
    assert_eq!(drain_events(&mut rx).await, Vec::new());
}

#[tokio::test]
async fn queued_events_end_with_their_channel() {
    let backend = start_backend(&[], false).await;
    let first = EventChannel::open(backend.endpoint).await.expect("open channel");
    let mut old_queue = first.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;

    first.close();
    drop(first);
    wait_for_no_subscribers(&backend.state).await;
    backend.state.push_event(&message("u1", "for the old session")).await;
    assert_eq!(
        timeout(Duration::from_secs(1), old_queue.recv())
            .await
            .expect("queue ends after close"),
        None
    );

    let second = EventChannel::open(backend.endpoint).await.expect("reopen channel");
    let mut new_queue = second.subscribe_queue();
    wait_for_subscribers(&backend.state, 1).await;
    backend.state.push_event(&message("u1", "fresh")).await;
    assert_eq!(drain_events(&mut new_queue).await, vec![message("u1", "fresh")]);
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let err = EventChannel::open_with_timeout(BackendEndpoint::new(port), Duration::from_secs(2))
        .await
        .expect_err("nothing listens on a released port");
    assert!(matches!(err, ChannelError::Connect { .. }), "{err}");
}
