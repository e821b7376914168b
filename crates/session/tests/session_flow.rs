//! End-to-end session flows: relay rendezvous, WebRTC establishment over
//! loopback, and control traffic on the secure channel

use deskbridge_core::control::ControlMessage;
use deskbridge_core::protocol::PeerRole;
use deskbridge_relay::{RelayConfig, RelayHandle, RelayServer};
use deskbridge_session::channel::input::mouse_move;
use deskbridge_session::{
    Error, EventReceiver, MemorySink, NegotiationState, Session, SessionConfig, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;

const ESTABLISH_DEADLINE: Duration = Duration::from_secs(30);

async fn start_relay() -> RelayHandle {
    RelayServer::new(RelayConfig::default().with_bind_addr("127.0.0.1:0"))
        .expect("build relay")
        .start()
        .await
        .expect("start relay")
}

fn session_config(url: &str, role: PeerRole) -> SessionConfig {
    let mut config = SessionConfig::default().with_role(role);
    config.relay_url = url.to_string();
    config
}

async fn wait_for<F>(events: &mut EventReceiver, deadline: Duration, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(deadline, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_connected(events: &mut EventReceiver) {
    wait_for(events, ESTABLISH_DEADLINE, |event| {
        matches!(
            event,
            SessionEvent::ConnectionState {
                state: NegotiationState::Connected,
                ..
            }
        )
    })
    .await;
}

/// Retry a control-channel send until the channel opens
async fn send_input_when_open(session: &Session, peer_id: &str, message: ControlMessage) {
    let deadline = tokio::time::Instant::now() + ESTABLISH_DEADLINE;
    loop {
        match session.send_input(peer_id, message.clone()).await {
            Ok(()) => return,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("control channel never opened: {}", e),
        }
    }
}

#[tokio::test]
async fn test_host_and_viewer_establish_and_exchange_control_traffic() {
    let relay = start_relay().await;

    // host registers and opens the room
    let (host, mut host_events) = Session::new(
        session_config(&relay.url(), PeerRole::Host),
        Arc::new(MemorySink::new()),
    )
    .unwrap();
    host.connect().await.unwrap();
    let room = host.create_room(Some("e2e-room".to_string())).await.unwrap();
    assert_eq!(room, "e2e-room");
    let host_id = host.client_id().await.unwrap();

    // viewer joins; the host learns about it and offers
    let viewer_sink = Arc::new(MemorySink::new());
    let (viewer, mut viewer_events) = Session::new(
        session_config(&relay.url(), PeerRole::Viewer),
        Arc::clone(&viewer_sink) as Arc<dyn deskbridge_session::StorageSink>,
    )
    .unwrap();
    viewer.connect().await.unwrap();
    let peers = viewer.join_room("e2e-room").await.unwrap();
    assert_eq!(peers, vec![host_id.clone()]);
    let viewer_id = viewer.client_id().await.unwrap();

    // both sides reach connected within the budget
    wait_connected(&mut host_events).await;
    wait_connected(&mut viewer_events).await;
    assert_eq!(
        host.peer_state(&viewer_id).await,
        Some(NegotiationState::Connected)
    );

    // viewer drives the host's pointer over the control channel
    send_input_when_open(&viewer, &host_id, mouse_move(320, 240, Some(0))).await;
    let event = wait_for(&mut host_events, ESTABLISH_DEADLINE, |event| {
        matches!(event, SessionEvent::Data { .. })
    })
    .await;
    match event {
        SessionEvent::Data { peer_id, message } => {
            assert_eq!(peer_id, viewer_id);
            assert_eq!(message, mouse_move(320, 240, Some(0)));
        }
        other => panic!("expected data event, got {:?}", other),
    }

    // host ships a file; the viewer's sink ends up byte-for-byte identical
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    host.send_file(&viewer_id, "artifact.bin", "application/octet-stream", &payload)
        .await
        .unwrap();
    wait_for(&mut viewer_events, ESTABLISH_DEADLINE, |event| {
        matches!(
            event,
            SessionEvent::Transfer {
                update: deskbridge_session::TransferUpdate::Completed { .. },
                ..
            }
        )
    })
    .await;
    assert_eq!(viewer_sink.get("artifact.bin").await, Some(payload));

    // graceful teardown: the host sees the departure
    viewer.close().await;
    wait_for(&mut host_events, ESTABLISH_DEADLINE, |event| {
        matches!(
            event,
            SessionEvent::ConnectionState {
                state: NegotiationState::Closed,
                ..
            }
        )
    })
    .await;

    host.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_join_missing_room_surfaces_room_error() {
    let relay = start_relay().await;

    let (viewer, _events) = Session::new(
        session_config(&relay.url(), PeerRole::Viewer),
        Arc::new(MemorySink::new()),
    )
    .unwrap();
    viewer.connect().await.unwrap();

    let err = viewer.join_room("no-such-room").await.unwrap_err();
    assert!(matches!(err, Error::Room(_)));

    viewer.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_viewer_cannot_create_room() {
    let relay = start_relay().await;

    let (viewer, _events) = Session::new(
        session_config(&relay.url(), PeerRole::Viewer),
        Arc::new(MemorySink::new()),
    )
    .unwrap();
    viewer.connect().await.unwrap();

    let err = viewer
        .create_room(Some("viewers".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    // the refusal mutated nothing
    let relay_state = relay.state();
    assert_eq!(relay_state.registry.room_members("viewers").await, None);

    viewer.close().await;
    relay.shutdown().await;
}
