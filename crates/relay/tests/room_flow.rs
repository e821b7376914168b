//! End-to-end relay flows over real WebSocket connections

use deskbridge_core::protocol::{Envelope, PeerRole};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use deskbridge_relay::{RelayConfig, RelayHandle, RelayServer};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct TestClient {
    writer: WsWriter,
    reader: WsReader,
    client_id: String,
    token: String,
}

impl TestClient {
    async fn connect(url: &str) -> Self {
        let (stream, _) = connect_async(url).await.expect("connect to relay");
        let (writer, mut reader) = stream.split();

        let welcome = recv_from(&mut reader).await;
        let (client_id, token) = match welcome {
            Envelope::Welcome { client_id, token } => (client_id, token),
            other => panic!("expected welcome, got {:?}", other),
        };

        Self {
            writer,
            reader,
            client_id,
            token,
        }
    }

    async fn send(&mut self, envelope: Envelope) {
        self.writer
            .send(WsMessage::Text(envelope.to_json().unwrap()))
            .await
            .expect("send envelope");
    }

    async fn recv(&mut self) -> Envelope {
        recv_from(&mut self.reader).await
    }

    /// Announce a role and adopt the reissued token
    async fn announce(&mut self, role: PeerRole) {
        self.send(Envelope::Announce {
            display_token: Some("test".to_string()),
            role,
        })
        .await;
        match self.recv().await {
            Envelope::Welcome { token, .. } => self.token = token,
            other => panic!("expected reissued welcome, got {:?}", other),
        }
    }
}

async fn recv_from(reader: &mut WsReader) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("connection closed")
            .expect("websocket error");
        match msg {
            WsMessage::Text(text) => return Envelope::from_json(&text).expect("parse envelope"),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn start_relay(config: RelayConfig) -> RelayHandle {
    RelayServer::new(config.with_bind_addr("127.0.0.1:0"))
        .expect("build relay")
        .start()
        .await
        .expect("start relay")
}

#[tokio::test]
async fn test_create_join_relay_and_leave() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut host = TestClient::connect(&relay.url()).await;
    host.announce(PeerRole::Host).await;

    host.send(Envelope::CreateRoom {
        room_id: Some("room-1".to_string()),
        token: host.token.clone(),
    })
    .await;
    assert_eq!(
        host.recv().await,
        Envelope::RoomCreated {
            room_id: "room-1".to_string()
        }
    );

    let mut viewer = TestClient::connect(&relay.url()).await;
    viewer
        .send(Envelope::JoinRoom {
            room_id: "room-1".to_string(),
            token: viewer.token.clone(),
            hmac: None,
        })
        .await;

    match viewer.recv().await {
        Envelope::RoomJoined { room_id, peers, .. } => {
            assert_eq!(room_id, "room-1");
            assert_eq!(peers, vec![host.client_id.clone()]);
        }
        other => panic!("expected room-joined, got {:?}", other),
    }
    assert_eq!(
        host.recv().await,
        Envelope::PeerJoined {
            peer_id: viewer.client_id.clone()
        }
    );

    // offer/answer relay within the room, verbatim
    let offer = Envelope::Offer {
        from: host.client_id.clone(),
        to: viewer.client_id.clone(),
        sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1".to_string(),
    };
    host.send(offer.clone()).await;
    assert_eq!(viewer.recv().await, offer);

    let answer = Envelope::Answer {
        from: viewer.client_id.clone(),
        to: host.client_id.clone(),
        sdp: "v=0".to_string(),
    };
    viewer.send(answer.clone()).await;
    assert_eq!(host.recv().await, answer);

    // graceful leave broadcasts peer-left
    viewer
        .send(Envelope::LeaveRoom {
            room_id: "room-1".to_string(),
        })
        .await;
    assert_eq!(
        viewer.recv().await,
        Envelope::RoomLeft {
            room_id: "room-1".to_string()
        }
    );
    assert_eq!(
        host.recv().await,
        Envelope::PeerLeft {
            peer_id: viewer.client_id.clone()
        }
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn test_abrupt_disconnect_broadcasts_peer_disconnected() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut host = TestClient::connect(&relay.url()).await;
    host.announce(PeerRole::Host).await;
    host.send(Envelope::CreateRoom {
        room_id: Some("room-1".to_string()),
        token: host.token.clone(),
    })
    .await;
    host.recv().await;

    let mut viewer = TestClient::connect(&relay.url()).await;
    let viewer_id = viewer.client_id.clone();
    viewer
        .send(Envelope::JoinRoom {
            room_id: "room-1".to_string(),
            token: viewer.token.clone(),
            hmac: None,
        })
        .await;
    viewer.recv().await;
    host.recv().await; // peer-joined

    // no leave-room: the socket just goes away
    drop(viewer);

    assert_eq!(
        host.recv().await,
        Envelope::PeerDisconnected { peer_id: viewer_id }
    );

    // host is the only member left
    let members = relay
        .state()
        .registry
        .room_members("room-1")
        .await
        .expect("room still live");
    assert_eq!(members, vec![host.client_id.clone()]);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_silent_client_is_swept_within_heartbeat_timeout() {
    let relay = start_relay(
        RelayConfig::default().with_heartbeat_timeout(Duration::from_millis(400)),
    )
    .await;

    let mut host = TestClient::connect(&relay.url()).await;
    host.announce(PeerRole::Host).await;
    host.send(Envelope::CreateRoom {
        room_id: Some("room-1".to_string()),
        token: host.token.clone(),
    })
    .await;
    host.recv().await;

    let mut viewer = TestClient::connect(&relay.url()).await;
    let viewer_id = viewer.client_id.clone();
    viewer
        .send(Envelope::JoinRoom {
            room_id: "room-1".to_string(),
            token: viewer.token.clone(),
            hmac: None,
        })
        .await;
    viewer.recv().await;
    host.recv().await; // peer-joined

    // the viewer goes silent; the host keeps heartbeating until the sweeper
    // reports the loss
    let notice = loop {
        host.send(Envelope::Ping).await;
        match host.recv().await {
            Envelope::Pong => tokio::time::sleep(Duration::from_millis(50)).await,
            other => break other,
        }
    };
    assert_eq!(notice, Envelope::PeerDisconnected { peer_id: viewer_id });

    relay.shutdown().await;
}

#[tokio::test]
async fn test_garbage_token_yields_unauthorized() {
    let relay = start_relay(RelayConfig::default()).await;

    let mut client = TestClient::connect(&relay.url()).await;
    client
        .send(Envelope::JoinRoom {
            room_id: "room-1".to_string(),
            token: "not-a-token".to_string(),
            hmac: None,
        })
        .await;

    assert!(matches!(client.recv().await, Envelope::Unauthorized { .. }));
    relay.shutdown().await;
}
