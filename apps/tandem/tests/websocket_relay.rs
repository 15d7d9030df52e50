mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use common::{JOIN_GAP, MEETING, connected, eventually};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tandem::media::SyntheticDevices;
use tandem::signaling::WebSocketRelay;
use tandem::transport::LoopbackNetwork;
use tandem::{
    ConnectionKey, CoordinatorDeps, MediaConstraints, SessionConfig, SessionCoordinator,
    SignalingChannel, SignalingMessage,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// Minimal relay: every text frame is repeated to the other sockets of the
/// same meeting.
#[derive(Default)]
struct FanOut {
    next_id: AtomicU64,
    meetings: Mutex<HashMap<String, broadcast::Sender<(u64, String)>>>,
}

impl FanOut {
    fn meeting(&self, meeting: &str) -> broadcast::Sender<(u64, String)> {
        self.meetings
            .lock()
            .entry(meeting.to_owned())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn members(&self, meeting: &str) -> usize {
        self.meetings
            .lock()
            .get(meeting)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

async fn relay_socket(
    ws: WebSocketUpgrade,
    Path(meeting): Path<String>,
    State(fan_out): State<Arc<FanOut>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_member(socket, meeting, fan_out))
}

async fn serve_member(socket: WebSocket, meeting: String, fan_out: Arc<FanOut>) {
    let id = fan_out.next_id.fetch_add(1, Ordering::SeqCst);
    let room = fan_out.meeting(&meeting);
    let mut others = room.subscribe();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Ok((from, text)) = others.recv().await {
            if from == id {
                continue;
            }
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(text) => {
                let _ = room.send((id, text));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    writer.abort();
}

async fn start_relay() -> (SocketAddr, Arc<FanOut>) {
    let fan_out = Arc::new(FanOut::default());
    let router = Router::new()
        .route("/ws/:meeting", get(relay_socket))
        .with_state(fan_out.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, fan_out)
}

fn relay_for(addr: SocketAddr) -> WebSocketRelay {
    WebSocketRelay::new(&format!("http://{addr}")).unwrap()
}

#[test_timeout::tokio_timeout_test(20)]
async fn envelopes_cross_the_websocket_relay() {
    let (addr, fan_out) = start_relay().await;
    let relay = relay_for(addr);
    let timeout = Duration::from_secs(5);

    let a = SignalingChannel::connect(&relay, MEETING, "ka".into(), timeout)
        .await
        .unwrap();
    let b = SignalingChannel::connect(&relay, MEETING, "kb".into(), timeout)
        .await
        .unwrap();
    eventually(|| async { fan_out.members(MEETING) == 2 }).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = b.subscribe(move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    a.announce_join("alice").unwrap();

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.meeting_id, MEETING);
    assert_eq!(envelope.from, ConnectionKey::from("ka"));
    assert_eq!(
        envelope.message,
        SignalingMessage::Join {
            connection_key: "ka".into(),
            participant_id: "alice".into(),
        }
    );

    a.disconnect();
    b.disconnect();
    eventually(|| async { fan_out.members(MEETING) == 0 }).await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn meetings_do_not_leak_into_each_other() {
    let (addr, fan_out) = start_relay().await;
    let relay = relay_for(addr);
    let timeout = Duration::from_secs(5);

    let a = SignalingChannel::connect(&relay, "first", "ka".into(), timeout)
        .await
        .unwrap();
    let b = SignalingChannel::connect(&relay, "second", "kb".into(), timeout)
        .await
        .unwrap();
    let c = SignalingChannel::connect(&relay, "first", "kc".into(), timeout)
        .await
        .unwrap();
    eventually(|| async { fan_out.members("first") == 2 && fan_out.members("second") == 1 }).await;

    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let _b_sub = b.subscribe(move |envelope| {
        let _ = b_tx.send(envelope.clone());
    });
    let (c_tx, mut c_rx) = mpsc::unbounded_channel();
    let _c_sub = c.subscribe(move |envelope| {
        let _ = c_tx.send(envelope.clone());
    });

    a.announce_join("alice").unwrap();
    let got = c_rx.recv().await.unwrap();
    assert_eq!(got.from, ConnectionKey::from("ka"));
    assert!(b_rx.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(20)]
async fn unreachable_websocket_relay_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = SignalingChannel::connect(&relay_for(addr), MEETING, "ka".into(), Duration::from_secs(5))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, tandem::SignalingError::Unreachable(_)));
}

#[test_timeout::tokio_timeout_test(30)]
async fn participants_meet_over_the_websocket_relay() {
    let (addr, _fan_out) = start_relay().await;
    let network = LoopbackNetwork::new();
    let participant = |key: &str| {
        SessionCoordinator::new(
            CoordinatorDeps {
                relay: Arc::new(relay_for(addr)),
                devices: Arc::new(SyntheticDevices::new()),
                transports: Arc::new(network.clone()),
            },
            SessionConfig::default().with_ice_servers(Vec::new()),
        )
        .with_connection_key(key)
    };
    let x = participant("k1");
    let y = participant("k2");

    x.join(MEETING, "alice", MediaConstraints::default())
        .await
        .unwrap();
    tokio::time::sleep(JOIN_GAP).await;
    y.join(MEETING, "bob", MediaConstraints::default())
        .await
        .unwrap();
    connected(&x).await;
    connected(&y).await;
    assert_eq!(network.active_links(), 1);
    assert_eq!(network.offers_created(), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let y_chat = y.chat().await.unwrap();
    let _sub = y_chat.on_message(move |message| {
        let _ = tx.send(message.clone());
    });
    x.chat().await.unwrap().send("over the wire").unwrap();
    let message = rx.recv().await.unwrap();
    assert_eq!(message.text, "over the wire");
    assert_eq!(message.sender_id, "alice");

    x.leave().await;
    y.leave().await;
    assert_eq!(network.open_endpoints(), 0);
}
