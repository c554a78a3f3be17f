use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::DateTime;
use shared::domain::{ChatId, MessageId, MessageKind, UserId};
use shared::protocol::chat_destination;
use tokio::{net::TcpListener, time::timeout};

use crate::auth::MemoryCredentialStore;

#[derive(Clone)]
struct BrokerState {
    upgrades: Arc<AtomicUsize>,
    drop_on_subscribe: bool,
}

async fn ws_handler(State(state): State<BrokerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    state.upgrades.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| echo_broker(socket, state))
}

/// Minimal broker: acks subscribes and reflects every publish back as a
/// "created" push on the published destination.
async fn echo_broker(mut socket: WebSocket, state: BrokerState) {
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        match frame {
            ClientFrame::Subscribe {
                subscription_id, ..
            } => {
                if state.drop_on_subscribe {
                    return;
                }
                let receipt = ServerFrame::Receipt { subscription_id };
                let encoded = serde_json::to_string(&receipt).expect("encode receipt");
                let _ = socket.send(WsMessage::Text(encoded)).await;
            }
            ClientFrame::Publish { destination, body } => {
                let Ok(message) = serde_json::from_value::<ChatMessage>(body) else {
                    continue;
                };
                let push = ServerFrame::Message {
                    destination,
                    envelope: Envelope::success(shared::protocol::codes::CREATED, message),
                };
                let encoded = serde_json::to_string(&push).expect("encode push");
                let _ = socket.send(WsMessage::Text(encoded)).await;
            }
            ClientFrame::Unsubscribe { .. } => {}
        }
    }
}

async fn spawn_broker(drop_on_subscribe: bool) -> (String, Arc<AtomicUsize>) {
    let upgrades = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/ws", get(ws_handler)).with_state(BrokerState {
        upgrades: Arc::clone(&upgrades),
        drop_on_subscribe,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("ws://{addr}/ws"), upgrades)
}

fn transport(url: &str) -> Arc<Transport> {
    Transport::new(url, Arc::new(MemoryCredentialStore::default()) as Arc<dyn CredentialStore>)
}

fn sample_message(id: i64) -> ChatMessage {
    ChatMessage {
        message_id: MessageId(id),
        chat_id: ChatId(7),
        sender_id: UserId(2),
        kind: MessageKind::Text,
        content: "hello".into(),
        created_at: DateTime::from_timestamp(100, 0).expect("timestamp"),
        client_message_id: None,
    }
}

async fn wait_for_status(transport: &Arc<Transport>, wanted: LinkStatus) {
    timeout(Duration::from_secs(2), async {
        loop {
            if transport.status().await == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status change");
}

#[tokio::test]
async fn concurrent_connects_share_one_socket() {
    let (url, upgrades) = spawn_broker(false).await;
    let transport = transport(&url);

    let outcomes = futures::future::join_all((0..5).map(|_| {
        let transport = Arc::clone(&transport);
        async move { transport.connect().await }
    }))
    .await;

    assert!(outcomes.iter().all(|outcome| outcome.is_ok()));
    assert_eq!(upgrades.load(Ordering::SeqCst), 1);
    assert_eq!(transport.status().await, LinkStatus::Connected);

    // Connecting again while connected is a no-op.
    transport.connect().await.expect("idempotent connect");
    assert_eq!(upgrades.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_connect_leaves_error_status_for_all_joiners() {
    // Nothing is listening on this port.
    let transport = transport("ws://127.0.0.1:1/ws");

    let outcomes = futures::future::join_all((0..5).map(|_| {
        let transport = Arc::clone(&transport);
        async move { transport.connect().await }
    }))
    .await;

    assert!(outcomes.iter().all(|outcome| outcome.is_err()));
    assert_eq!(transport.status().await, LinkStatus::Error);
}

#[tokio::test]
async fn published_messages_come_back_to_the_subscriber() {
    let (url, _upgrades) = spawn_broker(false).await;
    let transport = transport(&url);
    transport.connect().await.expect("connect");

    let destination = chat_destination(ChatId(7));
    let mut stream = transport
        .subscribe(&destination, &destination)
        .await
        .expect("subscribe");

    let message = sample_message(41);
    transport
        .publish(&destination, serde_json::to_value(&message).expect("encode"))
        .await
        .expect("publish");

    let envelope = timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("push arrives")
        .expect("stream open");
    assert!(envelope.is_success(&[shared::protocol::codes::CREATED]));
    assert_eq!(
        envelope.data.expect("payload").message_id,
        MessageId(41)
    );
}

#[tokio::test]
async fn resubscribing_a_key_replaces_the_previous_handler() {
    let (url, _upgrades) = spawn_broker(false).await;
    let transport = transport(&url);
    transport.connect().await.expect("connect");

    let destination = chat_destination(ChatId(7));
    let mut first = transport
        .subscribe(&destination, &destination)
        .await
        .expect("first subscribe");
    let mut second = transport
        .subscribe(&destination, &destination)
        .await
        .expect("second subscribe");

    // The first stream ended the moment it was replaced.
    assert!(timeout(Duration::from_secs(2), first.recv())
        .await
        .expect("first stream closes")
        .is_none());

    let message = sample_message(42);
    transport
        .publish(&destination, serde_json::to_value(&message).expect("encode"))
        .await
        .expect("publish");

    let envelope = timeout(Duration::from_secs(2), second.recv())
        .await
        .expect("push arrives")
        .expect("stream open");
    assert_eq!(envelope.data.expect("payload").message_id, MessageId(42));
}

#[tokio::test]
async fn operations_require_a_connected_link() {
    let (url, _upgrades) = spawn_broker(false).await;
    let transport = transport(&url);

    assert_eq!(transport.status().await, LinkStatus::Idle);
    assert!(transport.subscribe("/topic/chats/7", "/topic/chats/7").await.is_err());
    assert!(transport
        .publish("/topic/chats/7", serde_json::json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn disconnect_always_lands_disconnected() {
    let (url, _upgrades) = spawn_broker(false).await;
    let transport = transport(&url);
    transport.connect().await.expect("connect");

    let destination = chat_destination(ChatId(7));
    let mut stream = transport
        .subscribe(&destination, &destination)
        .await
        .expect("subscribe");

    transport.disconnect().await;
    assert_eq!(transport.status().await, LinkStatus::Disconnected);
    assert!(timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("stream closes")
        .is_none());
    assert!(transport.publish(&destination, serde_json::json!({})).await.is_err());
}

#[tokio::test]
async fn link_loss_ends_subscriber_streams() {
    let (url, _upgrades) = spawn_broker(true).await;
    let transport = transport(&url);
    transport.connect().await.expect("connect");

    let destination = chat_destination(ChatId(7));
    let mut stream = transport
        .subscribe(&destination, &destination)
        .await
        .expect("subscribe");

    // The broker hangs up on subscribe; the subscriber sees end-of-stream
    // and the link settles in Disconnected without touching any caller.
    assert!(timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("stream closes")
        .is_none());
    wait_for_status(&transport, LinkStatus::Disconnected).await;
}
