use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    time::Duration,
};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::DateTime;
use shared::{
    domain::{MessageId, MessageKind, UserId},
    protocol::{AuthTokens, Envelope},
};
use tokio::net::TcpListener;

use crate::auth::{CredentialStore, MemoryCredentialStore, TokenCoordinator};

async fn spawn_app(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn loader(base: &str, page_size: u32) -> HistoryLoader {
    let store = Arc::new(MemoryCredentialStore::new(Some(AuthTokens {
        access_token: "access-0".into(),
        refresh_token: "refresh-0".into(),
    })));
    let tokens = Arc::new(TokenCoordinator::new(
        base,
        Arc::clone(&store) as Arc<dyn CredentialStore>,
    ));
    let api = Arc::new(ApiClient::new(
        base,
        store as Arc<dyn CredentialStore>,
        tokens,
    ));
    HistoryLoader::new(api, page_size)
}

fn row(id: i64, at_secs: i64) -> ChatMessage {
    ChatMessage {
        message_id: MessageId(id),
        chat_id: ChatId(7),
        sender_id: UserId(2),
        kind: MessageKind::Text,
        content: format!("message {id}"),
        created_at: DateTime::from_timestamp(at_secs, 0).expect("timestamp"),
        client_message_id: None,
    }
}

#[derive(Clone)]
struct HistoryBackend {
    calls: Arc<AtomicUsize>,
    delay_ms: u64,
}

async fn descending_history(State(state): State<HistoryBackend>) -> Json<Envelope<HistoryPage>> {
    state.calls.fetch_add(1, AtomicOrdering::SeqCst);
    tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
    // Newest-first, the way the backend actually returns pages.
    Json(Envelope::success(
        codes::OK,
        HistoryPage {
            messages: vec![row(12, 200), row(10, 100), row(11, 150)],
            next_cursor: Some(9),
            has_more: true,
        },
    ))
}

#[tokio::test]
async fn pages_are_reordered_ascending_client_side() {
    let state = HistoryBackend {
        calls: Arc::new(AtomicUsize::new(0)),
        delay_ms: 0,
    };
    let app = Router::new()
        .route("/chats/:chat_id/messages", get(descending_history))
        .with_state(state.clone());
    let base = spawn_app(app).await;

    let loader = loader(&base, 50);
    let page = loader
        .load_page(ChatId(7), None)
        .await
        .expect("load")
        .expect("not suppressed");

    let ids: Vec<i64> = page.messages.iter().map(|m| m.message_id.0).collect();
    assert_eq!(ids, vec![10, 11, 12]);
    assert_eq!(page.next_cursor, Some(9));
    assert!(page.has_more);
    assert_eq!(state.calls.load(AtomicOrdering::SeqCst), 1);
}

#[tokio::test]
async fn overlapping_load_for_same_room_is_suppressed() {
    let state = HistoryBackend {
        calls: Arc::new(AtomicUsize::new(0)),
        delay_ms: 100,
    };
    let app = Router::new()
        .route("/chats/:chat_id/messages", get(descending_history))
        .with_state(state.clone());
    let base = spawn_app(app).await;

    let loader = Arc::new(loader(&base, 50));
    let (first, second) = tokio::join!(
        loader.load_page(ChatId(7), None),
        loader.load_page(ChatId(7), None),
    );

    let pages = [first.expect("first"), second.expect("second")];
    assert_eq!(pages.iter().filter(|page| page.is_some()).count(), 1);
    assert_eq!(pages.iter().filter(|page| page.is_none()).count(), 1);
    assert_eq!(state.calls.load(AtomicOrdering::SeqCst), 1);

    // The slot is free again once the winning load resolves.
    let third = loader
        .load_page(ChatId(7), Some(9))
        .await
        .expect("third load");
    assert!(third.is_some());
    assert_eq!(state.calls.load(AtomicOrdering::SeqCst), 2);
}

#[tokio::test]
async fn failed_load_releases_the_inflight_slot() {
    #[derive(Clone)]
    struct FailCounter {
        calls: Arc<AtomicUsize>,
    }
    async fn broken_history(State(state): State<FailCounter>) -> impl IntoResponse {
        state.calls.fetch_add(1, AtomicOrdering::SeqCst);
        (StatusCode::INTERNAL_SERVER_ERROR, "boom")
    }

    let state = FailCounter {
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/chats/:chat_id/messages", get(broken_history))
        .with_state(state.clone());
    let base = spawn_app(app).await;

    let loader = loader(&base, 50);
    assert!(loader.load_page(ChatId(7), None).await.is_err());
    assert!(loader.load_page(ChatId(7), None).await.is_err());
    assert_eq!(state.calls.load(AtomicOrdering::SeqCst), 2);
}
