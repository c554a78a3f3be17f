use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use shared::{
    domain::{ChatId, MessageId, MessageKind, RoomStatus, UserId},
    error::ApiFailure,
    protocol::{
        chat_destination, codes, ChatMessage, Envelope, MarkReadRequest, SendMessageRequest,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::TokenCoordinator,
    history::HistoryLoader,
    http::{ApiClient, RequestOptions},
    timeline::{Merge, Timeline, TimelineEntry},
    transport::Transport,
};

fn is_auth_handshake_error(err: &anyhow::Error) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("401") || message.contains("unauthorized")
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room session already unmounted")]
    Unmounted,
    #[error(transparent)]
    Api(#[from] ApiFailure),
}

/// Everything a view layer needs to know about a room, emitted over a
/// broadcast channel.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    HistoryLoaded { prepended: Vec<MessageId> },
    TimelineChanged,
    Live,
    ConnectionLost,
    SendFailed {
        client_message_id: String,
        reason: String,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Mounted,
    HistoryLoading,
    Connecting,
    Live,
    Unmounted,
}

#[derive(Debug, Clone, Copy)]
pub struct RoomDescriptor {
    pub chat_id: ChatId,
    pub counterpart_user_id: UserId,
    pub status: RoomStatus,
}

pub(crate) struct RoomDeps {
    pub api: Arc<ApiClient>,
    pub history: Arc<HistoryLoader>,
    pub transport: Arc<Transport>,
    pub tokens: Arc<TokenCoordinator>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

struct RoomState {
    timeline: Timeline,
    status: SessionStatus,
    history_loaded: bool,
    subscribed: bool,
    last_read_marked: Option<MessageId>,
}

/// One mounted chat room: loads history, keeps the broker subscription
/// alive, reconciles optimistic sends, and emits read receipts. Owned by
/// exactly one view; never shared across rooms or mount cycles.
pub struct RoomSession {
    chat_id: ChatId,
    local_user_id: UserId,
    counterpart_user_id: UserId,
    room_status: RoomStatus,
    api: Arc<ApiClient>,
    history: Arc<HistoryLoader>,
    transport: Arc<Transport>,
    tokens: Arc<TokenCoordinator>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    state: Mutex<RoomState>,
    events: broadcast::Sender<RoomEvent>,
    cancelled: AtomicBool,
    attach_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    pub(crate) async fn mount(
        deps: RoomDeps,
        descriptor: RoomDescriptor,
        local_user_id: UserId,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let session = Arc::new(Self {
            chat_id: descriptor.chat_id,
            local_user_id,
            counterpart_user_id: descriptor.counterpart_user_id,
            room_status: descriptor.status,
            api: deps.api,
            history: deps.history,
            transport: deps.transport,
            tokens: deps.tokens,
            reconnect_initial: deps.reconnect_initial,
            reconnect_max: deps.reconnect_max,
            state: Mutex::new(RoomState {
                timeline: Timeline::new(descriptor.chat_id),
                status: SessionStatus::Mounted,
                history_loaded: false,
                subscribed: false,
                last_read_marked: None,
            }),
            events,
            cancelled: AtomicBool::new(false),
            attach_task: Mutex::new(None),
        });

        info!(chat_id = descriptor.chat_id.0, "room session mounting");

        // History load and broker attach run in parallel; the room is Live
        // once both are done, while pushes arriving early are buffered by
        // the timeline. The history call is never aborted: if the room
        // unmounts first, its resolution is simply ignored.
        tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run_initial_history().await }
        });
        let attach_task = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run_attach_loop().await }
        });
        *session.attach_task.lock().await = Some(attach_task);

        session
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn counterpart_user_id(&self) -> UserId {
        self.counterpart_user_id
    }

    pub fn room_status(&self) -> RoomStatus {
        self.room_status
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    pub async fn timeline_snapshot(&self) -> Vec<TimelineEntry> {
        self.state.lock().await.timeline.entries().to_vec()
    }

    /// Append an optimistic entry and post the send. The entry is rolled
    /// back if the request fails; if it succeeds the entry stays pending
    /// until the broker delivers the confirmed twin.
    pub async fn send(&self, content: impl Into<String>) -> Result<(), SessionError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SessionError::Unmounted);
        }
        let content = content.into();
        let client_message_id = Uuid::new_v4().to_string();

        let pending = {
            let mut state = self.state.lock().await;
            state.timeline.append_pending(
                self.local_user_id,
                content.clone(),
                client_message_id.clone(),
            )
        };
        self.emit(RoomEvent::TimelineChanged);

        let request = SendMessageRequest {
            chat_id: self.chat_id,
            content,
            kind: MessageKind::Text,
            client_message_id: client_message_id.clone(),
        };
        let outcome = self
            .api
            .post::<ChatMessage, _>(
                &format!("/chats/{}/messages", self.chat_id.0),
                &request,
                RequestOptions::with_success_codes(&[codes::OK, codes::CREATED]),
            )
            .await;

        match outcome {
            Ok(ack) => {
                // The broker push is the canonical confirmation; the ack
                // only tells us whether the twin already landed.
                let already_confirmed = {
                    let state = self.state.lock().await;
                    state.timeline.is_confirmed(&client_message_id)
                };
                if already_confirmed {
                    debug!(
                        chat_id = self.chat_id.0,
                        message_id = ack.message_id.0,
                        "send acked after broker delivery"
                    );
                }
                Ok(())
            }
            Err(failure) => {
                if !self.cancelled.load(Ordering::SeqCst) {
                    let removed = {
                        let mut state = self.state.lock().await;
                        state.timeline.remove_pending(pending.message_id)
                    };
                    if removed {
                        self.emit(RoomEvent::TimelineChanged);
                    }
                    warn!(
                        chat_id = self.chat_id.0,
                        "send failed; optimistic entry rolled back: {failure}"
                    );
                    self.emit(RoomEvent::SendFailed {
                        client_message_id,
                        reason: failure.to_string(),
                    });
                }
                Err(SessionError::Api(failure))
            }
        }
    }

    /// Fetch the next older page. No-op when history is exhausted or a load
    /// for this room is already in flight.
    pub async fn load_more(&self) -> Result<(), SessionError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SessionError::Unmounted);
        }
        let cursor = {
            let state = self.state.lock().await;
            if !state.timeline.has_more_history() {
                debug!(chat_id = self.chat_id.0, "no further history to load");
                return Ok(());
            }
            state.timeline.history_cursor()
        };

        let page = self
            .history
            .load_page(self.chat_id, cursor)
            .await
            .map_err(SessionError::Api)?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SessionError::Unmounted);
        }
        let Some(page) = page else {
            return Ok(());
        };

        let prepended = {
            let mut state = self.state.lock().await;
            state.timeline.absorb_history(page)
        };
        if !prepended.is_empty() {
            self.emit(RoomEvent::TimelineChanged);
        }
        self.emit(RoomEvent::HistoryLoaded { prepended });
        Ok(())
    }

    /// Detach from the room. In-flight calls are abandoned, not cancelled:
    /// each resolution re-checks the flag before touching state.
    pub async fn unmount(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(chat_id = self.chat_id.0, "room session unmounting");
        // Aborting the attach loop clears any pending backoff timer along
        // with the push consumer.
        if let Some(task) = self.attach_task.lock().await.take() {
            task.abort();
        }
        self.transport
            .unsubscribe(&chat_destination(self.chat_id))
            .await;
        self.state.lock().await.status = SessionStatus::Unmounted;
    }

    async fn run_initial_history(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.timeline.begin_history_load();
            if state.status == SessionStatus::Mounted {
                state.status = SessionStatus::HistoryLoading;
            }
        }

        let result = self.history.load_page(self.chat_id, None).await;
        if self.cancelled.load(Ordering::SeqCst) {
            debug!(
                chat_id = self.chat_id.0,
                "history resolved after unmount; dropping result"
            );
            return;
        }

        match result {
            Ok(Some(page)) => {
                let prepended = {
                    let mut state = self.state.lock().await;
                    let prepended = state.timeline.finish_history(page);
                    state.history_loaded = true;
                    prepended
                };
                self.emit(RoomEvent::HistoryLoaded { prepended });
                self.emit(RoomEvent::TimelineChanged);
                self.maybe_mark_read().await;
                self.update_liveness().await;
            }
            Ok(None) => {
                // Another load owns this room's slot and will publish it.
            }
            Err(failure) => {
                warn!(
                    chat_id = self.chat_id.0,
                    "initial history load failed: {failure}"
                );
                self.emit(RoomEvent::Error(format!("history load failed: {failure}")));
            }
        }
    }

    /// Keep the broker subscription alive until unmount: connect and
    /// subscribe, drain pushes, and on loss retry with exponential backoff
    /// from 1s doubling to the 10s cap.
    async fn run_attach_loop(self: &Arc<Self>) {
        let destination = chat_destination(self.chat_id);
        let mut delay = self.reconnect_initial;
        let mut first_attempt = true;

        while !self.cancelled.load(Ordering::SeqCst) {
            match self.attach_once(&destination).await {
                Ok(stream) => {
                    delay = self.reconnect_initial;
                    if !first_attempt {
                        info!(
                            chat_id = self.chat_id.0,
                            "broker subscription re-established"
                        );
                    }
                    self.set_subscribed(true).await;
                    self.consume_pushes(stream).await;
                    self.set_subscribed(false).await;
                    if self.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    self.emit(RoomEvent::ConnectionLost);
                }
                Err(err) => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!(chat_id = self.chat_id.0, "broker attach failed: {err:#}");
                    // A rejected handshake usually means the access token
                    // went stale while we were offline; the next attempt
                    // dials with whatever the coordinator hands back.
                    if is_auth_handshake_error(&err) {
                        let _ = self.tokens.refresh().await;
                    }
                }
            }
            first_attempt = false;
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.reconnect_max);
        }
    }

    async fn attach_once(
        &self,
        destination: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<Envelope<ChatMessage>>> {
        self.transport.connect().await.context("broker connect")?;
        let stream = self
            .transport
            .subscribe(destination, destination)
            .await
            .context("broker subscribe")?;
        Ok(stream)
    }

    async fn consume_pushes(
        self: &Arc<Self>,
        receiver: mpsc::UnboundedReceiver<Envelope<ChatMessage>>,
    ) {
        let mut stream = UnboundedReceiverStream::new(receiver);
        while let Some(envelope) = stream.next().await {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if !envelope.is_success(&[codes::CREATED]) {
                debug!(
                    chat_id = self.chat_id.0,
                    code = %envelope.code,
                    "ignoring broker envelope without created code"
                );
                continue;
            }
            let Some(message) = envelope.data else {
                warn!(chat_id = self.chat_id.0, "created envelope without message payload");
                continue;
            };
            self.ingest_push(message).await;
        }
    }

    pub(crate) async fn ingest_push(&self, message: ChatMessage) {
        if message.chat_id != self.chat_id {
            debug!(
                chat_id = self.chat_id.0,
                other = message.chat_id.0,
                "push for another room ignored"
            );
            return;
        }
        let merge = {
            let mut state = self.state.lock().await;
            state.timeline.merge_confirmed(message)
        };
        match merge {
            Merge::Duplicate => {
                debug!(chat_id = self.chat_id.0, "duplicate broker delivery ignored")
            }
            Merge::Buffered => {
                debug!(chat_id = self.chat_id.0, "push buffered until history settles")
            }
            Merge::ResolvedPending | Merge::Inserted => {
                self.emit(RoomEvent::TimelineChanged);
                self.maybe_mark_read().await;
            }
        }
    }

    /// Best-effort read receipt for the newest counterpart message: one
    /// call per message id, failures swallowed, never blocking the merge
    /// path that triggered it.
    async fn maybe_mark_read(&self) {
        let target = {
            let mut state = self.state.lock().await;
            let candidate = state
                .timeline
                .latest()
                .map(|entry| (entry.message.sender_id, entry.message.message_id));
            let Some((sender_id, message_id)) = candidate else {
                return;
            };
            if sender_id == self.local_user_id
                || message_id.is_pending()
                || state.last_read_marked == Some(message_id)
            {
                return;
            }
            state.last_read_marked = Some(message_id);
            message_id
        };

        let path = format!("/chats/{}/messages/{}/read", self.chat_id.0, target.0);
        let request = MarkReadRequest {
            chat_id: self.chat_id,
            message_id: target,
        };
        if let Err(failure) = self
            .api
            .patch_unit(
                &path,
                &request,
                RequestOptions::with_success_codes(&[codes::OK, codes::SUCCESS]),
            )
            .await
        {
            debug!(
                chat_id = self.chat_id.0,
                message_id = target.0,
                "mark-read failed: {failure}"
            );
        }
    }

    async fn set_subscribed(&self, subscribed: bool) {
        {
            let mut state = self.state.lock().await;
            if state.status == SessionStatus::Unmounted {
                return;
            }
            state.subscribed = subscribed;
            if !subscribed && state.status == SessionStatus::Live {
                state.status = SessionStatus::Connecting;
            }
        }
        if subscribed {
            self.update_liveness().await;
        }
    }

    async fn update_liveness(&self) {
        let became_live = {
            let mut state = self.state.lock().await;
            if state.status == SessionStatus::Unmounted {
                return;
            }
            if state.history_loaded && state.subscribed && state.status != SessionStatus::Live {
                state.status = SessionStatus::Live;
                true
            } else {
                false
            }
        };
        if became_live {
            info!(chat_id = self.chat_id.0, "room session live");
            self.emit(RoomEvent::Live);
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
