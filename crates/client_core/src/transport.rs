use std::{collections::HashMap, sync::Arc};

use futures::{SinkExt, StreamExt};
use shared::{
    error::ApiFailure,
    protocol::{ChatMessage, ClientFrame, Envelope, ServerFrame},
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

struct Subscription {
    subscription_id: u64,
    destination: String,
    sender: mpsc::UnboundedSender<Envelope<ChatMessage>>,
}

struct TransportState {
    status: LinkStatus,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    subscriptions: HashMap<String, Subscription>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ApiFailure>>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    next_subscription_id: u64,
    /// Bumped per established socket so a stale reader cannot tear down its
    /// successor.
    generation: u64,
}

struct OpenedSocket {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    ready_tx: oneshot::Sender<u64>,
}

/// The one broker connection for the whole client process. Rooms multiplex
/// their subscriptions over it; it never opens a second socket.
pub struct Transport {
    broker_url: String,
    store: Arc<dyn CredentialStore>,
    inner: Mutex<TransportState>,
}

impl Transport {
    pub fn new(broker_url: impl Into<String>, store: Arc<dyn CredentialStore>) -> Arc<Self> {
        Arc::new(Self {
            broker_url: broker_url.into(),
            store,
            inner: Mutex::new(TransportState {
                status: LinkStatus::Idle,
                outbound: None,
                subscriptions: HashMap::new(),
                connect_waiters: Vec::new(),
                reader_task: None,
                writer_task: None,
                next_subscription_id: 0,
                generation: 0,
            }),
        })
    }

    pub async fn status(&self) -> LinkStatus {
        self.inner.lock().await.status
    }

    /// Idempotent connect. Already connected resolves immediately; while an
    /// attempt is in flight every additional caller joins it and observes
    /// the same outcome. Failure leaves the link in `Error` without
    /// retrying; reconnection policy belongs to the sessions.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ApiFailure> {
        let waiter = {
            let mut inner = self.inner.lock().await;
            match inner.status {
                LinkStatus::Connected => return Ok(()),
                LinkStatus::Connecting => {
                    let (tx, rx) = oneshot::channel();
                    inner.connect_waiters.push(tx);
                    Some(rx)
                }
                _ => {
                    inner.status = LinkStatus::Connecting;
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ApiFailure::Transport("connection attempt abandoned".into())),
            };
        }

        // The attempt runs in its own task: even if the owning caller is
        // aborted mid-dial, the outcome still lands and the joiners are
        // released.
        let attempt = tokio::spawn(Arc::clone(self).run_connect_attempt());
        match attempt.await {
            Ok(result) => result,
            Err(_) => Err(ApiFailure::Transport("connection attempt failed".into())),
        }
    }

    async fn run_connect_attempt(self: Arc<Self>) -> Result<(), ApiFailure> {
        let opened = self.open_socket().await;

        let (result, waiters) = {
            let mut inner = self.inner.lock().await;
            let result = match opened {
                Ok(socket) if inner.status == LinkStatus::Connecting => {
                    inner.generation += 1;
                    let _ = socket.ready_tx.send(inner.generation);
                    inner.outbound = Some(socket.outbound);
                    inner.reader_task = Some(socket.reader_task);
                    inner.writer_task = Some(socket.writer_task);
                    inner.status = LinkStatus::Connected;
                    Ok(())
                }
                Ok(socket) => {
                    // Torn down while we were dialing.
                    socket.reader_task.abort();
                    socket.writer_task.abort();
                    Err(ApiFailure::Transport("disconnected during connect".into()))
                }
                Err(failure) => {
                    if inner.status == LinkStatus::Connecting {
                        inner.status = LinkStatus::Error;
                    }
                    Err(failure)
                }
            };
            (result, std::mem::take(&mut inner.connect_waiters))
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        if result.is_ok() {
            info!(url = %self.broker_url, "broker connection established");
        }
        result
    }

    async fn open_socket(self: &Arc<Self>) -> Result<OpenedSocket, ApiFailure> {
        let url = self.connect_url().await?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ApiFailure::Transport(format!("broker connect failed: {err}")))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    debug!("broker sink closed; stopping writer");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (ready_tx, ready_rx) = oneshot::channel::<u64>();
        let transport = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            // Wait until the connect owner has registered this socket, so a
            // dead-on-arrival link cannot race the installation.
            let Ok(generation) = ready_rx.await else {
                return;
            };
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Message {
                            destination,
                            envelope,
                        }) => transport.route_message(&destination, envelope).await,
                        Ok(ServerFrame::Receipt { subscription_id }) => {
                            debug!(subscription_id, "broker receipt");
                        }
                        Ok(ServerFrame::Error { message }) => {
                            warn!("broker error frame: {message}");
                        }
                        Err(err) => warn!("invalid broker frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("broker receive failed: {err}");
                        break;
                    }
                }
            }
            transport.handle_link_down(generation).await;
        });

        Ok(OpenedSocket {
            outbound: outbound_tx,
            reader_task,
            writer_task,
            ready_tx,
        })
    }

    async fn connect_url(&self) -> Result<Url, ApiFailure> {
        let mut url = Url::parse(&self.broker_url)
            .map_err(|err| ApiFailure::Transport(format!("invalid broker url: {err}")))?;
        // The token is re-read on every attempt, so a reconnect after a
        // refresh carries the new credential.
        if let Some(tokens) = self.store.load().await {
            url.query_pairs_mut()
                .append_pair("access_token", &tokens.access_token);
        }
        Ok(url)
    }

    async fn route_message(&self, destination: &str, envelope: Envelope<ChatMessage>) {
        let inner = self.inner.lock().await;
        let Some(subscription) = inner
            .subscriptions
            .values()
            .find(|subscription| subscription.destination == destination)
        else {
            debug!(destination, "push for destination without a live subscription");
            return;
        };
        // A dropped consumer must not take the read loop down with it.
        if subscription.sender.send(envelope).is_err() {
            debug!(destination, "subscriber gone; push dropped");
        }
    }

    async fn handle_link_down(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation
            || matches!(
                inner.status,
                LinkStatus::Disconnecting | LinkStatus::Disconnected
            )
        {
            return;
        }
        info!("broker link lost");
        inner.status = LinkStatus::Disconnected;
        inner.outbound = None;
        inner.reader_task = None;
        if let Some(task) = inner.writer_task.take() {
            task.abort();
        }
        // Dropping the senders ends every subscriber's stream; sessions see
        // the end-of-stream and drive their own reconnect.
        inner.subscriptions.clear();
    }

    /// Register the only live subscription for `key`. Replacing happens
    /// under the lock: the previous sender is dropped before the new
    /// registration is observable, so there is no window with two handlers.
    pub async fn subscribe(
        &self,
        destination: &str,
        key: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope<ChatMessage>>, ApiFailure> {
        let mut inner = self.inner.lock().await;
        if inner.status != LinkStatus::Connected {
            return Err(ApiFailure::Transport(format!(
                "cannot subscribe while {:?}",
                inner.status
            )));
        }
        let outbound = inner
            .outbound
            .clone()
            .ok_or_else(|| ApiFailure::Transport("broker writer unavailable".into()))?;

        inner.next_subscription_id += 1;
        let subscription_id = inner.next_subscription_id;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(previous) = inner.subscriptions.insert(
            key.to_string(),
            Subscription {
                subscription_id,
                destination: destination.to_string(),
                sender: tx,
            },
        ) {
            let _ = outbound.send(ClientFrame::Unsubscribe {
                subscription_id: previous.subscription_id,
            });
        }

        if outbound
            .send(ClientFrame::Subscribe {
                destination: destination.to_string(),
                subscription_id,
            })
            .is_err()
        {
            inner.subscriptions.remove(key);
            return Err(ApiFailure::Transport("broker writer closed".into()));
        }

        info!(destination, key, "subscribed to broker destination");
        Ok(rx)
    }

    pub async fn unsubscribe(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(subscription) = inner.subscriptions.remove(key) {
            if let Some(outbound) = &inner.outbound {
                let _ = outbound.send(ClientFrame::Unsubscribe {
                    subscription_id: subscription.subscription_id,
                });
            }
            info!(key, "unsubscribed from broker destination");
        }
    }

    /// Fire-and-forget send over the shared socket.
    pub async fn publish(
        &self,
        destination: &str,
        body: serde_json::Value,
    ) -> Result<(), ApiFailure> {
        let inner = self.inner.lock().await;
        if inner.status != LinkStatus::Connected {
            return Err(ApiFailure::Transport(format!(
                "cannot publish while {:?}",
                inner.status
            )));
        }
        let outbound = inner
            .outbound
            .as_ref()
            .ok_or_else(|| ApiFailure::Transport("broker writer unavailable".into()))?;
        outbound
            .send(ClientFrame::Publish {
                destination: destination.to_string(),
                body,
            })
            .map_err(|_| ApiFailure::Transport("broker writer closed".into()))
    }

    /// Tear the link down. Queued unsubscribe frames are flushed by the
    /// writer before the socket closes; the status always ends
    /// `Disconnected`.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = LinkStatus::Disconnecting;
        let outbound = inner.outbound.take();
        for (_, subscription) in inner.subscriptions.drain() {
            if let Some(outbound) = &outbound {
                let _ = outbound.send(ClientFrame::Unsubscribe {
                    subscription_id: subscription.subscription_id,
                });
            }
        }
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }
        // Dropping the outbound sender lets the writer drain and close.
        inner.writer_task = None;
        inner.status = LinkStatus::Disconnected;
        info!("broker connection closed");
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
