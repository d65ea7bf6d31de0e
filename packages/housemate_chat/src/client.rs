//! Reconnecting socket client
//!
//! Keeps one live socket to the server, rejoining the user room and every joined
//! conversation after each reconnect, since the server forgets them on disconnect.
//! Retries are bounded; once they run out the client gives up and the caller falls
//! back to the HTTP surface.
//!
//! A connection in both the receiver's user room and the conversation room hears each
//! `new_message` twice, so repeats are dropped by message id before reaching the caller.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::models::{ConversationId, MessageDraft, MessageId, UserId};
use crate::ws::{
    ClientEvent, MarkReadPayload, SendMessagePayload, ServerEvent, TempId, TypingPayload,
};

/// How many recent message ids are remembered for de-duplication.
const SEEN_CAPACITY: usize = 1024;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted.
    GaveUp,
    /// Torn down by the caller.
    Closed,
}

pub struct ChatClient {
    commands: mpsc::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Bounded memory of delivered message ids, oldest evicted first.
struct SeenMessages {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl SeenMessages {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; false if it was already seen.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

enum SessionEnd {
    /// Transport dropped; try again.
    Lost,
    /// Cancelled, or every handle to the client is gone.
    Finished,
}

impl ChatClient {
    /// Start connecting to `url` as `user_id`. Server events arrive on the returned receiver.
    pub fn connect(
        url: impl Into<String>,
        user_id: UserId,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            url.into(),
            user_id,
            policy,
            command_rx,
            event_tx,
            state_tx,
            cancel.clone(),
        ));

        (
            Self {
                commands: command_tx,
                state: state_rx,
                cancel,
                task,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn join_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.send(ClientEvent::JoinConversation(conversation_id))
            .await
    }

    pub async fn leave_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.send(ClientEvent::LeaveConversation(conversation_id))
            .await
    }

    /// Submit a message; the server answers with `message_sent` or `message_error`
    /// carrying `temp_id`.
    pub async fn send_message(
        &self,
        draft: MessageDraft,
        temp_id: impl Into<TempId>,
    ) -> Result<()> {
        self.send(ClientEvent::SendMessage(SendMessagePayload {
            draft,
            temp_id: Some(temp_id.into()),
        }))
        .await
    }

    pub async fn typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) -> Result<()> {
        self.send(ClientEvent::Typing(TypingPayload {
            conversation_id,
            user_id,
            is_typing,
        }))
        .await
    }

    pub async fn mark_read(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        self.send(ClientEvent::MarkRead(MarkReadPayload {
            conversation_id,
            user_id,
        }))
        .await
    }

    /// Log out: leave the user room and tear the client down, waiting for its task.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    async fn send(&self, event: ClientEvent) -> Result<()> {
        self.commands
            .send(event)
            .await
            .ok()
            .context("Client is no longer running")
    }
}

async fn run(
    url: String,
    user_id: UserId,
    policy: ReconnectPolicy,
    mut commands: mpsc::Receiver<ClientEvent>,
    events: mpsc::Sender<ServerEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut joined: BTreeSet<ConversationId> = BTreeSet::new();
    let mut seen = SeenMessages::new(SEEN_CAPACITY);
    let mut attempt = 0u32;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((socket, _)) => {
                attempt = 0;
                state.send_replace(ConnectionState::Connected);
                info!(%url, user_id, "Socket connected");

                let end = session(
                    socket,
                    user_id,
                    &mut joined,
                    &mut seen,
                    &mut commands,
                    &events,
                    &cancel,
                )
                .await;
                match end {
                    SessionEnd::Finished => break,
                    SessionEnd::Lost => info!(%url, "Socket connection lost"),
                }
            }
            Err(e) => warn!(%url, attempt, "Socket connect failed: {}", e),
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            warn!(%url, "Giving up after {} reconnect attempts", policy.max_attempts);
            state.send_replace(ConnectionState::GaveUp);
            return;
        }
        state.send_replace(ConnectionState::Reconnecting { attempt });

        let delay = policy.delay_for(attempt);
        debug!(attempt, ?delay, "Waiting before reconnect");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(ConnectionState::Closed);
}

async fn session(
    socket: Socket,
    user_id: UserId,
    joined: &mut BTreeSet<ConversationId>,
    seen: &mut SeenMessages,
    commands: &mut mpsc::Receiver<ClientEvent>,
    events: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut write, mut read) = socket.split();

    // Room membership lives only in the server's registry; restore it
    let mut rejoin = vec![ClientEvent::JoinUserRoom(user_id)];
    rejoin.extend(joined.iter().map(|id| ClientEvent::JoinConversation(*id)));
    for event in &rejoin {
        if send_event(&mut write, event).await.is_err() {
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = send_event(&mut write, &ClientEvent::LeaveUserRoom(user_id)).await;
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Finished;
            }
            command = commands.recv() => {
                let Some(event) = command else {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Finished;
                };
                match &event {
                    ClientEvent::JoinConversation(id) => {
                        joined.insert(*id);
                    }
                    ClientEvent::LeaveConversation(id) => {
                        joined.remove(id);
                    }
                    _ => {}
                }
                if let Err(e) = send_event(&mut write, &event).await {
                    warn!("Failed to send {:?}: {}", event, e);
                    return SessionEnd::Lost;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(ServerEvent::NewMessage(view)) if !seen.insert(view.message.id) => {
                                debug!(message_id = view.message.id, "Dropped repeated new_message");
                            }
                            Ok(event) => {
                                if events.send(event).await.is_err() {
                                    return SessionEnd::Finished;
                                }
                            }
                            Err(e) => warn!("Unreadable server event: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Socket read error: {}", e);
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }
}

async fn send_event<S>(write: &mut S, event: &ClientEvent) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(event)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}
