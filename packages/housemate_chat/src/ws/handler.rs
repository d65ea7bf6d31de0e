//! Socket Handler
//!
//! One task pair per connection: a sender draining the outbound queue into the
//! socket, and an input loop dispatching client events. Registry cleanup runs
//! whichever side ends first.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::ingress::MessageIngress;
use crate::metrics::ServerMetrics;
use crate::models::{conversation_room, user_room};

use super::broadcast::Broadcaster;
use super::protocol::{
    ClientEvent, ConnectedPayload, MessageErrorPayload, MessageSentPayload, ServerEvent,
    parse_client_frame,
};
use super::registry::{ConnectionId, SessionRegistry};

/// Handle one live socket connection until the client goes away.
pub async fn handle_chat_socket(
    socket: WebSocket,
    ingress: Arc<MessageIngress>,
    server_config: Arc<ServerConfig>,
    server_metrics: Arc<ServerMetrics>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %connection_id, "New socket connection");
    server_metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending events to the socket
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(server_config.socket.send_channel_capacity);

    let session = Session::new(
        connection_id.clone(),
        tx,
        ingress.clone(),
        server_metrics.clone(),
    );
    session.registry().register(&connection_id, session.tx.clone()).await;

    // Task to send events to the socket
    let sender_conn_id = connection_id.clone();
    let sender_task = async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!(conn_id = %sender_conn_id, "Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to handle incoming frames
    let input_metrics = server_metrics.clone();
    let input_conn_id = connection_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    session.handle_text(text.as_str()).await;
                }
                Ok(Message::Binary(_)) => {
                    input_metrics.socket_error();
                    session
                        .reply(ServerEvent::error("Binary frames are not supported"))
                        .await;
                }
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %input_conn_id, "Client closed socket");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    input_metrics.socket_error();
                    warn!(conn_id = %input_conn_id, "Socket error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => {},
        _ = input_task => {},
    }

    // Cleanup runs on every exit path, with or without explicit leaves first
    let departure = ingress.broadcaster().registry().disconnect(&connection_id).await;
    server_metrics.connection_closed();
    info!(
        conn_id = %connection_id,
        user_id = ?departure.user_id,
        conversations = departure.conversations.len(),
        "Socket connection closed"
    );
}

/// Event dispatch for one connection, independent of the transport.
pub struct Session {
    conn_id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
    ingress: Arc<MessageIngress>,
    metrics: Arc<ServerMetrics>,
}

impl Session {
    pub fn new(
        conn_id: ConnectionId,
        tx: mpsc::Sender<ServerEvent>,
        ingress: Arc<MessageIngress>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            conn_id,
            tx,
            ingress,
            metrics,
        }
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        self.ingress.broadcaster().registry()
    }

    fn broadcaster(&self) -> &Arc<Broadcaster> {
        self.ingress.broadcaster()
    }

    /// Reply on this connection only.
    async fn reply(&self, event: ServerEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(conn_id = %self.conn_id, "Reply dropped, connection closing");
        }
    }

    pub async fn handle_text(&self, text: &str) {
        self.metrics.event_received();
        match parse_client_frame(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                self.metrics.socket_error();
                warn!(conn_id = %self.conn_id, event = ?e.event, "Rejected frame: {}", e.reason);
                self.reply(e.into_reply()).await;
            }
        }
    }

    pub async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::JoinUserRoom(user_id) => {
                if user_id <= 0 {
                    self.reply(ServerEvent::error("userId must be a positive integer"))
                        .await;
                    return;
                }
                if let Some(previous) = self.registry().join(&self.conn_id, user_id).await {
                    debug!(conn_id = %self.conn_id, previous, user_id, "Connection switched user");
                }
                info!(conn_id = %self.conn_id, room = %user_room(user_id), "Joined user room");
                self.reply(ServerEvent::Connected(ConnectedPayload { user_id }))
                    .await;
            }

            ClientEvent::LeaveUserRoom(user_id) => {
                if self.registry().leave(&self.conn_id, user_id).await {
                    info!(conn_id = %self.conn_id, room = %user_room(user_id), "Left user room");
                } else {
                    debug!(conn_id = %self.conn_id, user_id, "leave_user_room for a room not joined");
                }
            }

            ClientEvent::JoinConversation(conversation_id) => {
                if conversation_id <= 0 {
                    self.reply(ServerEvent::error(
                        "conversationId must be a positive integer",
                    ))
                    .await;
                    return;
                }
                self.registry()
                    .join_conversation(&self.conn_id, conversation_id)
                    .await;
                debug!(
                    conn_id = %self.conn_id,
                    room = %conversation_room(conversation_id),
                    "Joined conversation"
                );
            }

            ClientEvent::LeaveConversation(conversation_id) => {
                self.registry()
                    .leave_conversation(&self.conn_id, conversation_id)
                    .await;
                debug!(conn_id = %self.conn_id, conversation_id, "Left conversation");
            }

            ClientEvent::SendMessage(payload) => {
                let temp_id = payload.temp_id;
                match self.ingress.submit(&payload.draft).await {
                    Ok(message) => {
                        self.reply(ServerEvent::MessageSent(MessageSentPayload {
                            message,
                            temp_id,
                        }))
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            conn_id = %self.conn_id,
                            temp_id = ?temp_id,
                            "send_message rejected: {}",
                            e
                        );
                        self.reply(ServerEvent::MessageError(MessageErrorPayload {
                            temp_id,
                            message: e.public_message(),
                        }))
                        .await;
                    }
                }
            }

            ClientEvent::Typing(payload) => {
                self.broadcaster()
                    .notify_typing(
                        payload.conversation_id,
                        payload.user_id,
                        payload.is_typing,
                        Some(&self.conn_id),
                    )
                    .await;
            }

            ClientEvent::MarkRead(payload) => {
                if let Err(e) = self
                    .ingress
                    .mark_read(payload.conversation_id, payload.user_id, Some(&self.conn_id))
                    .await
                {
                    warn!(conn_id = %self.conn_id, "mark_read rejected: {}", e);
                    self.reply(ServerEvent::error(e.public_message())).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ChatRepository, test_helpers};
    use serde_json::json;

    struct Harness {
        repository: Arc<ChatRepository>,
        registry: Arc<SessionRegistry>,
        ingress: Arc<MessageIngress>,
        metrics: Arc<ServerMetrics>,
    }

    impl Harness {
        async fn new() -> Self {
            let repository = Arc::new(test_helpers::repository_with_pair().await);
            let registry = Arc::new(SessionRegistry::new());
            let metrics = Arc::new(ServerMetrics::new());
            let broadcaster = Arc::new(Broadcaster::new(registry.clone(), metrics.clone()));
            let ingress = Arc::new(MessageIngress::new(
                repository.clone(),
                broadcaster,
                metrics.clone(),
            ));
            Self {
                repository,
                registry,
                ingress,
                metrics,
            }
        }

        async fn connect(&self, conn_id: &str) -> (Session, mpsc::Receiver<ServerEvent>) {
            let (tx, rx) = mpsc::channel(16);
            self.registry.register(conn_id, tx.clone()).await;
            let session = Session::new(
                conn_id.to_string(),
                tx,
                self.ingress.clone(),
                self.metrics.clone(),
            );
            (session, rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_user_room_acknowledges() {
        let h = Harness::new().await;
        let (session, mut rx) = h.connect("c1").await;

        session
            .handle_text(r#"{"event":"join_user_room","data":5}"#)
            .await;

        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Connected(ConnectedPayload { user_id: 5 })]
        );
        assert_eq!(h.registry.user_of("c1").await, Some(5));
    }

    #[tokio::test]
    async fn test_send_message_confirms_with_temp_id() {
        let h = Harness::new().await;
        let (ada, mut ada_rx) = h.connect("ada").await;
        let (grace, mut grace_rx) = h.connect("grace").await;
        grace
            .handle_text(r#"{"event":"join_user_room","data":9}"#)
            .await;
        drain(&mut grace_rx);

        ada.handle_text(
            r#"{"event":"send_message","data":{"senderId":5,"receiverId":9,"content":"hi","tempId":"t-1"}}"#,
        )
        .await;

        let confirmed = match drain(&mut ada_rx).as_slice() {
            [ServerEvent::MessageSent(payload)] => payload.clone(),
            other => panic!("Expected one MessageSent, got {:?}", other),
        };
        assert_eq!(confirmed.temp_id, Some(json!("t-1")));
        assert_eq!(confirmed.message.message.content.as_deref(), Some("hi"));

        match drain(&mut grace_rx).as_slice() {
            [ServerEvent::NewMessage(view)] => assert_eq!(view.message.id, confirmed.message.message.id),
            other => panic!("Expected one NewMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_numeric_temp_id_echoed_unchanged() {
        let h = Harness::new().await;
        let (ada, mut rx) = h.connect("ada").await;

        ada.handle_text(
            r#"{"event":"send_message","data":{"senderId":5,"receiverId":9,"content":"hi","tempId":1718000000123}}"#,
        )
        .await;
        ada.handle_text(
            r#"{"event":"send_message","data":{"senderId":5,"receiverId":404,"content":"hi","tempId":1718000000124}}"#,
        )
        .await;

        match drain(&mut rx).as_slice() {
            [ServerEvent::MessageSent(sent), ServerEvent::MessageError(failed)] => {
                assert_eq!(sent.temp_id, Some(json!(1718000000123i64)));
                assert_eq!(failed.temp_id, Some(json!(1718000000124i64)));
            }
            other => panic!("Expected MessageSent then MessageError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leave_user_room_stops_personal_delivery() {
        let h = Harness::new().await;
        let (ada, mut ada_rx) = h.connect("ada").await;
        let (grace, mut grace_rx) = h.connect("grace").await;
        grace
            .handle_text(r#"{"event":"join_user_room","data":9}"#)
            .await;
        grace
            .handle_text(r#"{"event":"leave_user_room","data":9}"#)
            .await;
        drain(&mut grace_rx);
        assert!(h.registry.user_of("grace").await.is_none());

        ada.handle_text(
            r#"{"event":"send_message","data":{"senderId":5,"receiverId":9,"content":"hi"}}"#,
        )
        .await;

        assert!(matches!(
            drain(&mut ada_rx).as_slice(),
            [ServerEvent::MessageSent(_)]
        ));
        assert!(drain(&mut grace_rx).is_empty());

        // Leaving a room the connection is not in is harmless
        grace
            .handle_text(r#"{"event":"leave_user_room","data":5}"#)
            .await;
        assert!(drain(&mut grace_rx).is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver_reports_temp_id_and_persists_nothing() {
        let h = Harness::new().await;
        let (ada, mut rx) = h.connect("ada").await;

        ada.handle_text(
            r#"{"event":"send_message","data":{"senderId":5,"receiverId":404,"content":"hi","tempId":"abc123"}}"#,
        )
        .await;

        match drain(&mut rx).as_slice() {
            [ServerEvent::MessageError(payload)] => {
                assert_eq!(payload.temp_id, Some(json!("abc123")));
                assert!(payload.message.contains("404"));
            }
            other => panic!("Expected MessageError, got {:?}", other),
        }
        assert!(h.repository.list_conversations(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_send_reports_temp_id() {
        let h = Harness::new().await;
        let (ada, mut rx) = h.connect("ada").await;

        ada.handle_text(
            r#"{"event":"send_message","data":{"senderId":5,"receiverId":"grace","tempId":"abc123"}}"#,
        )
        .await;

        match drain(&mut rx).as_slice() {
            [ServerEvent::MessageError(payload)] => {
                assert_eq!(payload.temp_id, Some(json!("abc123")))
            }
            other => panic!("Expected MessageError, got {:?}", other),
        }
        assert!(h.repository.list_conversations(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frame_gets_error_event() {
        let h = Harness::new().await;
        let (session, mut rx) = h.connect("c1").await;

        session.handle_text("{{{").await;
        session.handle_text(r#"{"event":"join_user_room","data":0}"#).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, ServerEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_typing_goes_to_other_viewers_only() {
        let h = Harness::new().await;
        let (ada, mut ada_rx) = h.connect("ada").await;
        let (grace, mut grace_rx) = h.connect("grace").await;
        for session in [&ada, &grace] {
            session
                .handle_text(r#"{"event":"join_conversation","data":3}"#)
                .await;
        }

        ada.handle_text(r#"{"event":"typing","data":{"conversationId":3,"userId":5,"isTyping":true}}"#)
            .await;

        assert!(drain(&mut ada_rx).is_empty());
        assert_eq!(drain(&mut grace_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_over_socket() {
        let h = Harness::new().await;
        let (ada, mut ada_rx) = h.connect("ada").await;
        let (grace, mut grace_rx) = h.connect("grace").await;

        grace
            .handle_text(r#"{"event":"send_message","data":{"senderId":9,"receiverId":5,"content":"hey"}}"#)
            .await;
        let conversation_id = match drain(&mut grace_rx).as_slice() {
            [ServerEvent::MessageSent(p)] => p.message.message.conversation_id,
            other => panic!("Expected MessageSent, got {:?}", other),
        };

        let join = format!(r#"{{"event":"join_conversation","data":{}}}"#, conversation_id);
        ada.handle_text(&join).await;
        grace.handle_text(&join).await;

        let read = format!(
            r#"{{"event":"mark_read","data":{{"conversationId":{},"userId":5}}}}"#,
            conversation_id
        );
        ada.handle_text(&read).await;

        assert!(drain(&mut ada_rx).is_empty());
        assert!(matches!(
            drain(&mut grace_rx).as_slice(),
            [ServerEvent::MessagesRead(_)]
        ));
        assert_eq!(
            h.repository.unread_count(conversation_id, 5).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_mark_read_unknown_conversation_is_an_error_event() {
        let h = Harness::new().await;
        let (ada, mut rx) = h.connect("ada").await;

        ada.handle_text(r#"{"event":"mark_read","data":{"conversationId":77,"userId":5}}"#)
            .await;

        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::Error(_)]));
    }
}
