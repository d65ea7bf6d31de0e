//! Fan-out Broadcaster
//!
//! Picks the live connections an event concerns and enqueues it on each one
//! without waiting. A full or closed queue is logged and counted; it never
//! reaches the write path that triggered the event.

use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::metrics::ServerMetrics;
use crate::models::{ConversationId, MessageView, UserId};

use super::protocol::{MessagesReadPayload, ServerEvent, UserTypingPayload};
use super::registry::{SessionRegistry, Target};

pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send a newly persisted message to the receiver's personal room and to every
    /// subscriber of its conversation. A connection in both gets it twice; clients
    /// de-duplicate by message id.
    pub async fn notify_new_message(&self, view: &MessageView) -> usize {
        let message = &view.message;
        let mut targets = self.registry.user_targets(message.receiver_id).await;
        targets.extend(
            self.registry
                .conversation_targets(message.conversation_id)
                .await,
        );

        if targets.is_empty() {
            debug!(
                message_id = message.id,
                receiver_id = message.receiver_id,
                "No live connection for new message"
            );
            return 0;
        }

        self.deliver(targets, ServerEvent::NewMessage(view.clone()), None)
    }

    /// Tell the conversation's subscribers that `reader_id` has read it. The
    /// connection that issued the read, if any, is skipped.
    pub async fn notify_messages_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        origin: Option<&str>,
    ) -> usize {
        let targets = self.registry.conversation_targets(conversation_id).await;
        let event = ServerEvent::MessagesRead(MessagesReadPayload {
            conversation_id,
            user_id: reader_id,
        });
        self.deliver(targets, event, origin)
    }

    /// Advisory typing indicator for the conversation's other subscribers.
    pub async fn notify_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
        origin: Option<&str>,
    ) -> usize {
        let targets = self.registry.conversation_targets(conversation_id).await;
        let event = ServerEvent::UserTyping(UserTypingPayload { user_id, is_typing });
        self.deliver(targets, event, origin)
    }

    /// Enqueue `event` on every target except `exclude`. Returns how many accepted it.
    fn deliver(&self, targets: Vec<Target>, event: ServerEvent, exclude: Option<&str>) -> usize {
        let mut delivered = 0;
        for target in targets {
            if exclude == Some(target.conn_id.as_str()) {
                continue;
            }
            match target.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.event_delivered();
                }
                Err(e) => {
                    let reason = match e {
                        TrySendError::Full(_) => "outbound queue full",
                        TrySendError::Closed(_) => "connection closed",
                    };
                    let failure = ChatError::TransientDeliveryFailure {
                        conn_id: target.conn_id,
                        reason: reason.to_string(),
                    };
                    warn!(event = event.name(), "{}", failure);
                    self.metrics.event_dropped();
                }
            }
        }
        delivered
    }
}
