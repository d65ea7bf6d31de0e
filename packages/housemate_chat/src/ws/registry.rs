//! Session Registry
//!
//! Process-local index of live connections: which user each connection joined as,
//! and which conversations each connection is subscribed to. All indexes sit behind
//! one lock so a membership change is never half-applied.

use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::models::{ConversationId, UserId};

use super::protocol::ServerEvent;

pub type ConnectionId = String;

/// Outbound queue of one live connection.
pub type ConnectionSender = mpsc::Sender<ServerEvent>;

/// A connection picked as a fan-out target.
#[derive(Debug, Clone)]
pub struct Target {
    pub conn_id: ConnectionId,
    pub sender: ConnectionSender,
}

/// What a disconnect removed, for logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: Option<UserId>,
    pub conversations: Vec<ConversationId>,
}

#[derive(Default)]
struct Indexes {
    senders: HashMap<ConnectionId, ConnectionSender>,
    /// user → connections joined to that user's personal room
    users: HashMap<UserId, HashSet<ConnectionId>>,
    /// connection → the single user it joined as
    connection_user: HashMap<ConnectionId, UserId>,
    /// conversation → subscribed connections
    conversations: HashMap<ConversationId, HashSet<ConnectionId>>,
    /// connection → conversations it subscribed to
    connection_conversations: HashMap<ConnectionId, HashSet<ConversationId>>,
}

impl Indexes {
    fn targets<'a>(&self, ids: impl IntoIterator<Item = &'a ConnectionId>) -> Vec<Target> {
        ids.into_iter()
            .filter_map(|id| {
                self.senders.get(id).map(|sender| Target {
                    conn_id: id.clone(),
                    sender: sender.clone(),
                })
            })
            .collect()
    }

    fn detach_user(&mut self, conn_id: &str) -> Option<UserId> {
        let user_id = self.connection_user.remove(conn_id)?;
        if let Some(conns) = self.users.get_mut(&user_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                self.users.remove(&user_id);
            }
        }
        Some(user_id)
    }

    fn detach_conversation(&mut self, conn_id: &str, conversation_id: ConversationId) -> bool {
        let removed = match self.conversations.get_mut(&conversation_id) {
            Some(conns) => {
                let removed = conns.remove(conn_id);
                if conns.is_empty() {
                    self.conversations.remove(&conversation_id);
                }
                removed
            }
            None => false,
        };
        if let Some(joined) = self.connection_conversations.get_mut(conn_id) {
            joined.remove(&conversation_id);
            if joined.is_empty() {
                self.connection_conversations.remove(conn_id);
            }
        }
        removed
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Indexes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection. It belongs to no room until it joins one.
    pub async fn register(&self, conn_id: &str, sender: ConnectionSender) {
        let mut inner = self.inner.write().await;
        inner.senders.insert(conn_id.to_string(), sender);
    }

    /// Put the connection in `user_id`'s personal room. A connection belongs to at
    /// most one user, so joining as someone else moves it. Returns the user it was
    /// previously joined as, if that differs.
    pub async fn join(&self, conn_id: &str, user_id: UserId) -> Option<UserId> {
        let mut inner = self.inner.write().await;
        let previous = match inner.connection_user.get(conn_id) {
            Some(&current) if current == user_id => return None,
            Some(_) => inner.detach_user(conn_id),
            None => None,
        };
        inner
            .connection_user
            .insert(conn_id.to_string(), user_id);
        inner
            .users
            .entry(user_id)
            .or_default()
            .insert(conn_id.to_string());
        debug!(conn_id, user_id, "Joined user room");
        previous
    }

    /// Remove the connection from `user_id`'s room. No-op when it is not there.
    pub async fn leave(&self, conn_id: &str, user_id: UserId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.connection_user.get(conn_id) != Some(&user_id) {
            return false;
        }
        inner.detach_user(conn_id).is_some()
    }

    /// Subscribe the connection to a conversation. Returns false if it already was.
    pub async fn join_conversation(&self, conn_id: &str, conversation_id: ConversationId) -> bool {
        let mut inner = self.inner.write().await;
        inner
            .connection_conversations
            .entry(conn_id.to_string())
            .or_default()
            .insert(conversation_id);
        inner
            .conversations
            .entry(conversation_id)
            .or_default()
            .insert(conn_id.to_string())
    }

    pub async fn leave_conversation(&self, conn_id: &str, conversation_id: ConversationId) -> bool {
        let mut inner = self.inner.write().await;
        inner.detach_conversation(conn_id, conversation_id)
    }

    /// Drop every trace of the connection. Runs on transport loss whether or not the
    /// client left its rooms first.
    pub async fn disconnect(&self, conn_id: &str) -> Departure {
        let mut inner = self.inner.write().await;
        inner.senders.remove(conn_id);
        let user_id = inner.detach_user(conn_id);

        let mut conversations: Vec<ConversationId> = inner
            .connection_conversations
            .get(conn_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        conversations.sort_unstable();
        for conversation_id in &conversations {
            inner.detach_conversation(conn_id, *conversation_id);
        }

        Departure {
            user_id,
            conversations,
        }
    }

    /// Connections in the user's personal room.
    pub async fn user_targets(&self, user_id: UserId) -> Vec<Target> {
        let inner = self.inner.read().await;
        match inner.users.get(&user_id) {
            Some(conns) => inner.targets(conns),
            None => Vec::new(),
        }
    }

    /// Connections subscribed to the conversation.
    pub async fn conversation_targets(&self, conversation_id: ConversationId) -> Vec<Target> {
        let inner = self.inner.read().await;
        match inner.conversations.get(&conversation_id) {
            Some(conns) => inner.targets(conns),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub async fn user_of(&self, conn_id: &str) -> Option<UserId> {
        self.inner.read().await.connection_user.get(conn_id).copied()
    }

    #[cfg(test)]
    pub async fn conversations_of(&self, conn_id: &str) -> Vec<ConversationId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<ConversationId> = inner
            .connection_conversations
            .get(conn_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.senders.len()
    }

    pub async fn online_user_count(&self) -> usize {
        self.inner.read().await.users.len()
    }
}
