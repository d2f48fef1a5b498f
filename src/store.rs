use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{error::StoreError, log::Message};

/// Where accepted messages live. Implementations must make `append`
/// all-or-nothing: a failed write leaves no trace of the message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists one message at the end of its conversation's history.
    async fn append(&self, message: &Message) -> Result<(), StoreError>;

    /// Returns every stored message for the conversation, oldest first,
    /// as a point-in-time snapshot.
    async fn read_all(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// Keeps each conversation's messages in process memory. Reads clone the
/// conversation's history under the lock, so a snapshot never observes a
/// half-written message.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append(&self, message: &Message) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn read_all(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
