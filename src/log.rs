use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{error::ChatError, store::MessageStore};

/// One accepted chat message. `sequence` is the sole ordering key: gapless
/// and strictly increasing within a conversation, starting at 0. Body and
/// sender are immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sequence: u64,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub accepted_at: DateTime<Utc>,
}

impl Message {
    /// Renders the payload participants see for this message.
    pub fn formatted(&self) -> String {
        format!("{}: {}", self.sender_id, self.body)
    }
}

/// Append-only message sequence for one conversation; the single source of
/// truth for ordering and history.
///
/// Sequence assignment and persistence happen atomically under an internal
/// lock, so the log upholds its ordering invariant regardless of how many
/// tasks append to it. Reads go straight to the store's snapshot and never
/// wait behind an in-flight append.
pub struct ConversationLog {
    conversation_id: String,
    store: Arc<dyn MessageStore>,
    next_sequence: Mutex<u64>,
}

impl ConversationLog {
    pub fn new(conversation_id: String, store: Arc<dyn MessageStore>) -> Self {
        Self {
            conversation_id,
            store,
            next_sequence: Mutex::new(0),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Assigns the next sequence number and persists the message before
    /// returning it. A failed write consumes no sequence number and leaves
    /// the log unchanged, so sequences stay gapless.
    pub async fn append(&self, sender_id: &str, body: String) -> Result<Message, ChatError> {
        let mut next_sequence = self.next_sequence.lock().await;
        let message = Message {
            sequence: *next_sequence,
            conversation_id: self.conversation_id.clone(),
            sender_id: sender_id.to_string(),
            body,
            accepted_at: Utc::now(),
        };

        self.store.append(&message).await?;
        *next_sequence += 1;
        Ok(message)
    }

    /// Point-in-time snapshot of every accepted message, oldest first.
    pub async fn read_all(&self) -> Result<Vec<Message>, ChatError> {
        Ok(self.store.read_all(&self.conversation_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{InMemoryStore, testing::FaultyStore};

    use super::*;

    fn in_memory_log(conversation_id: &str) -> ConversationLog {
        ConversationLog::new(conversation_id.to_string(), Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn sequences_start_at_zero_and_increment() {
        let log = in_memory_log("general");

        let first = log.append("alice", "hello".into()).await.expect("append");
        let second = log.append("bob", "hi".into()).await.expect("append");

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }

    #[tokio::test]
    async fn read_all_preserves_append_order() {
        let log = in_memory_log("general");
        log.append("alice", "one".into()).await.expect("append");
        log.append("bob", "two".into()).await.expect("append");
        log.append("alice", "three".into()).await.expect("append");

        let history = log.read_all().await.expect("read history");
        let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn failed_append_consumes_no_sequence_number() {
        let store = Arc::new(FaultyStore::new());
        let log = ConversationLog::new("general".to_string(), store.clone());

        log.append("alice", "kept".into()).await.expect("append");

        store.fail_writes(true);
        let err = log
            .append("alice", "rejected".into())
            .await
            .expect_err("append should fail");
        assert!(matches!(err, ChatError::ConversationUnavailable(_)));

        store.fail_writes(false);
        let recovered = log.append("alice", "next".into()).await.expect("append");
        assert_eq!(recovered.sequence, 1);

        let history = log.read_all().await.expect("read history");
        let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["kept", "next"]);
    }

    #[tokio::test]
    async fn empty_bodies_are_accepted() {
        let log = in_memory_log("general");
        let message = log.append("alice", String::new()).await.expect("append");
        assert_eq!(message.body, "");
        assert_eq!(message.formatted(), "alice: ");
    }

    #[test]
    fn formatted_uses_sender_and_body() {
        let message = Message {
            sequence: 3,
            conversation_id: "general".into(),
            sender_id: "alice".into(),
            body: "Hello Bob".into(),
            accepted_at: Utc::now(),
        };
        assert_eq!(message.formatted(), "alice: Hello Bob");
    }
}
