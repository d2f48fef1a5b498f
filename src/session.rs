use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::{error::ChatError, log::Message, registry::Conversation};

pub type SessionId = u64;

/// One participant's live attachment to a conversation: the handle the
/// transport layer uses to send, read history, receive deliveries, and
/// leave. Deliveries arrive in conversation order on a bounded channel;
/// a handle that stops draining it is evicted by the router.
///
/// Dropping a handle without calling [`leave`](Self::leave) is safe; the
/// session is then evicted on the next delivery attempt.
pub struct SessionHandle {
    session_id: SessionId,
    participant: String,
    conversation: Arc<Conversation>,
    deliveries: mpsc::Receiver<Arc<Message>>,
    left: bool,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("participant", &self.participant)
            .field("left", &self.left)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        participant: String,
        conversation: Arc<Conversation>,
        deliveries: mpsc::Receiver<Arc<Message>>,
    ) -> Self {
        Self {
            session_id,
            participant,
            conversation,
            deliveries,
            left: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation.id()
    }

    /// Appends a message to the conversation on this participant's behalf.
    /// By the time this returns, delivery to every live subscriber (this
    /// session included) has been enqueued.
    pub async fn send(&self, body: String) -> Result<Arc<Message>, ChatError> {
        if self.left {
            return Err(ChatError::NotConnected);
        }
        self.conversation.publish(&self.participant, body).await
    }

    /// Formatted history snapshot, oldest first, reflecting every message
    /// accepted up to the moment of the call.
    pub async fn history(&self) -> Result<Vec<String>, ChatError> {
        if self.left {
            return Err(ChatError::NotConnected);
        }
        let messages = self.conversation.history().await?;
        Ok(messages.iter().map(Message::formatted).collect())
    }

    /// Next message delivered to this session, in conversation order.
    /// Returns `None` once the session has left or been evicted and the
    /// buffered deliveries are drained.
    pub async fn next_delivery(&mut self) -> Option<Arc<Message>> {
        self.deliveries.recv().await
    }

    /// Detaches this session from its conversation. Idempotent; calling it
    /// again (or on an evicted session) is a no-op.
    pub async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;

        if self.conversation.remove_subscriber(self.session_id).await {
            debug!(
                session_id = self.session_id,
                conversation = self.conversation.id(),
                participant = %self.participant,
                "session left"
            );
        }
        self.deliveries.close();
    }
}
