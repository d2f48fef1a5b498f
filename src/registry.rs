use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

use crate::{
    error::ChatError,
    log::{ConversationLog, Message},
    protocol::MAX_BODY_LEN,
    router::{self, DELIVERY_BUFFER},
    session::{SessionHandle, SessionId},
    store::{InMemoryStore, MessageStore},
};

/// Maps conversation ids to their logs and live subscriber sets.
///
/// The registry is an owned value rather than process-global state, so any
/// number of independent service instances can coexist. Conversations are
/// created lazily on first join and live for the registry's lifetime; a
/// conversation whose last subscriber leaves keeps its history.
pub struct ConversationRegistry {
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
    next_session_id: AtomicU64,
    store: Arc<dyn MessageStore>,
}

impl ConversationRegistry {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            store,
        }
    }

    /// Registry backed by the in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Attaches a new session to `conversation_id` under `display_name`,
    /// creating the conversation if this is its first reference. The
    /// session receives every message accepted after this call returns,
    /// never earlier ones. Display names are not deduplicated; two live
    /// sessions may share one.
    pub async fn join(
        &self,
        conversation_id: &str,
        display_name: &str,
    ) -> Result<SessionHandle, ChatError> {
        validate_join_args(display_name, conversation_id)?;

        let conversation = {
            // The exclusive map lock makes lazy creation race-free: two
            // simultaneous first-joiners always end up in the same
            // conversation.
            let mut conversations = self.conversations.write().await;
            let conversation = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| {
                    debug!(conversation = conversation_id, "creating conversation");
                    Arc::new(Conversation::new(
                        conversation_id.to_string(),
                        Arc::clone(&self.store),
                    ))
                });
            Arc::clone(conversation)
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_BUFFER);
        conversation.add_subscriber(session_id, delivery_tx).await;

        debug!(
            conversation = conversation_id,
            participant = display_name,
            session_id,
            "session joined"
        );

        Ok(SessionHandle::new(
            session_id,
            display_name.to_string(),
            conversation,
            delivery_rx,
        ))
    }
}

/// Rejects empty (or whitespace-only) identities. Accepted values are
/// stored verbatim.
pub(crate) fn validate_join_args(
    display_name: &str,
    conversation_id: &str,
) -> Result<(), ChatError> {
    if display_name.trim().is_empty() {
        return Err(ChatError::InvalidArgument(
            "display name cannot be empty".to_string(),
        ));
    }
    if conversation_id.trim().is_empty() {
        return Err(ChatError::InvalidArgument(
            "conversation id cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// One conversation: its append-only log plus the sessions currently
/// receiving deliveries.
pub(crate) struct Conversation {
    log: ConversationLog,
    subscribers: Mutex<HashMap<SessionId, mpsc::Sender<Arc<Message>>>>,
}

impl Conversation {
    fn new(conversation_id: String, store: Arc<dyn MessageStore>) -> Self {
        Self {
            log: ConversationLog::new(conversation_id, store),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.log.conversation_id()
    }

    /// Appends the message and enqueues delivery to every live subscriber.
    /// The subscriber lock is held across both steps, so a join or leave
    /// lands either fully before or fully after each message; no message is
    /// ever delivered to a subscriber set determined mid-append.
    ///
    /// Subscribers whose delivery channel is gone or full are evicted here;
    /// their failure never rolls back the append or delivery to the rest.
    pub(crate) async fn publish(
        &self,
        sender_id: &str,
        body: String,
    ) -> Result<Arc<Message>, ChatError> {
        if body.len() > MAX_BODY_LEN {
            return Err(ChatError::InvalidArgument(format!(
                "message body exceeds {MAX_BODY_LEN} bytes"
            )));
        }

        let mut subscribers = self.subscribers.lock().await;
        let message = Arc::new(self.log.append(sender_id, body).await?);

        for session_id in router::deliver(&message, &subscribers) {
            subscribers.remove(&session_id);
            debug!(
                conversation = self.id(),
                session_id, "evicted unreachable session"
            );
        }

        Ok(message)
    }

    /// Snapshot of the conversation's history; runs concurrently with
    /// appends and joins.
    pub(crate) async fn history(&self) -> Result<Vec<Message>, ChatError> {
        self.log.read_all().await
    }

    pub(crate) async fn add_subscriber(
        &self,
        session_id: SessionId,
        delivery_tx: mpsc::Sender<Arc<Message>>,
    ) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.insert(session_id, delivery_tx);
    }

    /// Returns whether the session was still subscribed.
    pub(crate) async fn remove_subscriber(&self, session_id: SessionId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.remove(&session_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::testing::FaultyStore;

    use super::*;

    #[tokio::test]
    async fn join_rejects_empty_identities() {
        let registry = ConversationRegistry::in_memory();

        for (conversation, name) in [("general", ""), ("general", "   "), ("", "alice")] {
            let err = registry
                .join(conversation, name)
                .await
                .expect_err("join should fail");
            assert!(matches!(err, ChatError::InvalidArgument(_)));
        }

        assert!(registry.conversations.read().await.is_empty());
    }

    #[tokio::test]
    async fn join_creates_the_conversation_lazily() {
        let registry = ConversationRegistry::in_memory();
        assert!(registry.conversations.read().await.is_empty());

        let _alice = registry.join("general", "alice").await.expect("join");
        let _bob = registry.join("general", "bob").await.expect("join");

        let conversations = registry.conversations.read().await;
        assert_eq!(conversations.len(), 1);
        assert!(conversations.contains_key("general"));
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_including_the_sender() {
        let registry = ConversationRegistry::in_memory();
        let mut alice = registry.join("general", "alice").await.expect("join");
        let mut bob = registry.join("general", "bob").await.expect("join");

        alice.send("Hello Bob".into()).await.expect("send");

        let to_alice = alice.next_delivery().await.expect("alice delivery");
        let to_bob = bob.next_delivery().await.expect("bob delivery");
        assert_eq!(to_alice.formatted(), "alice: Hello Bob");
        assert_eq!(to_bob.formatted(), "alice: Hello Bob");
        assert_eq!(to_alice.sequence, 0);
        assert_eq!(to_bob.sequence, 0);
    }

    #[tokio::test]
    async fn join_is_not_retroactive() {
        let registry = ConversationRegistry::in_memory();
        let alice = registry.join("general", "alice").await.expect("join");

        alice.send("before bob".into()).await.expect("send");

        let mut bob = registry.join("general", "bob").await.expect("join");
        alice.send("after bob".into()).await.expect("send");

        let delivered = bob.next_delivery().await.expect("bob delivery");
        assert_eq!(delivered.body, "after bob");
        assert_eq!(delivered.sequence, 1);

        // The earlier message is still visible through history.
        let history = bob.history().await.expect("history");
        assert_eq!(history, ["alice: before bob", "alice: after bob"]);
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_stops_deliveries() {
        let registry = ConversationRegistry::in_memory();
        let mut alice = registry.join("general", "alice").await.expect("join");
        let bob = registry.join("general", "bob").await.expect("join");

        alice.leave().await;
        alice.leave().await;

        bob.send("anyone there?".into()).await.expect("send");
        assert!(alice.next_delivery().await.is_none());

        let err = alice
            .send("too late".into())
            .await
            .expect_err("send after leave should fail");
        assert!(matches!(err, ChatError::NotConnected));
        let err = alice
            .history()
            .await
            .expect_err("history after leave should fail");
        assert!(matches!(err, ChatError::NotConnected));
    }

    #[tokio::test]
    async fn conversation_outlives_its_last_subscriber() {
        let registry = ConversationRegistry::in_memory();

        let mut first = registry.join("general", "alice").await.expect("join");
        first.send("still here".into()).await.expect("send");
        first.leave().await;

        let again = registry.join("general", "alice").await.expect("rejoin");
        let history = again.history().await.expect("history");
        assert_eq!(history, ["alice: still here"]);

        let next = again.send("back again".into()).await.expect("send");
        assert_eq!(next.sequence, 1);
    }

    #[tokio::test]
    async fn conversations_do_not_share_messages() {
        let registry = ConversationRegistry::in_memory();
        let alice = registry.join("standup", "alice").await.expect("join");
        let mut bob = registry.join("random", "bob").await.expect("join");

        alice.send("standup only".into()).await.expect("send");
        let own = bob.send("random only".into()).await.expect("send");

        // Bob's first delivery is his own message with a fresh sequence.
        assert_eq!(own.sequence, 0);
        let delivered = bob.next_delivery().await.expect("bob delivery");
        assert_eq!(delivered.formatted(), "bob: random only");
        assert_eq!(bob.history().await.expect("history"), ["bob: random only"]);
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_before_the_log() {
        let registry = ConversationRegistry::in_memory();
        let alice = registry.join("general", "alice").await.expect("join");

        let err = alice
            .send("x".repeat(MAX_BODY_LEN + 1))
            .await
            .expect_err("oversized send should fail");
        assert!(matches!(err, ChatError::InvalidArgument(_)));

        // The rejected body consumed no sequence number.
        let accepted = alice.send("fits".into()).await.expect("send");
        assert_eq!(accepted.sequence, 0);
    }

    #[tokio::test]
    async fn failed_append_leaves_no_trace() {
        let store = Arc::new(FaultyStore::new());
        let registry = ConversationRegistry::new(store.clone());
        let sender = registry.join("general", "alice").await.expect("join");
        let mut observer = registry.join("general", "bob").await.expect("join");

        sender.send("kept".into()).await.expect("send");
        assert_eq!(
            observer.next_delivery().await.expect("delivery").body,
            "kept"
        );

        store.fail_writes(true);
        let err = sender
            .send("rejected".into())
            .await
            .expect_err("send should fail");
        assert!(matches!(err, ChatError::ConversationUnavailable(_)));

        store.fail_writes(false);
        let recovered = sender.send("next".into()).await.expect("send");
        assert_eq!(recovered.sequence, 1);

        // No delivery and no history entry exist for the failed send.
        assert_eq!(
            observer.next_delivery().await.expect("delivery").body,
            "next"
        );
        let history = sender.history().await.expect("history");
        assert_eq!(history, ["alice: kept", "alice: next"]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_stalling_the_rest() {
        let registry = ConversationRegistry::in_memory();
        let mut slow = registry.join("general", "slow").await.expect("join");
        let mut fast = registry.join("general", "fast").await.expect("join");

        // One message more than the stalled session's buffer can hold.
        for i in 0..=DELIVERY_BUFFER {
            fast.send(format!("message {i}")).await.expect("send");
            let delivered = fast.next_delivery().await.expect("fast delivery");
            assert_eq!(delivered.sequence, i as u64);
        }

        for i in 0..DELIVERY_BUFFER {
            let delivered = slow.next_delivery().await.expect("buffered delivery");
            assert_eq!(delivered.sequence, i as u64);
        }
        assert!(slow.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_sends_settle_into_one_gapless_order() {
        let registry = Arc::new(ConversationRegistry::in_memory());

        let mut senders = Vec::new();
        for name in ["alice", "bob"] {
            let registry = Arc::clone(&registry);
            senders.push(tokio::spawn(async move {
                let session = registry.join("general", name).await.expect("join");
                for i in 0..25 {
                    session.send(format!("{name} {i}")).await.expect("send");
                }
            }));
        }
        for sender in senders {
            sender.await.expect("sender task");
        }

        let conversation = {
            let conversations = registry.conversations.read().await;
            Arc::clone(conversations.get("general").expect("conversation exists"))
        };

        let first_read = conversation.history().await.expect("history");
        let sequences: Vec<u64> = first_read.iter().map(|m| m.sequence).collect();
        let expected: Vec<u64> = (0..50).collect();
        assert_eq!(sequences, expected);

        // Repeated reads observe the same total order.
        let second_read = conversation.history().await.expect("history");
        assert_eq!(first_read, second_read);
    }
}
