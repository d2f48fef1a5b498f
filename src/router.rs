use std::{collections::HashMap, sync::Arc};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{log::Message, session::SessionId};

/// How many undelivered messages one session may buffer before it is
/// considered unreachable and evicted.
pub const DELIVERY_BUFFER: usize = 128;

/// Enqueues `message` onto every subscriber's delivery channel exactly
/// once, the sender's own session included. Returns the sessions whose
/// channel was closed or full so the caller can drop them from the
/// subscriber set; a failed target never stops delivery to the rest.
///
/// Enqueueing never waits on a subscriber's transport, so one stalled
/// session cannot hold up the conversation.
pub fn deliver(
    message: &Arc<Message>,
    subscribers: &HashMap<SessionId, mpsc::Sender<Arc<Message>>>,
) -> Vec<SessionId> {
    let mut unreachable = Vec::new();
    for (&session_id, delivery_tx) in subscribers {
        match delivery_tx.try_send(Arc::clone(message)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id, "delivery buffer full; marking session unreachable");
                unreachable.push(session_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id, "delivery channel closed");
                unreachable.push(session_id);
            }
        }
    }
    unreachable
}
