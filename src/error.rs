use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to participants of a conversation.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Construction input was rejected before any connection attempt.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted outside the connected state.
    #[error("not connected")]
    NotConnected,

    /// The conversation's storage rejected an append; nothing was written
    /// and no sequence number was consumed.
    #[error("conversation unavailable: {0}")]
    ConversationUnavailable(String),

    /// The underlying connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent a frame that does not fit the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ChatError {
    /// Kind tag used when this error crosses the wire.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            ChatError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ChatError::NotConnected => ErrorKind::NotConnected,
            ChatError::ConversationUnavailable(_) => ErrorKind::ConversationUnavailable,
            ChatError::Transport(_) | ChatError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Rebuilds the error a server reported in an error frame.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidArgument => ChatError::InvalidArgument(message),
            ErrorKind::NotConnected => ChatError::NotConnected,
            ErrorKind::ConversationUnavailable => ChatError::ConversationUnavailable(message),
            ErrorKind::Protocol => ChatError::Protocol(message),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::ConversationUnavailable(err.to_string())
    }
}

/// Error kinds carried inside wire-level error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotConnected,
    ConversationUnavailable,
    Protocol,
}

/// Failure reported by a message store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage write failed: {0}")]
    WriteFailed(String),
    #[error("storage read failed: {0}")]
    ReadFailed(String),
}
