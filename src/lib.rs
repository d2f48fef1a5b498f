//! Conversation-based chat service with strict per-conversation ordering.
//!
//! Any number of named participants join a conversation by id, exchange
//! messages over persistent TCP connections, and can read the full history
//! in the exact order messages were accepted. Each module covers one
//! responsibility:
//!
//! - [`registry`] maps conversation ids to their logs and live subscriber
//!   sets; conversations are created lazily on first join.
//! - [`log`] assigns each accepted message its gapless sequence number and
//!   persists it through the [`store`] port.
//! - [`router`] fans an accepted message out to every subscriber without
//!   ever waiting on a slow one.
//! - [`session`] is the handle binding one participant to one
//!   conversation: send, history, deliveries, leave.
//! - [`server`] runs the TCP accept loop and the per-connection frame
//!   loop; [`protocol`] defines the JSON line frames it speaks.
//! - [`client`] is the participant-side facade plus the interactive
//!   terminal client; [`cli`] parses the command line for both modes.
//!
//! Integration tests use this crate directly to exercise the registry,
//! the wire protocol, and the facade.

pub mod cli;
pub mod client;
pub mod error;
pub mod log;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
