//! Multi-client file and message exchange over a line-based TCP protocol.
//!
//! Peers connect, register a handle, and then issue `/verb arg ...` commands
//! to upload files into a shared directory, download them back, list the
//! directory, and send broadcast or direct messages to other registered
//! peers. Each module owns one responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`protocol`] holds the command grammar, the response texts, and the
//!   newline framing helpers shared by both sides.
//! - [`registry`] maps registered handles to the sessions that own them.
//! - [`store`] implements the shared file directory and per-handle client
//!   areas used by `/store` and `/get`.
//! - [`session`] drives one accepted connection and owns its serialized
//!   writer ([`session::Outbox`]).
//! - [`dispatcher`] executes parsed commands against the registry and store.
//! - [`listener`] accepts TCP connections and spawns one session per peer.
//! - [`client`] keeps a single outbound connection alive, reconnecting with a
//!   fixed backoff whenever the link drops.

pub mod cli;
pub mod client;
pub mod dispatcher;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
