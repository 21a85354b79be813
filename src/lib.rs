//! Admission policy and lifecycle core for an SMTP/LMTP front end.
//!
//! The protocol engine asks a [`PolicyResolver`](policy::PolicyResolver) at
//! each checkpoint (authenticate, connect, mail-from, rcpt-to) whether to
//! continue, and hands completed messages to [`Server::receive`](server::Server::receive).
//! The [`Server`](server::Server) owns configuration, the built-in stores and
//! the listener lifecycle, and reports what happens through an
//! [`EventSink`](events::EventSink).

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod policy;
pub mod server;
pub mod session;
pub mod status;
pub mod store;

pub use tracing;

pub use self::error::{Error, Result};
