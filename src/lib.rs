//! # jabber-session - single-threaded XMPP client session
//!
//! This library implements the client side of an XMPP session over plain TCP: connection setup and
//! stream negotiation, an incremental stanza parser, per-type handler chains, request/reply
//! correlation by stanza id and the legacy `jabber:iq:auth` login.
//!
//!
//! # Workflow
//!
//! The topmost object is [`Context`]. It owns the event loop and the logger. A [`Connection`] is
//! created with a specific [`Context`] and only makes progress while that context is run, either by
//! [`Context::run()`] / [`Context::run_once()`] or by one of the blocking connection methods which
//! pump the context internally. A single [`Context`] can drive several [`Connection`]s, separate
//! contexts never interact.
//!
//! Logging goes through the [`log`] crate by default (provided the default `rust-log` feature is
//! enabled), see [`Logger`] for other options.
//!
//!
//! # Callbacks
//!
//! Callbacks are plain Rust closures owned by the library. Stanza handlers are wrapped in a
//! [`MessageHandler`] which is a shared handle: keep a clone around to unregister the handler later.
//! One-shot result callbacks (open, close, authentication, registration) are consumed by their first
//! invocation. Every callback receives the [`Connection`] it is invoked for so it's free to send
//! stanzas, register handlers or close the connection.
//!
//! Nothing here is `Send`, a context and its connections live on one thread.
//!
//!
//! # Examples
//! ```no_run
//! use jabber_session::{Connection, Context, HandlerPriority, HandlerResult, MessageHandler, StanzaType};
//!
//! let ctx = Context::new_with_default_logger();
//! let conn = Connection::new(&ctx, Some("localhost"));
//! conn.open_blocking().unwrap();
//! if conn.authenticate_blocking("user", "password", "bot").unwrap() {
//!    let echo = MessageHandler::new(|conn, stanza| {
//!       if let Some(body) = stanza.body() {
//!          let mut reply = stanza.reply();
//!          reply.set_body(body).unwrap();
//!          conn.send(&reply).unwrap();
//!       }
//!       HandlerResult::Consume
//!    });
//!    conn.register_handler(&echo, StanzaType::Message, HandlerPriority::NORMAL).unwrap();
//!    ctx.run();
//! }
//! ```
//!
//! For a more complete example see this crate `demos` directory.

use bitflags::bitflags;

pub use connection::Connection;
pub use context::{Context, Readiness};
pub use error::{EmptyResult, Error, ParseError, Result};
pub use handler::{DisconnectReason, HandlerCallback, HandlerPriority, HandlerResult, MessageHandler};
pub use logger::{LogCallback, LogLevel, Logger};
pub use parser::Parser;
pub use stanza::{Stanza, StanzaSubType, StanzaType};

pub mod auth;
mod connection;
mod context;
pub mod error;
mod handler;
mod logger;
mod parser;
mod stanza;
#[cfg(test)]
mod tests;

/// Stream namespace declared on the stream element
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
/// Default content namespace of a client stream
pub const NS_CLIENT: &str = "jabber:client";
pub const DEFAULT_PORT: u16 = 5222;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct ConnectionFlags: u32 {
		/// Ask for a TLS transport, not available in this implementation
		const USE_SSL = 1;
	}
}
