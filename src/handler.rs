use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::{Connection, LogLevel, Stanza};

/// Verdict of a [`MessageHandler`] for the stanza it was given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
	/// Pass the stanza on to the next handler in the chain
	AllowMore,
	/// Stop routing this stanza
	Consume,
}

/// Position of a handler in the per-type chain, higher runs first.
///
/// Handlers registered with equal priority run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerPriority(pub i32);

impl HandlerPriority {
	pub const LAST: HandlerPriority = HandlerPriority(1);
	pub const NORMAL: HandlerPriority = HandlerPriority(2);
	pub const FIRST: HandlerPriority = HandlerPriority(3);
}

impl Default for HandlerPriority {
	fn default() -> Self {
		HandlerPriority::NORMAL
	}
}

impl From<i32> for HandlerPriority {
	fn from(priority: i32) -> Self {
		HandlerPriority(priority)
	}
}

/// Why the connection went down, passed to the disconnect callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
	/// [`Connection::close()`] was called
	Ok,
	/// The socket reported an error or the peer sent malformed XML
	Error,
	/// The peer closed the connection
	Hangup,
}

pub type HandlerCallback = dyn FnMut(&Connection, &Stanza) -> HandlerResult;

/// Shared handle to a stanza callback.
///
/// Cloning produces another reference to the same callback and the same identity, so a clone can be
/// used to [unregister](Connection::unregister_handler) the handler. The callback (together with
/// everything it captured) is dropped when the last reference goes away.
#[derive(Clone)]
pub struct MessageHandler {
	callback: Rc<RefCell<Box<HandlerCallback>>>,
}

impl MessageHandler {
	pub fn new<CB>(callback: CB) -> Self
	where
		CB: FnMut(&Connection, &Stanza) -> HandlerResult + 'static,
	{
		Self {
			callback: Rc::new(RefCell::new(Box::new(callback))),
		}
	}

	pub(crate) fn handle(&self, conn: &Connection, stanza: &Stanza) -> HandlerResult {
		match self.callback.try_borrow_mut() {
			Ok(mut callback) => callback(conn, stanza),
			Err(_) => {
				conn.context().log(
					LogLevel::Warn,
					"conn",
					format_args!("Handler re-entered while still running, skipping it for this stanza"),
				);
				HandlerResult::AllowMore
			}
		}
	}
}

impl PartialEq for MessageHandler {
	fn eq(&self, other: &MessageHandler) -> bool {
		Rc::ptr_eq(&self.callback, &other.callback)
	}
}

impl Eq for MessageHandler {}

impl fmt::Debug for MessageHandler {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("MessageHandler")
			.field("refs", &Rc::strong_count(&self.callback))
			.finish()
	}
}
