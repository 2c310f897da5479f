use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use std::{fmt, io};

use bitflags::bitflags;
use mio::event::{Event, Source as IoSource};
use mio::{Events, Interest, Poll, Token};

use crate::{LogLevel, Logger};

const EVENTS_CAPACITY: usize = 64;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

bitflags! {
	/// Socket conditions reported by a single poll iteration
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Readiness: u8 {
		const READABLE = 1;
		const WRITABLE = 1 << 1;
		const ERROR = 1 << 2;
		const HANGUP = 1 << 3;
	}
}

impl Readiness {
	fn from_event(event: &Event) -> Self {
		let mut out = Readiness::empty();
		out.set(Readiness::READABLE, event.is_readable());
		out.set(Readiness::WRITABLE, event.is_writable());
		out.set(Readiness::ERROR, event.is_error());
		out.set(Readiness::HANGUP, event.is_read_closed() || event.is_write_closed());
		out
	}
}

/// Receiver of readiness events for one registered socket.
///
/// Returning `false` removes the watch.
pub(crate) trait IoWatch {
	fn ready(&self, readiness: Readiness) -> bool;
}

/// Reactor step that is not driven by a socket.
///
/// `prepare()` tells whether the source has work, a prepared source makes the poll non-blocking and
/// gets exactly one `dispatch()` per iteration. Returning `false` from `dispatch()` detaches it.
pub(crate) trait Source {
	fn prepare(&self) -> bool;
	fn dispatch(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SourceId(u64);

struct ContextInner {
	poll: RefCell<Poll>,
	watches: RefCell<HashMap<Token, Rc<dyn IoWatch>>>,
	sources: RefCell<Vec<(SourceId, Rc<dyn Source>)>>,
	next_token: Cell<usize>,
	next_source: Cell<u64>,
	running: Cell<bool>,
	timeout: Cell<Duration>,
	logger: RefCell<Logger>,
}

/// Single-threaded event loop driving any number of [`Connection`](crate::Connection)s.
///
/// A `Context` is a cheap handle, cloning it gives another reference to the same loop. Every
/// connection gets its context explicitly in [`Connection::new()`](crate::Connection::new) so
/// separate contexts are completely isolated from each other.
///
/// This struct implements:
///
///   * `Clone` by sharing the underlying loop
///   * `Eq` by comparing internal pointers
#[derive(Clone)]
pub struct Context {
	inner: Rc<ContextInner>,
}

impl Context {
	/// Create a new event loop reporting its diagnostics to `logger`
	pub fn new(logger: Logger) -> Self {
		Self {
			inner: Rc::new(ContextInner {
				poll: RefCell::new(Poll::new().expect("Cannot create event loop poller")),
				watches: RefCell::new(HashMap::new()),
				sources: RefCell::new(Vec::new()),
				next_token: Cell::new(0),
				next_source: Cell::new(0),
				running: Cell::new(false),
				timeout: Cell::new(DEFAULT_TIMEOUT),
				logger: RefCell::new(logger),
			}),
		}
	}

	/// Shortcut to return a new context with default logger.
	///
	/// Equivalent to passing default logger to `Context` constructor.
	pub fn new_with_default_logger() -> Context {
		Context::new(Logger::default())
	}

	/// Shortcut to return a new context with null logger.
	///
	/// Equivalent to passing null logger to `Context` constructor.
	pub fn new_with_null_logger() -> Context {
		Context::new(Logger::new_null())
	}

	/// Maximum time a single iteration of [`run()`](Self::run) (and of the pumps inside the blocking
	/// connection methods) waits for readiness.
	///
	/// Default timeout is 1000ms
	pub fn set_timeout(&self, timeout: Duration) {
		self.inner.timeout.set(timeout)
	}

	pub fn timeout(&self) -> Duration {
		self.inner.timeout.get()
	}

	/// Perform one iteration of the loop: wait up to `timeout` for socket readiness, deliver socket
	/// events and then dispatch every prepared source once.
	pub fn run_once(&self, timeout: Duration) {
		let sources = self.inner.sources.borrow().clone();
		let timeout = if sources.iter().any(|(_, source)| source.prepare()) {
			Duration::ZERO
		} else {
			timeout
		};

		let mut events = Events::with_capacity(EVENTS_CAPACITY);
		let polled = self.inner.poll.borrow_mut().poll(&mut events, Some(timeout));
		if let Err(e) = polled {
			if e.kind() != io::ErrorKind::Interrupted {
				self.log(LogLevel::Error, "ctx", format_args!("Poll failed: {e}"));
			}
		}
		let ready: Vec<_> = events.iter().map(|e| (e.token(), Readiness::from_event(e))).collect();
		for (token, readiness) in ready {
			let watch = self.inner.watches.borrow().get(&token).cloned();
			if let Some(watch) = watch {
				if !watch.ready(readiness) {
					self.inner.watches.borrow_mut().remove(&token);
				}
			}
		}

		for (id, source) in sources {
			// the source could have been detached by a socket event or a previous source
			if !self.is_attached(id) {
				continue;
			}
			if source.prepare() && !source.dispatch() {
				self.detach_source(id);
			}
		}
	}

	/// Run the loop until [`stop()`](Self::stop) is called
	pub fn run(&self) {
		self.inner.running.set(true);
		while self.inner.running.get() {
			self.run_once(self.timeout());
		}
	}

	/// Make [`run()`](Self::run) return after the current iteration
	pub fn stop(&self) {
		self.inner.running.set(false)
	}

	pub(crate) fn log(&self, level: LogLevel, area: &str, msg: fmt::Arguments) {
		// a logger callback that logs again through the same context is silenced
		if let Ok(mut logger) = self.inner.logger.try_borrow_mut() {
			logger.log(level, area, msg);
		}
	}

	pub(crate) fn register_io<S: IoSource + ?Sized>(&self, io: &mut S, watch: Rc<dyn IoWatch>) -> io::Result<Token> {
		let token = Token(self.inner.next_token.get());
		self.inner.next_token.set(token.0 + 1);
		self
			.inner
			.poll
			.borrow()
			.registry()
			.register(io, token, Interest::READABLE | Interest::WRITABLE)?;
		self.inner.watches.borrow_mut().insert(token, watch);
		Ok(token)
	}

	pub(crate) fn deregister_io<S: IoSource + ?Sized>(&self, io: &mut S, token: Token) {
		self.inner.watches.borrow_mut().remove(&token);
		if let Err(e) = self.inner.poll.borrow().registry().deregister(io) {
			self.log(LogLevel::Warn, "ctx", format_args!("Cannot deregister socket: {e}"));
		}
	}

	pub(crate) fn attach_source(&self, source: Rc<dyn Source>) -> SourceId {
		let id = SourceId(self.inner.next_source.get());
		self.inner.next_source.set(id.0 + 1);
		self.inner.sources.borrow_mut().push((id, source));
		id
	}

	pub(crate) fn detach_source(&self, id: SourceId) {
		self.inner.sources.borrow_mut().retain(|(source_id, _)| *source_id != id);
	}

	pub(crate) fn is_attached(&self, id: SourceId) -> bool {
		self.inner.sources.borrow().iter().any(|(source_id, _)| *source_id == id)
	}
}

impl PartialEq for Context {
	fn eq(&self, other: &Context) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Context {}

impl fmt::Debug for Context {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Context")
			.field("watches", &self.inner.watches.borrow().len())
			.field("sources", &self.inner.sources.borrow().len())
			.field("timeout", &self.inner.timeout.get())
			.finish()
	}
}
