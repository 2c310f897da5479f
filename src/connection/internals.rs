use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mio::Token;
use mio::net::TcpStream;

use crate::context::{IoWatch, Readiness, Source, SourceId};
use crate::error::{EmptyResult, Error, Result};
use crate::parser::Parser;
use crate::{
	Connection, ConnectionFlags, Context, DEFAULT_PORT, DisconnectReason, HandlerPriority, HandlerResult, LogLevel, MessageHandler,
	Stanza, StanzaType,
};

pub const IN_BUFFER_SIZE: usize = 1024;
pub const XML_DECLARATION: &str = "<?xml version='1.0' encoding='UTF-8'?>";
pub const STREAM_CLOSE: &str = "</stream:stream>";
/// Longest time a single write may block while output is flushed on close
pub const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub type ResultCallback = dyn FnOnce(&Connection, bool);
pub type DisconnectCallback = dyn FnMut(&Connection, DisconnectReason);

/// Stanza delivered to a blocking call, `None` while it is still awaited
pub type WaitSlot = Option<Stanza>;

pub struct Socket {
	pub stream: TcpStream,
	/// Second handle to the same socket, switched to blocking mode for the final flush
	pub handle: net::TcpStream,
	pub token: Token,
	pub outgoing: Vec<u8>,
}

pub struct State {
	pub server: Option<String>,
	pub port: u16,
	pub flags: ConnectionFlags,
	pub is_authenticated: bool,
	pub stream_id: Option<String>,
	/// Present exactly while the connection is open
	pub socket: Option<Socket>,
	pub incoming: VecDeque<Stanza>,
	pub source: Option<SourceId>,
	pub dispatch_holds: usize,
	pub stream_waiter: Option<WaitSlot>,
	pub reply_waiters: HashMap<String, WaitSlot>,
}

impl State {
	fn new(server: Option<&str>) -> Self {
		Self {
			server: server.map(str::to_owned),
			port: DEFAULT_PORT,
			flags: ConnectionFlags::empty(),
			is_authenticated: false,
			stream_id: None,
			socket: None,
			incoming: VecDeque::new(),
			source: None,
			dispatch_holds: 0,
			stream_waiter: None,
			reply_waiters: HashMap::new(),
		}
	}
}

pub struct HandlerEntry {
	pub handler: MessageHandler,
	pub priority: HandlerPriority,
}

#[derive(Default)]
pub struct Handlers {
	/// One-shot handlers keyed by the id of the request they answer
	pub id: HashMap<String, MessageHandler>,
	/// Per-type chains sorted by descending priority
	pub typed: HashMap<StanzaType, Vec<HandlerEntry>>,
}

impl Handlers {
	/// Inserts after every entry of higher or equal priority
	pub fn insert(&mut self, typ: StanzaType, handler: MessageHandler, priority: HandlerPriority) {
		let chain = self.typed.entry(typ).or_default();
		let pos = chain
			.iter()
			.position(|entry| entry.priority < priority)
			.unwrap_or(chain.len());
		chain.insert(pos, HandlerEntry { handler, priority });
	}

	pub fn remove(&mut self, typ: StanzaType, handler: &MessageHandler) -> bool {
		let Some(chain) = self.typed.get_mut(&typ) else {
			return false;
		};
		match chain.iter().position(|entry| entry.handler == *handler) {
			Some(pos) => {
				chain.remove(pos);
				true
			}
			None => false,
		}
	}

	pub fn chain(&self, typ: StanzaType) -> Vec<MessageHandler> {
		self
			.typed
			.get(&typ)
			.map(|chain| chain.iter().map(|entry| entry.handler.clone()).collect())
			.unwrap_or_default()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
	Open,
	Close,
	Auth,
	Register,
}

#[derive(Default)]
pub struct Callbacks {
	pub open: Option<Box<ResultCallback>>,
	pub close: Option<Box<ResultCallback>>,
	pub auth: Option<Box<ResultCallback>>,
	pub register: Option<Box<ResultCallback>>,
	pub disconnect: Option<Box<DisconnectCallback>>,
}

impl Callbacks {
	fn slot_mut(&mut self, slot: Slot) -> &mut Option<Box<ResultCallback>> {
		match slot {
			Slot::Open => &mut self.open,
			Slot::Close => &mut self.close,
			Slot::Auth => &mut self.auth,
			Slot::Register => &mut self.register,
		}
	}
}

fn set_or_unset<T>(value: &Option<T>) -> &'static str {
	if value.is_some() { "set" } else { "unset" }
}

impl fmt::Debug for Callbacks {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Callbacks")
			.field("open", &set_or_unset(&self.open))
			.field("close", &set_or_unset(&self.close))
			.field("auth", &set_or_unset(&self.auth))
			.field("register", &set_or_unset(&self.register))
			.field("disconnect", &set_or_unset(&self.disconnect))
			.finish()
	}
}

pub struct ConnectionInner {
	pub ctx: Context,
	pub state: RefCell<State>,
	pub parser: RefCell<Parser>,
	pub handlers: RefCell<Handlers>,
	pub callbacks: RefCell<Callbacks>,
}

impl ConnectionInner {
	pub fn new(ctx: &Context, server: Option<&str>) -> Self {
		Self {
			ctx: ctx.clone(),
			state: RefCell::new(State::new(server)),
			parser: RefCell::new(Parser::new()),
			handlers: RefCell::new(Handlers::default()),
			callbacks: RefCell::new(Callbacks::default()),
		}
	}
}

impl Drop for ConnectionInner {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		if let Some(mut socket) = state.socket.take() {
			self.ctx.deregister_io(&mut socket.stream, socket.token);
		}
		if let Some(id) = state.source.take() {
			self.ctx.detach_source(id);
		}
	}
}

/// Dispatch step of the incoming queue, pops one stanza per iteration
struct IncomingSource {
	conn: Weak<ConnectionInner>,
}

impl Source for IncomingSource {
	fn prepare(&self) -> bool {
		self
			.conn
			.upgrade()
			.is_some_and(|inner| !inner.state.borrow().incoming.is_empty())
	}

	fn dispatch(&self) -> bool {
		let Some(inner) = self.conn.upgrade() else {
			return false;
		};
		let conn = Connection::from_inner(inner);
		let stanza = conn.inner.state.borrow_mut().incoming.pop_front();
		if let Some(stanza) = stanza {
			conn.handle_stanza(&stanza);
		}
		true
	}
}

struct SocketWatch {
	conn: Weak<ConnectionInner>,
}

impl IoWatch for SocketWatch {
	fn ready(&self, readiness: Readiness) -> bool {
		match self.conn.upgrade() {
			Some(inner) => Connection::from_inner(inner).io_event(readiness),
			None => false,
		}
	}
}

fn flush_socket(socket: &mut Socket) -> io::Result<()> {
	while !socket.outgoing.is_empty() {
		match socket.stream.write(&socket.outgoing) {
			Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
			Ok(written) => {
				socket.outgoing.drain(..written);
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
	}
	Ok(())
}

fn connect_any(addrs: Vec<SocketAddr>) -> io::Result<net::TcpStream> {
	let mut last_error = io::Error::from(io::ErrorKind::AddrNotAvailable);
	for addr in addrs {
		match net::TcpStream::connect(addr) {
			Ok(stream) => return Ok(stream),
			Err(e) => last_error = e,
		}
	}
	Err(last_error)
}

/// Fresh correlation id
pub fn generate_id() -> String {
	format!("msg_{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Return the stanza id, assigning a generated one if it has none
pub fn ensure_id(stanza: &mut Stanza) -> Result<String> {
	if let Some(id) = stanza.id() {
		return Ok(id.to_owned());
	}
	let id = generate_id();
	stanza.set_id(&id)?;
	Ok(id)
}

impl Connection {
	pub(crate) fn log(&self, level: LogLevel, msg: fmt::Arguments) {
		self.inner.ctx.log(level, "conn", msg);
	}

	pub(crate) fn incoming_source(&self) -> Rc<dyn Source> {
		Rc::new(IncomingSource {
			conn: Rc::downgrade(&self.inner),
		})
	}

	pub(crate) fn add_id_handler(&self, id: &str, handler: &MessageHandler) {
		self.inner.handlers.borrow_mut().id.insert(id.to_owned(), handler.clone());
	}

	pub(crate) fn set_callback(&self, slot: Slot, callback: Box<ResultCallback>) {
		*self.inner.callbacks.borrow_mut().slot_mut(slot) = Some(callback);
	}

	pub(crate) fn clear_callback(&self, slot: Slot) {
		let callback = self.inner.callbacks.borrow_mut().slot_mut(slot).take();
		drop(callback);
	}

	/// Consume the one-shot `slot`, the callback is free to set it again
	pub(crate) fn fire_callback(&self, slot: Slot, result: bool) {
		let callback = self.inner.callbacks.borrow_mut().slot_mut(slot).take();
		if let Some(callback) = callback {
			callback(self, result);
		}
	}

	pub(crate) fn signal_disconnect(&self, reason: DisconnectReason) {
		let callback = self.inner.callbacks.borrow_mut().disconnect.take();
		if let Some(mut callback) = callback {
			callback(self, reason);
			let mut callbacks = self.inner.callbacks.borrow_mut();
			// keep a replacement installed from inside the callback
			if callbacks.disconnect.is_none() {
				callbacks.disconnect = Some(callback);
			}
		}
	}

	/// Detach the dispatch source, holds nest
	pub(crate) fn hold_dispatch(&self) {
		let source = {
			let mut state = self.inner.state.borrow_mut();
			state.dispatch_holds += 1;
			if state.dispatch_holds == 1 { state.source.take() } else { None }
		};
		if let Some(id) = source {
			self.inner.ctx.detach_source(id);
		}
	}

	/// Recreate and attach the dispatch source when the last hold goes away
	pub(crate) fn release_dispatch(&self) {
		let attach = {
			let mut state = self.inner.state.borrow_mut();
			state.dispatch_holds = state.dispatch_holds.saturating_sub(1);
			state.dispatch_holds == 0 && state.source.is_none()
		};
		if attach {
			let id = self.inner.ctx.attach_source(self.incoming_source());
			self.inner.state.borrow_mut().source = Some(id);
		}
	}

	pub(crate) fn do_open(&self) -> EmptyResult {
		let (server, port) = {
			let state = self.inner.state.borrow();
			(state.server.clone().ok_or(Error::NoServerConfigured)?, state.port)
		};
		self.log(LogLevel::Info, format_args!("Connecting to: {server}:{port}"));

		let addrs: Vec<_> = (server.as_str(), port)
			.to_socket_addrs()
			.map_err(Error::AddressResolutionFailed)?
			.collect();
		if addrs.is_empty() {
			return Err(Error::AddressResolutionFailed(io::ErrorKind::NotFound.into()));
		}
		let stream = connect_any(addrs).map_err(Error::SocketConnectFailed)?;
		stream.set_nonblocking(true).map_err(Error::SocketConnectFailed)?;
		let handle = stream.try_clone().map_err(Error::SocketConnectFailed)?;
		let mut stream = TcpStream::from_std(stream);
		let watch = Rc::new(SocketWatch {
			conn: Rc::downgrade(&self.inner),
		});
		let token = self
			.inner
			.ctx
			.register_io(&mut stream, watch)
			.map_err(Error::SocketConnectFailed)?;

		{
			let mut state = self.inner.state.borrow_mut();
			state.socket = Some(Socket {
				stream,
				handle,
				token,
				outgoing: Vec::new(),
			});
			state.stream_id = None;
			state.is_authenticated = false;
		}
		self.inner.parser.borrow_mut().reset();
		self.send_raw(XML_DECLARATION)
	}

	/// Tear the socket down, returns whether there was one
	pub(crate) fn do_close(&self) -> bool {
		let socket = {
			let mut state = self.inner.state.borrow_mut();
			state.stream_id = None;
			state.is_authenticated = false;
			state.socket.take()
		};
		let Some(mut socket) = socket else {
			return false;
		};
		if !socket.outgoing.is_empty() {
			self.log(
				LogLevel::Warn,
				format_args!("Dropping {} unsent bytes", socket.outgoing.len()),
			);
		}
		self.inner.ctx.deregister_io(&mut socket.stream, socket.token);
		true
	}

	fn shutdown(&self, reason: DisconnectReason) {
		if self.do_close() {
			self.signal_disconnect(reason);
		}
	}

	pub(crate) fn write_bytes(&self, data: &[u8]) -> EmptyResult {
		let mut state = self.inner.state.borrow_mut();
		let Some(socket) = state.socket.as_mut() else {
			return Err(Error::NotOpen);
		};
		socket.outgoing.extend_from_slice(data);
		flush_socket(socket).map_err(Error::SendFailed)
	}

	/// Write out everything still buffered, blocking until the peer has taken it
	pub(crate) fn finish_output(&self) -> EmptyResult {
		let mut state = self.inner.state.borrow_mut();
		let Some(socket) = state.socket.as_mut() else {
			return Err(Error::NotOpen);
		};
		if socket.outgoing.is_empty() {
			return Ok(());
		}
		let pending = socket.outgoing.len();
		let written = socket
			.handle
			.set_nonblocking(false)
			.and_then(|_| socket.handle.set_write_timeout(Some(CLOSE_WRITE_TIMEOUT)))
			.and_then(|_| socket.handle.write_all(&socket.outgoing));
		if written.is_ok() {
			socket.outgoing.clear();
		}
		drop(state);
		written.map_err(Error::SendFailed)?;
		self.log(LogLevel::Debug, format_args!("Flushed {pending} buffered bytes"));
		Ok(())
	}

	fn flush_output(&self) -> io::Result<()> {
		let mut state = self.inner.state.borrow_mut();
		match state.socket.as_mut() {
			Some(socket) => flush_socket(socket),
			None => Ok(()),
		}
	}

	/// Drain the socket, the flag tells whether the peer closed its side
	fn read_available(&self) -> io::Result<(Vec<u8>, bool)> {
		let mut state = self.inner.state.borrow_mut();
		let Some(socket) = state.socket.as_mut() else {
			return Ok((Vec::new(), false));
		};
		let mut data = Vec::new();
		let mut buf = [0; IN_BUFFER_SIZE];
		loop {
			match socket.stream.read(&mut buf) {
				Ok(0) => return Ok((data, true)),
				Ok(read) => data.extend_from_slice(&buf[..read]),
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((data, false)),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			}
		}
	}

	pub(crate) fn io_event(&self, readiness: Readiness) -> bool {
		if readiness.contains(Readiness::ERROR) {
			self.log(LogLevel::Warn, format_args!("Error event on the socket"));
			self.shutdown(DisconnectReason::Error);
			return false;
		}
		let mut hangup = readiness.contains(Readiness::HANGUP);
		if readiness.contains(Readiness::READABLE) {
			match self.read_available() {
				Ok((data, eof)) => {
					hangup |= eof;
					if !data.is_empty() && !self.feed(&data) {
						return false;
					}
				}
				Err(e) => {
					self.log(LogLevel::Warn, format_args!("Read failed: {e}"));
					self.shutdown(DisconnectReason::Error);
					return false;
				}
			}
		}
		if hangup {
			self.log(LogLevel::Info, format_args!("HUP event"));
			self.shutdown(DisconnectReason::Hangup);
			return false;
		}
		if readiness.contains(Readiness::WRITABLE) {
			if let Err(e) = self.flush_output() {
				self.log(LogLevel::Warn, format_args!("Write failed: {e}"));
				self.shutdown(DisconnectReason::Error);
				return false;
			}
		}
		true
	}

	/// Run received bytes through the parser, returns `false` if the connection had to be closed
	pub(crate) fn feed(&self, data: &[u8]) -> bool {
		self.inner.ctx.log(
			LogLevel::Debug,
			"xmpp",
			format_args!("RECV: {}", String::from_utf8_lossy(data)),
		);
		let result = self
			.inner
			.parser
			.borrow_mut()
			.feed(data, |stanza| self.enqueue(stanza));
		if let Err(e) = result {
			self.log(LogLevel::Error, format_args!("Malformed XML from server: {e}"));
			self.shutdown(DisconnectReason::Error);
			return false;
		}
		true
	}

	/// Hand a parsed stanza to a waiting blocking call or append it to the incoming queue
	pub(crate) fn enqueue(&self, stanza: Stanza) {
		self.log(
			LogLevel::Debug,
			format_args!(
				"New stanza with type=\"{}\" from: {}",
				stanza.message_type().as_str(),
				stanza.from().unwrap_or("(none)"),
			),
		);
		let mut state = self.inner.state.borrow_mut();
		if stanza.message_type() == StanzaType::Stream {
			if let Some(slot) = state.stream_waiter.as_mut() {
				if slot.is_none() {
					*slot = Some(stanza);
					return;
				}
			}
		}
		if let Some(id) = stanza.id() {
			if let Some(slot) = state.reply_waiters.get_mut(id) {
				if slot.is_none() {
					*slot = Some(stanza);
					return;
				}
			}
		}
		state.incoming.push_back(stanza);
	}

	/// Pump the context until `take` yields a value. Fails with `NotOpen` if the connection goes
	/// down meanwhile.
	pub(crate) fn pump_until<T>(&self, mut take: impl FnMut(&mut State) -> Option<T>) -> Result<T> {
		loop {
			{
				let mut state = self.inner.state.borrow_mut();
				if let Some(out) = take(&mut *state) {
					return Ok(out);
				}
				if state.socket.is_none() {
					return Err(Error::NotOpen);
				}
			}
			self.inner.ctx.run_once(self.inner.ctx.timeout());
		}
	}

	pub(crate) fn handle_stanza(&self, stanza: &Stanza) {
		let typ = stanza.message_type();
		if typ == StanzaType::Stream {
			self.stream_received(stanza);
			return;
		}

		let mut result = HandlerResult::AllowMore;
		if let Some(id) = stanza.id() {
			let handler = self.inner.handlers.borrow_mut().id.remove(id);
			if let Some(handler) = handler {
				result = handler.handle(self, stanza);
			}
		}
		if result == HandlerResult::Consume {
			return;
		}

		let chain = self.inner.handlers.borrow().chain(typ);
		for handler in chain {
			if handler.handle(self, stanza) == HandlerResult::Consume {
				break;
			}
		}
	}

	fn stream_received(&self, stanza: &Stanza) {
		let id = stanza.id().map(str::to_owned);
		self.log(
			LogLevel::Info,
			format_args!("Stream received: {}", id.as_deref().unwrap_or("(no id)")),
		);
		{
			let mut state = self.inner.state.borrow_mut();
			if state.socket.is_some() {
				state.stream_id = id;
			}
		}
		self.fire_callback(Slot::Open, true);
	}
}
