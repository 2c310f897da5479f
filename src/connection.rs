use std::cell::Ref;
use std::fmt;
use std::rc::Rc;

use crate::auth;
use crate::error::{EmptyResult, Error, Result};
use crate::{
	ConnectionFlags, Context, DisconnectReason, HandlerPriority, HandlerResult, LogLevel, MessageHandler, Stanza, StanzaSubType,
	StanzaType,
};

use self::internals::{ConnectionInner, STREAM_CLOSE, Slot, State};

mod internals;

/// Client session with one server.
///
/// The connection is driven by the [`Context`] it was created with: socket reads, parsing and handler
/// dispatch only happen while that context is pumped via [`Context::run()`] or [`Context::run_once()`].
/// Received stanzas are queued and dispatched one per loop iteration in arrival order. Each stanza
/// first goes to the one-shot reply handler registered for its id (see
/// [`send_with_reply()`](Self::send_with_reply)), then to the handlers registered for its type in
/// descending priority until one of them returns [`HandlerResult::Consume`].
///
/// The blocking methods ([`open_blocking()`](Self::open_blocking),
/// [`send_with_reply_blocking()`](Self::send_with_reply_blocking),
/// [`authenticate_blocking()`](Self::authenticate_blocking)) pump the context themselves. While they
/// wait, the regular dispatch of this connection is paused: stanzas that are not the awaited answer
/// stay queued and are dispatched in order once the call returns.
///
/// This struct implements:
///
///   * `Clone` as another reference to the same session, the session is torn down when the last
///     reference is dropped (no disconnect callback is invoked in that case)
///   * `Eq` by comparing internal pointers
#[derive(Clone)]
pub struct Connection {
	inner: Rc<ConnectionInner>,
}

impl Connection {
	/// New closed connection attached to `ctx`, `server` can also be set later with
	/// [`set_server()`](Self::set_server)
	pub fn new(ctx: &Context, server: Option<&str>) -> Connection {
		let conn = Connection::from_inner(Rc::new(ConnectionInner::new(ctx, server)));
		let source = ctx.attach_source(conn.incoming_source());
		conn.inner.state.borrow_mut().source = Some(source);
		conn
	}

	fn from_inner(inner: Rc<ConnectionInner>) -> Connection {
		Connection { inner }
	}

	pub fn context(&self) -> &Context {
		&self.inner.ctx
	}

	fn state(&self) -> Ref<'_, State> {
		self.inner.state.borrow()
	}

	/// Apply `change` to the configuration, refused with a warning while the connection is open
	fn configure(&self, what: &str, change: impl FnOnce(&mut State)) {
		let mut state = self.inner.state.borrow_mut();
		if state.socket.is_some() {
			drop(state);
			self.log(LogLevel::Warn, format_args!("Can't change {what} while connected"));
			return;
		}
		change(&mut *state);
	}

	pub fn server(&self) -> Option<String> {
		self.state().server.clone()
	}

	pub fn set_server(&self, server: impl AsRef<str>) {
		let server = server.as_ref().to_owned();
		self.configure("server", |state| state.server = Some(server));
	}

	pub fn port(&self) -> u16 {
		self.state().port
	}

	pub fn set_port(&self, port: u16) {
		self.configure("port", |state| state.port = port);
	}

	pub fn flags(&self) -> ConnectionFlags {
		self.state().flags
	}

	pub fn set_flags(&self, flags: ConnectionFlags) {
		self.configure("flags", |state| state.flags = flags);
	}

	pub fn use_ssl(&self) -> bool {
		self.flags().contains(ConnectionFlags::USE_SSL)
	}

	/// Only records the preference, opening a connection with it set fails with
	/// [`Error::TlsUnavailable`]
	pub fn set_use_ssl(&self, use_ssl: bool) {
		self.configure("SSL usage", |state| state.flags.set(ConnectionFlags::USE_SSL, use_ssl));
	}

	pub fn is_open(&self) -> bool {
		self.state().socket.is_some()
	}

	pub fn is_authenticated(&self) -> bool {
		self.state().is_authenticated
	}

	/// Id the server assigned to the current stream, available after the stream opening was received
	pub fn stream_id(&self) -> Option<String> {
		self.state().stream_id.clone()
	}

	/// Set the function called when an open connection goes down. Replaces the previous one.
	pub fn set_disconnect_function<CB>(&self, callback: CB)
	where
		CB: FnMut(&Connection, DisconnectReason) + 'static,
	{
		self.inner.callbacks.borrow_mut().disconnect = Some(Box::new(callback));
	}

	fn ensure_can_open(&self) -> EmptyResult {
		let state = self.state();
		if state.socket.is_some() {
			Err(Error::AlreadyOpen)
		} else if state.server.is_none() {
			Err(Error::NoServerConfigured)
		} else if state.flags.contains(ConnectionFlags::USE_SSL) {
			Err(Error::TlsUnavailable)
		} else {
			Ok(())
		}
	}

	fn ensure_open(&self) -> EmptyResult {
		if self.is_open() { Ok(()) } else { Err(Error::NotOpen) }
	}

	fn send_stream_header(&self) -> EmptyResult {
		let server = self.server().unwrap_or_default();
		self.log(LogLevel::Debug, format_args!("Opening stream to {server}"));
		self.send(&Stanza::new_stream(&server))
	}

	/// Connect to the server and send the stream header.
	///
	/// `on_result` is called with `true` from the dispatch of the server's stream opening, at which
	/// point [`stream_id()`](Self::stream_id) is available.
	pub fn open<CB>(&self, on_result: CB) -> EmptyResult
	where
		CB: FnOnce(&Connection, bool) + 'static,
	{
		self.ensure_can_open()?;
		self.set_callback(Slot::Open, Box::new(on_result));
		let opened = self.do_open().and_then(|_| self.send_stream_header());
		if opened.is_err() {
			self.clear_callback(Slot::Open);
			self.do_close();
		}
		opened
	}

	/// Connect, send the stream header and pump the context until the server's stream opening
	/// arrives
	pub fn open_blocking(&self) -> EmptyResult {
		self.ensure_can_open()?;
		if let Err(e) = self.do_open() {
			self.do_close();
			return Err(e);
		}
		self.inner.state.borrow_mut().stream_waiter = Some(None);
		self.hold_dispatch();
		let _hold = scopeguard::guard((), |()| {
			self.inner.state.borrow_mut().stream_waiter = None;
			self.release_dispatch();
		});
		if let Err(e) = self.send_stream_header() {
			self.do_close();
			return Err(e);
		}
		let stream = self.pump_until(|state| state.stream_waiter.as_mut().and_then(Option::take))?;
		let id = stream.id().map(str::to_owned);
		self.log(
			LogLevel::Info,
			format_args!("Stream received: {}", id.as_deref().unwrap_or("(no id)")),
		);
		self.inner.state.borrow_mut().stream_id = id;
		Ok(())
	}

	/// Send the stream end and tear the connection down.
	///
	/// Output the server has not taken yet, the stream end included, is written out first, blocking
	/// if needed. The socket is closed even if that fails, the write error is returned afterwards.
	/// The disconnect function is called with [`DisconnectReason::Ok`].
	pub fn close(&self) -> EmptyResult {
		self.ensure_open()?;
		let (server, port) = {
			let state = self.state();
			(state.server.clone().unwrap_or_default(), state.port)
		};
		self.log(LogLevel::Info, format_args!("Disconnecting from: {server}:{port}"));
		let sent = self.send_raw(STREAM_CLOSE).and_then(|_| self.finish_output());
		self.do_close();
		self.fire_callback(Slot::Close, sent.is_ok());
		self.signal_disconnect(DisconnectReason::Ok);
		sent
	}

	/// Same as [`close()`](Self::close), `on_result` is called after the socket is closed and before
	/// the disconnect function
	pub fn close_with_callback<CB>(&self, on_result: CB) -> EmptyResult
	where
		CB: FnOnce(&Connection, bool) + 'static,
	{
		self.ensure_open()?;
		self.set_callback(Slot::Close, Box::new(on_result));
		self.close()
	}

	/// Serialize and send `stanza`. A trailing `</stream:stream>` is cut off so that a stream
	/// element only sends its opening tag.
	pub fn send(&self, stanza: &Stanza) -> EmptyResult {
		self.ensure_open()?;
		let mut text = stanza.to_text()?;
		if let Some(pos) = text.find(STREAM_CLOSE) {
			text.truncate(pos);
		}
		self.send_raw(text)
	}

	/// Send `data` as is
	pub fn send_raw(&self, data: impl AsRef<str>) -> EmptyResult {
		self.ensure_open()?;
		let data = data.as_ref();
		self.inner.ctx.log(LogLevel::Debug, "xmpp", format_args!("SEND: {data}"));
		self.write_bytes(data.as_bytes())
	}

	/// Send `stanza` and route the first incoming stanza with the same id to `handler`.
	///
	/// A stanza without an id gets a generated one, the id in use is returned. The handler runs once
	/// and is then forgotten whatever it returns.
	pub fn send_with_reply(&self, mut stanza: Stanza, handler: &MessageHandler) -> Result<String> {
		self.ensure_open()?;
		let id = internals::ensure_id(&mut stanza)?;
		self.add_id_handler(&id, handler);
		if let Err(e) = self.send(&stanza) {
			self.inner.handlers.borrow_mut().id.remove(&id);
			return Err(e);
		}
		Ok(id)
	}

	/// Send `stanza` and pump the context until the stanza with the same id arrives, then return it.
	///
	/// The reply does not go through any handler. Fails with [`Error::NotOpen`] if the connection goes
	/// down before the reply arrives.
	pub fn send_with_reply_blocking(&self, mut stanza: Stanza) -> Result<Stanza> {
		self.ensure_open()?;
		let id = internals::ensure_id(&mut stanza)?;
		self.inner.state.borrow_mut().reply_waiters.insert(id.clone(), None);
		self.hold_dispatch();
		let _hold = scopeguard::guard((), |()| {
			self.inner.state.borrow_mut().reply_waiters.remove(&id);
			self.release_dispatch();
		});
		self.send(&stanza)?;
		self.pump_until(|state| state.reply_waiters.get_mut(&id).and_then(Option::take))
	}

	/// Add `handler` to the chain for stanzas of type `typ`.
	///
	/// Only `Message`, `Presence`, `Iq` and `StreamError` can be handled, the stream opening is
	/// processed by the connection itself.
	pub fn register_handler(&self, handler: &MessageHandler, typ: StanzaType, priority: impl Into<HandlerPriority>) -> EmptyResult {
		if matches!(typ, StanzaType::Stream | StanzaType::Unknown) {
			return Err(Error::InvalidOperation);
		}
		self
			.inner
			.handlers
			.borrow_mut()
			.insert(typ, handler.clone(), priority.into());
		Ok(())
	}

	/// Remove the first registration of `handler` for `typ`, does nothing if there is none
	pub fn unregister_handler(&self, handler: &MessageHandler, typ: StanzaType) {
		if !self.inner.handlers.borrow_mut().remove(typ, handler) {
			self.log(
				LogLevel::Debug,
				format_args!("No such handler registered for {}", typ.as_str()),
			);
		}
	}

	/// Legacy `jabber:iq:auth` login with a digest of the stream id and `password`.
	///
	/// `on_result` receives `true` if the server answered with a `result`, `false` otherwise.
	pub fn authenticate<CB>(&self, username: &str, password: &str, resource: &str, on_result: CB) -> EmptyResult
	where
		CB: FnOnce(&Connection, bool) + 'static,
	{
		self.ensure_open()?;
		let request = auth::auth_request(&self.stream_id().unwrap_or_default(), username, password, resource)?;
		self.set_callback(Slot::Auth, Box::new(on_result));
		let handler = MessageHandler::new(|conn: &Connection, reply: &Stanza| {
			let success = reply.sub_type() == StanzaSubType::Result;
			conn.log(LogLevel::Debug, format_args!("Authentication reply, success: {success}"));
			if success {
				conn.inner.state.borrow_mut().is_authenticated = true;
			}
			conn.fire_callback(Slot::Auth, success);
			HandlerResult::Consume
		});
		if let Err(e) = self.send_with_reply(request, &handler) {
			self.clear_callback(Slot::Auth);
			return Err(e);
		}
		Ok(())
	}

	/// Blocking [`authenticate()`](Self::authenticate), returns whether the server accepted the
	/// credentials
	pub fn authenticate_blocking(&self, username: &str, password: &str, resource: &str) -> Result<bool> {
		self.ensure_open()?;
		let request = auth::auth_request(&self.stream_id().unwrap_or_default(), username, password, resource)?;
		let reply = self.send_with_reply_blocking(request)?;
		match reply.sub_type() {
			StanzaSubType::Result => {
				self.inner.state.borrow_mut().is_authenticated = true;
				Ok(true)
			}
			StanzaSubType::Error => Ok(false),
			other => unreachable!("Authentication reply must be either result or error, got: {other:?}"),
		}
	}

	/// In-band `jabber:iq:register` account creation, `on_result` receives `true` if the server
	/// answered with a `result`
	pub fn register_account<CB>(&self, username: &str, password: &str, on_result: CB) -> EmptyResult
	where
		CB: FnOnce(&Connection, bool) + 'static,
	{
		self.ensure_open()?;
		let request = auth::register_request(username, password)?;
		self.set_callback(Slot::Register, Box::new(on_result));
		let handler = MessageHandler::new(|conn: &Connection, reply: &Stanza| {
			let success = reply.sub_type() == StanzaSubType::Result;
			conn.log(LogLevel::Debug, format_args!("Registration reply, success: {success}"));
			conn.fire_callback(Slot::Register, success);
			HandlerResult::Consume
		});
		if let Err(e) = self.send_with_reply(request, &handler) {
			self.clear_callback(Slot::Register);
			return Err(e);
		}
		Ok(())
	}
}

impl PartialEq for Connection {
	fn eq(&self, other: &Connection) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let state = self.state();
		f.debug_struct("Connection")
			.field("server", &state.server)
			.field("port", &state.port)
			.field("flags", &state.flags)
			.field("open", &state.socket.is_some())
			.field("authenticated", &state.is_authenticated)
			.field("stream_id", &state.stream_id)
			.field("queued", &state.incoming.len())
			.field("callbacks", &*self.inner.callbacks.borrow())
			.finish()
	}
}
