use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use matches::assert_matches;

use crate::*;


type Journal = Rc<RefCell<Vec<String>>>;

fn offline(ctx: &Context) -> Connection {
	Connection::new(ctx, Some("localhost"))
}

/// Handler appending `name` to `journal` and returning `result`
fn recorder(journal: &Journal, name: &str, result: HandlerResult) -> MessageHandler {
	let journal = journal.clone();
	let name = name.to_owned();
	MessageHandler::new(move |_, stanza| {
		journal
			.borrow_mut()
			.push(format!("{name}:{}", stanza.id().unwrap_or_default()));
		result
	})
}

#[test]
fn default_context() {
	Context::new_with_default_logger();
}

#[test]
fn default_context_null() {
	Context::new_with_null_logger();
}

#[test]
fn default_logger() {
	Logger::default();
}

#[test]
fn null_logger() {
	Logger::new_null();
}

#[test]
fn custom_logger() {
	let lines = Rc::new(RefCell::new(Vec::new()));
	let ctx = Context::new(Logger::new({
		let lines = lines.clone();
		move |level, area, msg| lines.borrow_mut().push(format!("{level} {area} {msg}"))
	}));
	let conn = offline(&ctx);
	assert!(conn.feed(b"<presence/>"));
	assert!(lines.borrow().iter().any(|line| line == "DEBUG xmpp RECV: <presence/>"));
}

#[test]
fn context_timeout() {
	let ctx = Context::new_with_null_logger();
	assert_eq!(ctx.timeout(), Duration::from_millis(1000));
	ctx.set_timeout(Duration::from_millis(10));
	assert_eq!(ctx.timeout(), Duration::from_millis(10));
	let clone = ctx.clone();
	assert_eq!(clone.timeout(), Duration::from_millis(10));
	assert_eq!(ctx, clone);
	assert_ne!(ctx, Context::new_with_null_logger());
}

#[test]
fn context_stop_from_handler() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let handler = MessageHandler::new(|conn, _| {
		conn.context().stop();
		HandlerResult::Consume
	});
	conn.register_handler(&handler, StanzaType::Presence, HandlerPriority::NORMAL).unwrap();
	conn.feed(b"<presence/>");
	ctx.run();
}

#[test]
fn dropped_connection_leaves_context() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	assert!(format!("{ctx:?}").contains("sources: 1"));
	let clone = conn.clone();
	drop(conn);
	assert!(format!("{ctx:?}").contains("sources: 1"));
	drop(clone);
	assert!(format!("{ctx:?}").contains("sources: 0"));
	ctx.run_once(Duration::ZERO);
}

#[test]
fn conn_defaults() {
	let ctx = Context::new_with_null_logger();
	let conn = Connection::new(&ctx, None);
	assert_eq!(conn.server(), None);
	assert_eq!(conn.port(), DEFAULT_PORT);
	assert!(!conn.use_ssl());
	assert!(!conn.is_open());
	assert!(!conn.is_authenticated());
	assert_eq!(conn.stream_id(), None);
	assert_eq!(conn.context(), &ctx);

	conn.set_server("example.com");
	conn.set_port(5223);
	conn.set_use_ssl(true);
	assert_eq!(conn.server().as_deref(), Some("example.com"));
	assert_eq!(conn.port(), 5223);
	assert_eq!(conn.flags(), ConnectionFlags::USE_SSL);
	conn.set_flags(ConnectionFlags::empty());
	assert!(!conn.use_ssl());
}

#[test]
fn conn_not_open() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let handler = MessageHandler::new(|_, _| HandlerResult::Consume);
	assert_matches!(conn.send(&Stanza::new_presence()), Err(Error::NotOpen));
	assert_matches!(conn.send_raw(" "), Err(Error::NotOpen));
	assert_matches!(conn.send_with_reply(Stanza::new_iq(Some("get"), None), &handler), Err(Error::NotOpen));
	assert_matches!(conn.send_with_reply_blocking(Stanza::new_iq(Some("get"), None)), Err(Error::NotOpen));
	assert_matches!(conn.authenticate("user", "pass", "res", |_, _| {}), Err(Error::NotOpen));
	assert_matches!(conn.authenticate_blocking("user", "pass", "res"), Err(Error::NotOpen));
	assert_matches!(conn.register_account("user", "pass", |_, _| {}), Err(Error::NotOpen));
	assert_matches!(conn.close(), Err(Error::NotOpen));
	assert_matches!(conn.close_with_callback(|_, _| {}), Err(Error::NotOpen));
}

#[test]
fn handler_priority() {
	assert!(HandlerPriority::FIRST > HandlerPriority::NORMAL);
	assert!(HandlerPriority::NORMAL > HandlerPriority::LAST);
	assert_eq!(HandlerPriority::default(), HandlerPriority::NORMAL);
	assert_eq!(HandlerPriority::from(3), HandlerPriority::FIRST);
}

#[test]
fn handlers_run_by_priority() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let last = recorder(&journal, "last", HandlerResult::AllowMore);
	let first = recorder(&journal, "first", HandlerResult::AllowMore);
	let normal = recorder(&journal, "normal", HandlerResult::AllowMore);
	conn.register_handler(&last, StanzaType::Message, HandlerPriority::LAST).unwrap();
	conn.register_handler(&first, StanzaType::Message, HandlerPriority::FIRST).unwrap();
	conn.register_handler(&normal, StanzaType::Message, HandlerPriority::NORMAL).unwrap();

	conn.feed(b"<message id='m'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["first:m", "normal:m", "last:m"]);
}

#[test]
fn equal_priority_keeps_registration_order() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	for name in ["a", "b", "c"] {
		let handler = recorder(&journal, name, HandlerResult::AllowMore);
		conn.register_handler(&handler, StanzaType::Presence, 7).unwrap();
	}
	conn.feed(b"<presence id='p'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["a:p", "b:p", "c:p"]);
}

#[test]
fn consume_stops_chain() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let high = recorder(&journal, "high", HandlerResult::Consume);
	let low = recorder(&journal, "low", HandlerResult::AllowMore);
	conn.register_handler(&low, StanzaType::Iq, HandlerPriority::LAST).unwrap();
	conn.register_handler(&high, StanzaType::Iq, HandlerPriority::FIRST).unwrap();

	conn.feed(b"<iq id='1'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["high:1"]);

	conn.unregister_handler(&high, StanzaType::Iq);
	// not registered for this type
	conn.unregister_handler(&high, StanzaType::Message);
	conn.feed(b"<iq id='2'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["high:1", "low:2"]);
}

#[test]
fn handlers_only_see_their_type() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let presence = recorder(&journal, "presence", HandlerResult::AllowMore);
	let error = recorder(&journal, "error", HandlerResult::AllowMore);
	conn.register_handler(&presence, StanzaType::Presence, HandlerPriority::NORMAL).unwrap();
	conn.register_handler(&error, StanzaType::StreamError, HandlerPriority::NORMAL).unwrap();
	assert_matches!(
		conn.register_handler(&presence, StanzaType::Stream, HandlerPriority::NORMAL),
		Err(Error::InvalidOperation)
	);

	conn.feed(b"<message id='m'/><foo id='f'/><stream:error id='e'><conflict/></stream:error>");
	for _ in 0..3 {
		ctx.run_once(Duration::ZERO);
	}
	assert_eq!(*journal.borrow(), ["error:e"]);
}

#[test]
fn one_stanza_per_iteration() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let handler = recorder(&journal, "msg", HandlerResult::Consume);
	conn.register_handler(&handler, StanzaType::Message, HandlerPriority::NORMAL).unwrap();

	conn.feed(b"<message id='1'/><message id='2'/><message id='3'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["msg:1"]);
	ctx.run_once(Duration::ZERO);
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["msg:1", "msg:2", "msg:3"]);
	ctx.run_once(Duration::ZERO);
	assert_eq!(journal.borrow().len(), 3);
}

#[test]
fn reply_handler_is_one_shot() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let reply = recorder(&journal, "reply", HandlerResult::AllowMore);
	let chain = recorder(&journal, "chain", HandlerResult::Consume);
	conn.register_handler(&chain, StanzaType::Iq, HandlerPriority::NORMAL).unwrap();
	conn.add_id_handler("r1", &reply);

	conn.feed(b"<iq type='result' id='r1'/><iq type='result' id='r1'/>");
	ctx.run_once(Duration::ZERO);
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["reply:r1", "chain:r1", "chain:r1"]);
}

#[test]
fn consuming_reply_handler_skips_chain() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let reply = recorder(&journal, "reply", HandlerResult::Consume);
	let chain = recorder(&journal, "chain", HandlerResult::Consume);
	conn.register_handler(&chain, StanzaType::Iq, HandlerPriority::NORMAL).unwrap();
	conn.add_id_handler("r2", &reply);

	conn.feed(b"<iq type='result' id='r2'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["reply:r2"]);
}

#[test]
fn reply_handler_can_register_again() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let again = recorder(&journal, "again", HandlerResult::Consume);
	let first = MessageHandler::new({
		let journal = journal.clone();
		move |conn, stanza| {
			journal.borrow_mut().push("first".to_owned());
			conn.add_id_handler(stanza.id().unwrap_or_default(), &again);
			HandlerResult::Consume
		}
	});
	conn.add_id_handler("r3", &first);

	conn.feed(b"<iq id='r3'/><iq id='r3'/><iq id='r3'/>");
	for _ in 0..3 {
		ctx.run_once(Duration::ZERO);
	}
	assert_eq!(*journal.borrow(), ["first", "again:r3"]);
}

#[test]
fn handler_registered_during_dispatch() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	let late = recorder(&journal, "late", HandlerResult::AllowMore);
	let early = MessageHandler::new({
		let journal = journal.clone();
		move |conn, stanza| {
			journal
				.borrow_mut()
				.push(format!("early:{}", stanza.id().unwrap_or_default()));
			conn.register_handler(&late, StanzaType::Message, HandlerPriority::LAST).unwrap();
			HandlerResult::AllowMore
		}
	});
	conn.register_handler(&early, StanzaType::Message, HandlerPriority::FIRST).unwrap();

	conn.feed(b"<message id='1'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["early:1"]);
	conn.unregister_handler(&early, StanzaType::Message);

	conn.feed(b"<message id='2'/>");
	ctx.run_once(Duration::ZERO);
	assert_eq!(*journal.borrow(), ["early:1", "late:2"]);
}

#[test]
fn unmatched_stanza_is_dropped() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	conn.feed(b"<message id='lost'/>");
	ctx.run_once(Duration::ZERO);

	let handler = recorder(&journal, "msg", HandlerResult::Consume);
	conn.register_handler(&handler, StanzaType::Message, HandlerPriority::NORMAL).unwrap();
	ctx.run_once(Duration::ZERO);
	assert!(journal.borrow().is_empty());
}

#[test]
fn stream_opening_is_not_routed() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let journal = Journal::default();
	for typ in [StanzaType::Message, StanzaType::Presence, StanzaType::Iq, StanzaType::StreamError] {
		let handler = recorder(&journal, typ.as_str(), HandlerResult::AllowMore);
		conn.register_handler(&handler, typ, HandlerPriority::NORMAL).unwrap();
	}
	conn.feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' id='s1'>");
	ctx.run_once(Duration::ZERO);
	assert!(journal.borrow().is_empty());
	// a closed connection has no stream
	assert_eq!(conn.stream_id(), None);
}

#[test]
fn malformed_input_offline() {
	let ctx = Context::new_with_null_logger();
	let conn = offline(&ctx);
	let reasons = Rc::new(RefCell::new(Vec::new()));
	conn.set_disconnect_function({
		let reasons = reasons.clone();
		move |_, reason| reasons.borrow_mut().push(reason)
	});
	assert!(!conn.feed(b"<message></presence>"));
	assert!(reasons.borrow().is_empty());
	assert!(conn.feed(b"<presence/>"));
}

#[test]
fn stanza_err() {
	let mut stanza = Stanza::new();
	assert_matches!(stanza.to_text(), Err(Error::InvalidOperation));
	stanza.set_name("test").unwrap();
	assert_matches!(stanza.set_body("body"), Err(Error::InvalidOperation));
	let mut text = Stanza::new_text("text");
	assert_matches!(text.add_child(Stanza::new_presence()), Err(Error::InvalidOperation));
}

#[test]
fn stanza_display() {
	let mut stanza = Stanza::new();
	stanza.set_name("message").unwrap();
	stanza.set_id("stanza_id").unwrap();
	stanza.add_child(Stanza::new_iq(Some("test"), None)).unwrap();
	assert_eq!(stanza.to_string(), stanza.to_text().unwrap());
	assert_eq!(Stanza::new().to_string(), "");
}

#[test]
fn stanza_hier() {
	let mut stanza = Stanza::new();
	stanza.set_name("test").unwrap();
	stanza.add_child(Stanza::new_presence()).unwrap();
	stanza.add_child(Stanza::new_iq(Some("test"), None)).unwrap();
	let mut msg = Stanza::new_message(Some("chat"), Some("id"), Some("to"));
	msg.set_body("Test body").unwrap();
	stanza.add_child(msg).unwrap();

	{
		let child = stanza.get_first_child().unwrap();
		assert_eq!(child.name().unwrap(), "presence");
		let child = stanza.children().nth(1).unwrap();
		assert_eq!(child.name().unwrap(), "iq");
	}

	{
		let child = stanza.get_child_by_name_mut("message").unwrap();
		assert_eq!(child.body().unwrap(), "Test body");
		child.set_body("Other body").unwrap();
		assert_eq!(child.body().unwrap(), "Other body");
		assert_eq!(child.children().count(), 1);
	}

	{
		for (i, child) in stanza.children().enumerate() {
			assert_eq!(stanza.get_first_child().unwrap().name().unwrap(), "presence"); // simultaneous borrow test
			match i {
				0 => assert_eq!(child.name().unwrap(), "presence"),
				1 => assert_eq!(child.name().unwrap(), "iq"),
				2 => {
					assert_eq!(child.name().unwrap(), "message");
					assert_eq!(child.body().unwrap(), "Other body");
				}
				_ => panic!("Too many items: {}", child),
			}
		}
	}

	{
		for (i, child) in stanza.children_mut().enumerate() {
			if i == 0 {
				assert_eq!(child.name().unwrap(), "presence");
				child.set_name("presence1").unwrap();
			}
		}
		assert_eq!(stanza.get_first_child().unwrap().name().unwrap(), "presence1");
	}
}

#[test]
fn stanza() {
	let mut stanza = Stanza::new();
	stanza.set_name("message").unwrap();
	stanza.set_id("stanza_id").unwrap();

	let stanza2 = Stanza::new_message(None, Some("stanza_id"), None);
	assert_eq!(stanza.name(), stanza2.name());
	assert_eq!(stanza.stanza_type(), stanza2.stanza_type());
	assert_eq!(stanza.id(), stanza2.id());
	assert_eq!(stanza.to(), stanza2.to());
	assert_eq!(stanza.body(), stanza2.body());

	stanza.set_name("presence").unwrap();
	let stanza2 = Stanza::new_presence();
	assert_eq!(stanza.name(), stanza2.name());

	let mut stanza3 = stanza.clone();
	stanza3.set_id("iq").unwrap();
	assert_ne!(stanza.id(), stanza3.id());
}

#[test]
fn stanza_clone() {
	let stanza = {
		let mut stanza = Stanza::new();
		stanza.set_name("message").unwrap();
		stanza.set_id("stanza_id").unwrap();
		stanza.clone()
	};
	assert_eq!("<message id=\"stanza_id\"/>", stanza.to_text().unwrap());
}

#[test]
fn stanza_attributes() {
	let mut stanza = Stanza::new();

	assert_matches!(stanza.set_id("stanza_id"), Err(Error::InvalidOperation));
	assert_eq!(stanza.attribute_count(), 0);

	stanza.set_name("message").unwrap();
	stanza.set_id("stanza_id").unwrap();
	stanza.set_stanza_type("type").unwrap();
	stanza.set_ns("myns").unwrap();

	assert_eq!(stanza.attribute_count(), 3);
	assert_matches!(stanza.get_attribute("type"), Some("type"));
	assert_matches!(stanza.get_attribute("non-existent"), None);

	stanza.set_attribute("xmlns", "myotherns").unwrap();
	assert_matches!(stanza.ns(), Some("myotherns"));

	let mut compare = HashMap::new();
	compare.insert("xmlns", "myotherns");
	compare.insert("type", "type");
	compare.insert("id", "stanza_id");
	assert_eq!(stanza.attributes(), compare);

	stanza.del_attribute("type").unwrap();
	assert_eq!(stanza.attribute_count(), 2);
	assert_matches!(stanza.get_attribute("type"), None);
	compare.remove("type");
	assert_eq!(stanza.attributes(), compare);

	stanza.set_attributes(&[("to", "a@b"), ("from", "c@d")]).unwrap();
	assert_eq!(stanza.to(), Some("a@b"));
	assert_eq!(stanza.from(), Some("c@d"));
}

#[test]
fn stanza_sub_type() {
	assert_eq!(Stanza::new_message(None, None, None).sub_type(), StanzaSubType::Normal);
	assert_eq!(Stanza::new_presence().sub_type(), StanzaSubType::Available);
	assert_eq!(Stanza::new_iq(None, None).sub_type(), StanzaSubType::NotSet);
	assert_eq!(Stanza::new_iq(Some("get"), None).sub_type(), StanzaSubType::Get);
	assert_eq!(Stanza::new_message(Some("groupchat"), None, None).sub_type(), StanzaSubType::GroupChat);
	assert_eq!(Stanza::new_message(Some("bogus"), None, None).sub_type(), StanzaSubType::Unknown);
	assert_eq!(Stanza::new_with_name("foo").message_type(), StanzaType::Unknown);
	assert_eq!(Stanza::new_text("foo").message_type(), StanzaType::Unknown);
}

#[test]
fn stanza_text() {
	let mut msg = Stanza::new_message(Some("chat"), None, Some("a@b"));
	msg.set_body("1 < 2 & 3").unwrap();
	assert_eq!(
		msg.to_text().unwrap(),
		"<message type=\"chat\" to=\"a@b\"><body>1 &lt; 2 &amp; 3</body></message>"
	);
	assert_eq!(msg.body().as_deref(), Some("1 < 2 & 3"));

	let mut text = Stanza::new_text("plain");
	assert!(text.is_text());
	assert_eq!(text.text().as_deref(), Some("plain"));
	text.set_name("tag").unwrap();
	assert!(text.is_tag());
	assert_eq!(text.text(), None);
	text.set_text("again").unwrap();
	assert!(!text.is_tag());
	assert_eq!(text.to_text().unwrap(), "again");
}

#[test]
fn stanza_reply() {
	let mut msg = Stanza::new_message(Some("chat"), Some("m1"), Some("me@host"));
	msg.set_from("you@host/res").unwrap();
	msg.set_body("hi").unwrap();

	let reply = msg.reply();
	assert_eq!(reply.name(), Some("message"));
	assert_eq!(reply.to(), Some("you@host/res"));
	assert_eq!(reply.from(), None);
	assert_eq!(reply.id(), Some("m1"));
	assert_eq!(reply.stanza_type(), Some("chat"));
	assert_eq!(reply.get_first_child(), None);
}

#[test]
fn legacy_digest() {
	assert_eq!(auth::legacy_digest("", ""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
	assert_eq!(
		auth::legacy_digest("abc123", "secret"),
		"b67adbb9f7287b8f2d9c809b39a804b2123fc4c0"
	);
	// stream id goes first
	assert_ne!(auth::legacy_digest("secret", "abc123"), auth::legacy_digest("abc123", "secret"));
}
