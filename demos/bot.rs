//! Echo bot: logs in, announces its presence, answers version requests and echoes chat messages
//! until it receives "quit".
//!
//! Usage: `cargo run --example bot -- <server> <username> <password>`

use std::env;

use jabber_session::{
	Connection, Context, HandlerPriority, HandlerResult, MessageHandler, Stanza, StanzaSubType, StanzaType,
};

const NS_VERSION: &str = "jabber:iq:version";

pub fn main() {
	env_logger::init();

	let mut args = env::args().skip(1);
	let server = args.next().unwrap_or_else(|| "localhost".to_owned());
	let username = args.next().unwrap_or_else(|| "test".to_owned());
	let password = args.next().unwrap_or_else(|| "<password>".to_owned());

	let version_handler = MessageHandler::new(|conn, stanza| {
		if stanza.sub_type() != StanzaSubType::Get || stanza.get_child_by_ns(NS_VERSION).is_none() {
			return HandlerResult::AllowMore;
		}
		eprintln!("Received version request from {}", stanza.from().unwrap_or("(unknown)"));

		let mut reply = stanza.reply();
		reply.set_stanza_type("result").expect("Cannot set stanza type");

		let mut query = Stanza::new_with_name("query");
		query.set_ns(NS_VERSION).expect("Cannot set stanza ns");
		query
			.add_text_child("name", Some("jabber-session example bot"))
			.expect("Cannot add child");
		query.add_text_child("version", Some("1.0")).expect("Cannot add child");
		reply.add_child(query).expect("Cannot add child");

		conn.send(&reply).expect("Cannot send version reply");
		HandlerResult::Consume
	});

	let message_handler = MessageHandler::new(|conn, stanza| {
		if stanza.sub_type() == StanzaSubType::Error {
			return HandlerResult::AllowMore;
		}
		let Some(intext) = stanza.body() else {
			return HandlerResult::AllowMore;
		};

		eprintln!("Incoming message from {}: {intext}", stanza.from().unwrap_or("(unknown)"));

		let mut reply = stanza.reply();
		if reply.stanza_type().is_none() {
			reply.set_stanza_type("chat").expect("Cannot set type");
		}

		let (quit, replytext) = if intext == "quit" {
			(true, "bye!".to_owned())
		} else {
			(false, format!("{intext} to you too!"))
		};
		reply.set_body(replytext).expect("Cannot set body");

		conn.send(&reply).expect("Cannot send reply");

		if quit {
			conn.close().expect("Cannot close connection");
		}

		HandlerResult::Consume
	});

	let ctx = Context::new_with_default_logger();
	let conn = Connection::new(&ctx, Some(server.as_str()));
	conn.set_disconnect_function(|conn, reason| {
		eprintln!("Disconnected: {reason:?}");
		conn.context().stop();
	});

	conn.open_blocking().expect("Cannot connect to XMPP server");
	eprintln!("Connected, stream id: {}", conn.stream_id().unwrap_or_default());

	if !conn
		.authenticate_blocking(&username, &password, "bot")
		.expect("Cannot authenticate")
	{
		eprintln!("Authentication rejected");
		conn.close().expect("Cannot close connection");
		return;
	}

	conn
		.register_handler(&version_handler, StanzaType::Iq, HandlerPriority::NORMAL)
		.expect("Cannot register version handler");
	conn
		.register_handler(&message_handler, StanzaType::Message, HandlerPriority::NORMAL)
		.expect("Cannot register message handler");
	conn.send(&Stanza::new_presence()).expect("Cannot send presence");

	ctx.run();
}
