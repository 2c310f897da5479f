//! Request builders for the legacy account operations.

use sha1::{Digest, Sha1};

use crate::Stanza;
use crate::error::Result;

pub const NS_AUTH: &str = "jabber:iq:auth";
pub const NS_REGISTER: &str = "jabber:iq:register";

/// Lowercase hex SHA-1 of the stream id followed by the password
pub fn legacy_digest(stream_id: &str, password: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(stream_id.as_bytes());
	hasher.update(password.as_bytes());
	hex::encode(hasher.finalize())
}

/// `<iq type="set"><query xmlns="jabber:iq:auth">` with username, digest and resource
pub fn auth_request(stream_id: &str, username: &str, password: &str, resource: &str) -> Result<Stanza> {
	let mut iq = Stanza::new_iq(Some("set"), None);
	let mut query = Stanza::new_with_name("query");
	query.set_ns(NS_AUTH)?;
	query.add_text_child("username", Some(username))?;
	query.add_text_child("digest", Some(&legacy_digest(stream_id, password)))?;
	query.add_text_child("resource", Some(resource))?;
	iq.add_child(query)?;
	Ok(iq)
}

/// `<iq type="set"><query xmlns="jabber:iq:register">` with username and password
pub fn register_request(username: &str, password: &str) -> Result<Stanza> {
	let mut iq = Stanza::new_iq(Some("set"), None);
	let mut query = Stanza::new_with_name("query");
	query.set_ns(NS_REGISTER)?;
	query.add_text_child("username", Some(username))?;
	query.add_text_child("password", Some(password))?;
	iq.add_child(query)?;
	Ok(iq)
}
