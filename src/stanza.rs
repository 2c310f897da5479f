use std::collections::HashMap;
use std::{fmt, slice};

use crate::error::{EmptyResult, Error, Result};

mod internals;

/// Top-level element kind, decided by the element name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
	Message,
	Presence,
	Iq,
	/// `<stream:stream>` opening sent by the server during stream negotiation
	Stream,
	StreamError,
	Unknown,
}

impl StanzaType {
	pub fn from_name(name: &str) -> Self {
		match name {
			"message" => StanzaType::Message,
			"presence" => StanzaType::Presence,
			"iq" => StanzaType::Iq,
			"stream:stream" => StanzaType::Stream,
			"stream:error" => StanzaType::StreamError,
			_ => StanzaType::Unknown,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			StanzaType::Message => "message",
			StanzaType::Presence => "presence",
			StanzaType::Iq => "iq",
			StanzaType::Stream => "stream:stream",
			StanzaType::StreamError => "stream:error",
			StanzaType::Unknown => "unknown",
		}
	}
}

/// Value of the `type` attribute, interpreted for the stanza kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaSubType {
	NotSet,
	Available,
	Normal,
	Chat,
	GroupChat,
	Headline,
	Unavailable,
	Probe,
	Subscribe,
	Unsubscribe,
	Subscribed,
	Unsubscribed,
	Get,
	Set,
	Result,
	Error,
	Unknown,
}

/// Node of the XML tree exchanged with the server.
///
/// A freshly created stanza is neither a tag nor a text node. Call [`set_name()`](Self::set_name) to
/// make it a tag or [`set_text()`](Self::set_text) to make it a text node. Stanzas are plain owned
/// values: the connection moves them from the parser to the dispatch queue and hands out references
/// to handlers.
///
/// This struct implements:
///
///   * `Display` (same output as [`to_text()`](Self::to_text), empty on error)
///   * `Clone` as a deep copy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stanza {
	name: Option<String>,
	text: Option<String>,
	attributes: Vec<(String, String)>,
	children: Vec<Stanza>,
}

impl Stanza {
	pub fn new() -> Self {
		Self::default()
	}

	/// Tag stanza with the given element name
	pub fn new_with_name(name: impl AsRef<str>) -> Self {
		Self {
			name: Some(name.as_ref().to_owned()),
			..Self::default()
		}
	}

	/// Text node
	pub fn new_text(text: impl AsRef<str>) -> Self {
		Self {
			text: Some(text.as_ref().to_owned()),
			..Self::default()
		}
	}

	pub fn new_presence() -> Self {
		Self::new_with_name("presence")
	}

	pub fn new_iq(typ: Option<&str>, id: Option<&str>) -> Self {
		let mut out = Self::new_with_name("iq");
		out.set_optional("type", typ);
		out.set_optional("id", id);
		out
	}

	pub fn new_message(typ: Option<&str>, id: Option<&str>, to: Option<&str>) -> Self {
		let mut out = Self::new_with_name("message");
		out.set_optional("type", typ);
		out.set_optional("to", to);
		out.set_optional("id", id);
		out
	}

	/// Stream opening addressed to `to` with the client namespaces declared
	pub(crate) fn new_stream(to: &str) -> Self {
		let mut out = Self::new_with_name("stream:stream");
		out.set_optional("to", Some(to));
		out.set_optional("xmlns:stream", Some(crate::NS_STREAMS));
		out.set_optional("xmlns", Some(crate::NS_CLIENT));
		out
	}

	fn set_optional(&mut self, name: &str, value: Option<&str>) {
		if let Some(value) = value {
			self.attributes.push((name.to_owned(), value.to_owned()));
		}
	}

	pub(crate) fn push_attribute(&mut self, name: String, value: String) {
		self.attributes.push((name, value));
	}

	pub(crate) fn push_child(&mut self, child: Stanza) {
		self.children.push(child);
	}

	pub fn is_text(&self) -> bool {
		self.text.is_some()
	}

	pub fn is_tag(&self) -> bool {
		self.name.is_some()
	}

	/// Serialize the stanza to XML text
	pub fn to_text(&self) -> Result<String> {
		if !self.is_tag() && !self.is_text() {
			return Err(Error::InvalidOperation);
		}
		let mut out = String::new();
		internals::write_stanza(&mut out, self);
		Ok(out)
	}

	/// Be aware that calling this method turns a text node into a tag.
	pub fn set_name(&mut self, name: impl AsRef<str>) -> EmptyResult {
		self.text = None;
		self.name = Some(name.as_ref().to_owned());
		Ok(())
	}

	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Element kind derived from the name, text nodes are `Unknown`
	pub fn message_type(&self) -> StanzaType {
		self.name().map_or(StanzaType::Unknown, StanzaType::from_name)
	}

	/// Interpretation of the `type` attribute. A missing attribute means `Normal` for messages,
	/// `Available` for presences and `NotSet` for everything else.
	pub fn sub_type(&self) -> StanzaSubType {
		match self.stanza_type() {
			Some(typ) => internals::sub_type_from_str(typ),
			None => match self.message_type() {
				StanzaType::Message => StanzaSubType::Normal,
				StanzaType::Presence => StanzaSubType::Available,
				_ => StanzaSubType::NotSet,
			},
		}
	}

	pub fn attribute_count(&self) -> usize {
		self.attributes.len()
	}

	pub fn set_attribute(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> EmptyResult {
		if !self.is_tag() {
			return Err(Error::InvalidOperation);
		}
		let (name, value) = (name.as_ref(), value.as_ref());
		match self.attributes.iter_mut().find(|(key, _)| key == name) {
			Some(attr) => attr.1 = value.to_owned(),
			None => self.attributes.push((name.to_owned(), value.to_owned())),
		}
		Ok(())
	}

	/// Set several attributes at once, in order
	pub fn set_attributes(&mut self, attributes: &[(&str, &str)]) -> EmptyResult {
		attributes
			.iter()
			.try_for_each(|(name, value)| self.set_attribute(name, value))
	}

	pub fn get_attribute(&self, name: impl AsRef<str>) -> Option<&str> {
		let name = name.as_ref();
		self
			.attributes
			.iter()
			.find(|(key, _)| key == name)
			.map(|(_, value)| value.as_str())
	}

	/// All attributes of the tag as a map
	pub fn attributes(&self) -> HashMap<&str, &str> {
		self
			.attributes
			.iter()
			.map(|(key, value)| (key.as_str(), value.as_str()))
			.collect()
	}

	pub fn del_attribute(&mut self, name: impl AsRef<str>) -> EmptyResult {
		if !self.is_tag() {
			return Err(Error::InvalidOperation);
		}
		let name = name.as_ref();
		self.attributes.retain(|(key, _)| key != name);
		Ok(())
	}

	/// Be aware that calling this method turns the stanza into a text node, dropping its name,
	/// attributes and children.
	pub fn set_text(&mut self, text: impl AsRef<str>) -> EmptyResult {
		self.name = None;
		self.attributes.clear();
		self.children.clear();
		self.text = Some(text.as_ref().to_owned());
		Ok(())
	}

	/// Text of a text node, or the concatenated text children of a tag
	pub fn text(&self) -> Option<String> {
		if let Some(text) = &self.text {
			return Some(text.clone());
		}
		let mut texts = self.children.iter().filter_map(|child| child.text.as_deref()).peekable();
		texts.peek()?;
		Some(texts.collect())
	}

	pub fn set_id(&mut self, id: impl AsRef<str>) -> EmptyResult {
		self.set_attribute("id", id)
	}

	pub fn id(&self) -> Option<&str> {
		self.get_attribute("id")
	}

	pub fn set_ns(&mut self, ns: impl AsRef<str>) -> EmptyResult {
		self.set_attribute("xmlns", ns)
	}

	pub fn ns(&self) -> Option<&str> {
		self.get_attribute("xmlns")
	}

	/// Set the raw `type` attribute
	pub fn set_stanza_type(&mut self, typ: impl AsRef<str>) -> EmptyResult {
		self.set_attribute("type", typ)
	}

	/// Raw `type` attribute, see also [`sub_type()`](Self::sub_type)
	pub fn stanza_type(&self) -> Option<&str> {
		self.get_attribute("type")
	}

	pub fn set_to(&mut self, to: impl AsRef<str>) -> EmptyResult {
		self.set_attribute("to", to)
	}

	pub fn to(&self) -> Option<&str> {
		self.get_attribute("to")
	}

	pub fn set_from(&mut self, from: impl AsRef<str>) -> EmptyResult {
		self.set_attribute("from", from)
	}

	pub fn from(&self) -> Option<&str> {
		self.get_attribute("from")
	}

	pub fn get_first_child(&self) -> Option<&Stanza> {
		self.children.first()
	}

	pub fn get_first_child_mut(&mut self) -> Option<&mut Stanza> {
		self.children.first_mut()
	}

	pub fn children(&self) -> slice::Iter<'_, Stanza> {
		self.children.iter()
	}

	pub fn children_mut(&mut self) -> slice::IterMut<'_, Stanza> {
		self.children.iter_mut()
	}

	/// First child tag declaring the `xmlns` namespace `ns`
	pub fn get_child_by_ns(&self, ns: impl AsRef<str>) -> Option<&Stanza> {
		let ns = ns.as_ref();
		self.children.iter().find(|child| child.ns() == Some(ns))
	}

	pub fn get_child_by_name(&self, name: impl AsRef<str>) -> Option<&Stanza> {
		let name = name.as_ref();
		self.children.iter().find(|child| child.name() == Some(name))
	}

	pub fn get_child_by_name_mut(&mut self, name: impl AsRef<str>) -> Option<&mut Stanza> {
		let name = name.as_ref();
		self.children.iter_mut().find(|child| child.name() == Some(name))
	}

	pub fn add_child(&mut self, child: Stanza) -> EmptyResult {
		if !self.is_tag() {
			return Err(Error::InvalidOperation);
		}
		self.children.push(child);
		Ok(())
	}

	/// Append a child tag named `name`, optionally holding `text`, and return it
	pub fn add_text_child(&mut self, name: impl AsRef<str>, text: Option<&str>) -> Result<&mut Stanza> {
		let mut child = Stanza::new_with_name(name);
		if let Some(text) = text {
			child.add_child(Stanza::new_text(text))?;
		}
		self.add_child(child)?;
		self.children.last_mut().ok_or(Error::InvalidOperation)
	}

	/// New stanza of the same name and attributes, addressed back to the sender. Children are not
	/// copied.
	pub fn reply(&self) -> Stanza {
		let mut out = Stanza {
			name: self.name.clone(),
			text: None,
			attributes: self.attributes.clone(),
			children: Vec::new(),
		};
		out.attributes.retain(|(key, _)| key != "to" && key != "from");
		if let Some(from) = self.from() {
			out.attributes.push(("to".to_owned(), from.to_owned()));
		}
		out
	}

	/// Replace the `<body>` of a message
	pub fn set_body(&mut self, body: impl AsRef<str>) -> EmptyResult {
		if self.message_type() != StanzaType::Message {
			return Err(Error::InvalidOperation);
		}
		self.children.retain(|child| child.name() != Some("body"));
		self.add_text_child("body", Some(body.as_ref())).map(|_| ())
	}

	pub fn body(&self) -> Option<String> {
		self.get_child_by_name("body").and_then(|body| body.text())
	}
}

impl fmt::Display for Stanza {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self.to_text() {
			Ok(text) => f.write_str(&text),
			Err(_) => Ok(()),
		}
	}
}
