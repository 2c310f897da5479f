use quick_xml::escape::escape;

use super::{Stanza, StanzaSubType, StanzaType};

pub fn sub_type_from_str(typ: &str) -> StanzaSubType {
	match typ {
		"available" => StanzaSubType::Available,
		"normal" => StanzaSubType::Normal,
		"chat" => StanzaSubType::Chat,
		"groupchat" => StanzaSubType::GroupChat,
		"headline" => StanzaSubType::Headline,
		"unavailable" => StanzaSubType::Unavailable,
		"probe" => StanzaSubType::Probe,
		"subscribe" => StanzaSubType::Subscribe,
		"unsubscribe" => StanzaSubType::Unsubscribe,
		"subscribed" => StanzaSubType::Subscribed,
		"unsubscribed" => StanzaSubType::Unsubscribed,
		"get" => StanzaSubType::Get,
		"set" => StanzaSubType::Set,
		"result" => StanzaSubType::Result,
		"error" => StanzaSubType::Error,
		_ => StanzaSubType::Unknown,
	}
}

/// Append the XML form of `stanza` to `out`.
///
/// Empty tags are self-closing, except the stream element which is always written with its closing
/// tag. The connection cuts the closing tag off when it sends the stream opening.
pub fn write_stanza(out: &mut String, stanza: &Stanza) {
	if let Some(text) = &stanza.text {
		out.push_str(&escape(text.as_str()));
		return;
	}
	let Some(name) = &stanza.name else {
		return;
	};
	out.push('<');
	out.push_str(name);
	for (key, value) in &stanza.attributes {
		out.push(' ');
		out.push_str(key);
		out.push_str("=\"");
		out.push_str(&escape(value.as_str()));
		out.push('"');
	}
	if stanza.children.is_empty() && stanza.message_type() != StanzaType::Stream {
		out.push_str("/>");
		return;
	}
	out.push('>');
	for child in &stanza.children {
		write_stanza(out, child);
	}
	out.push_str("</");
	out.push_str(name);
	out.push('>');
}
