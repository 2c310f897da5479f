//! Incremental stanza parser.
//!
//! Raw bytes from the socket are appended to an internal buffer and every complete top-level element
//! is turned into a [`Stanza`]. The `<stream:stream>` opening is reported on its own as soon as its
//! start tag is complete, the matching `</stream:stream>` is swallowed. Anything incomplete stays
//! buffered until the next [`Parser::feed()`].

use quick_xml::Reader;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};

use crate::error::ParseError;
use crate::{Stanza, StanzaType};

enum Chunk {
	Stanza(Stanza, usize),
	/// Bytes without meaning for the session: declarations, whitespace keepalives, stream end
	Skip(usize),
	/// No complete stanza yet, the given number of bytes went into the open elements
	Incomplete(usize),
}

#[derive(Debug, Default)]
pub struct Parser {
	/// Input not parsed yet, starts at an event boundary
	buffer: Vec<u8>,
	/// Elements of the current stanza opened by already parsed input, outermost first
	open: Vec<Stanza>,
}

impl Parser {
	pub fn new() -> Self {
		Self::default()
	}

	/// Append `data` and call `on_stanza` for every stanza it completes, in stream order.
	///
	/// Parsing resumes after the last complete tag or text, so a stanza arriving over many reads is
	/// only scanned once. On error the buffered input is discarded, stanzas completed before the
	/// malformed part have already been delivered.
	pub fn feed<F>(&mut self, data: &[u8], mut on_stanza: F) -> Result<(), ParseError>
	where
		F: FnMut(Stanza),
	{
		self.buffer.extend_from_slice(data);
		let mut consumed = 0;
		let result = loop {
			match next_chunk(&self.buffer[consumed..], &mut self.open) {
				Ok(Chunk::Stanza(stanza, len)) => {
					consumed += len;
					on_stanza(stanza);
				}
				Ok(Chunk::Skip(len)) => consumed += len,
				Ok(Chunk::Incomplete(len)) => {
					consumed += len;
					break Ok(());
				}
				Err(e) => break Err(e),
			}
		};
		if result.is_ok() {
			self.buffer.drain(..consumed);
		} else {
			self.reset();
		}
		result
	}

	/// Drop any partially received input, used when the connection is reopened
	pub fn reset(&mut self) {
		self.buffer.clear();
		self.open.clear();
	}

	/// Number of buffered bytes not parsed yet
	pub fn pending(&self) -> usize {
		self.buffer.len()
	}

	/// Whether a stanza has been started but not finished
	pub fn in_stanza(&self) -> bool {
		!self.open.is_empty()
	}
}

fn element_from(start: &BytesStart) -> Result<Stanza, ParseError> {
	let mut element = Stanza::new_with_name(String::from_utf8_lossy(start.name().as_ref()));
	for attr in start.attributes() {
		let attr = attr?;
		let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
		let value = attr.unescape_value()?.into_owned();
		element.push_attribute(key, value);
	}
	Ok(element)
}

/// Whether `err` only means that `buf` ends in the middle of some markup
fn is_truncation(err: &quick_xml::Error, buf: &[u8]) -> bool {
	match err {
		quick_xml::Error::Syntax(
			SyntaxError::UnclosedTag
			| SyntaxError::UnclosedComment
			| SyntaxError::UnclosedCData
			| SyntaxError::UnclosedDoctype
			| SyntaxError::UnclosedPIOrXmlDecl,
		) => true,
		// `<!` with nothing after it yet
		quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup) => buf.ends_with(b"<!"),
		_ => false,
	}
}

/// Parse events from `buf` into `open` until a top-level element is complete
fn next_chunk(buf: &[u8], open: &mut Vec<Stanza>) -> Result<Chunk, ParseError> {
	if buf.is_empty() {
		return Ok(Chunk::Incomplete(0));
	}
	let mut reader = Reader::from_reader(buf);
	reader.config_mut().trim_text(false);
	// closing tags are matched against `open` below, the reader never sees the stream start tag
	reader.config_mut().check_end_names = false;
	reader.config_mut().allow_unmatched_ends = true;

	// end of the last event applied to `open`
	let mut parsed = 0;
	loop {
		let event = match reader.read_event() {
			Ok(event) => event,
			Err(e) if is_truncation(&e, buf) => return Ok(Chunk::Incomplete(parsed)),
			Err(e) => return Err(e.into()),
		};
		let position = reader.buffer_position() as usize;
		match event {
			Event::Start(start) => {
				let element = element_from(&start)?;
				if open.is_empty() && element.message_type() == StanzaType::Stream {
					return Ok(Chunk::Stanza(element, position));
				}
				open.push(element);
			}
			Event::Empty(start) => {
				let element = element_from(&start)?;
				match open.last_mut() {
					Some(parent) => parent.push_child(element),
					None => return Ok(Chunk::Stanza(element, position)),
				}
			}
			Event::Text(text) => {
				if let Some(parent) = open.last_mut() {
					// text running up to the end of input could be cut inside an entity
					if position == buf.len() {
						return Ok(Chunk::Incomplete(parsed));
					}
					let text = text.unescape()?;
					if !text.is_empty() {
						parent.push_child(Stanza::new_text(text));
					}
				}
			}
			Event::CData(data) => {
				if let Some(parent) = open.last_mut() {
					parent.push_child(Stanza::new_text(String::from_utf8_lossy(&data.into_inner())));
				}
			}
			Event::End(end) => {
				let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
				let Some(element) = open.pop() else {
					if StanzaType::from_name(&name) == StanzaType::Stream {
						return Ok(Chunk::Skip(position));
					}
					return Err(ParseError::UnexpectedEnd(name));
				};
				if element.name() != Some(name.as_str()) {
					return Err(ParseError::MismatchedEnd {
						expected: element.name().unwrap_or_default().to_owned(),
						found: name,
					});
				}
				match open.last_mut() {
					Some(parent) => parent.push_child(element),
					None => return Ok(Chunk::Stanza(element, position)),
				}
			}
			Event::Eof => {
				return Ok(if open.is_empty() && position > 0 {
					Chunk::Skip(position)
				} else {
					Chunk::Incomplete(parsed)
				});
			}
			_ => {}
		}
		parsed = position;
	}
}
