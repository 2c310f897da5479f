use std::{io, result};

use thiserror::Error;

/// Errors returned synchronously by [`Connection`](crate::Connection) and [`Stanza`](crate::Stanza)
/// operations.
#[derive(Debug, Error)]
pub enum Error {
	#[error("Connection is already open, call close() first")]
	AlreadyOpen,
	#[error("Connection is not open, call open() first")]
	NotOpen,
	#[error("Server address is not configured, call set_server() first")]
	NoServerConfigured,
	#[error("Cannot resolve server address: {0}")]
	AddressResolutionFailed(#[source] io::Error),
	#[error("Cannot connect to server: {0}")]
	SocketConnectFailed(#[source] io::Error),
	#[error("Cannot write to server: {0}")]
	SendFailed(#[source] io::Error),
	#[error("TLS was requested but transport security is not available")]
	TlsUnavailable,
	#[error("Invalid operation")]
	InvalidOperation,
}

/// Malformed XML received from the peer
#[derive(Debug, Error)]
pub enum ParseError {
	#[error("XML error: {0}")]
	Xml(#[from] quick_xml::Error),
	#[error("Invalid attribute: {0}")]
	Attribute(#[from] quick_xml::events::attributes::AttrError),
	#[error("Expected closing tag </{expected}>, found </{found}>")]
	MismatchedEnd { expected: String, found: String },
	#[error("Unexpected closing tag </{0}> at stream level")]
	UnexpectedEnd(String),
}

/// `Result` with crate `Error`
pub type Result<T> = result::Result<T, Error>;

/// `Result` for methods that don't return any value on success
pub type EmptyResult = Result<()>;
