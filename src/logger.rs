use std::fmt;

/// Severity of a library log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
	Debug,
	Info,
	Warn,
	Error,
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			LogLevel::Debug => "DEBUG",
			LogLevel::Info => "INFO",
			LogLevel::Warn => "WARN",
			LogLevel::Error => "ERROR",
		})
	}
}

pub type LogCallback = dyn FnMut(LogLevel, &str, &str);

/// Sink for the library diagnostics, owned by a [`Context`](crate::Context).
///
/// The best option to get a logger is to call `Logger::default()`. It will return you a logger that
/// is tied into Rust logging facility provided by `log` crate. This functionality is available when
/// compiling with the default `rust-log` feature.
///
/// The callback receives the log level, the area (`"conn"`, `"xmpp"` or `"ctx"`) and the message.
pub struct Logger {
	handler: Option<Box<LogCallback>>,
}

impl Logger {
	/// Create a new custom logger.
	///
	/// The callback argument will be called every time a log message needs to be printed.
	pub fn new<CB>(handler: CB) -> Logger
	where
		CB: FnMut(LogLevel, &str, &str) + 'static,
	{
		Logger {
			handler: Some(Box::new(handler)),
		}
	}

	/// Logger that discards everything
	pub fn new_null() -> Logger {
		Logger { handler: None }
	}

	/// Logger that writes lines of `log_level` and above to stderr.
	///
	/// Use it if you compile without `rust-log` feature and want a quick debug log output.
	pub fn new_internal(log_level: LogLevel) -> Logger {
		Logger::new(move |level, area, msg| {
			if level >= log_level {
				eprintln!("{area} {level} {msg}");
			}
		})
	}

	pub(crate) fn log(&mut self, level: LogLevel, area: &str, msg: fmt::Arguments) {
		if let Some(handler) = self.handler.as_mut() {
			handler(level, area, &msg.to_string());
		}
	}
}

#[cfg(feature = "rust-log")]
fn log_handler(log_level: LogLevel, area: &str, message: &str) {
	match log_level {
		LogLevel::Debug => log::debug!("{area}: {message}"),
		LogLevel::Info => log::info!("{area}: {message}"),
		LogLevel::Warn => log::warn!("{area}: {message}"),
		LogLevel::Error => log::error!("{area}: {message}"),
	}
}

impl Default for Logger {
	/// Return a new logger that logs to standard Rust logging facilities.
	///
	/// Logging facilities are provided by `log` crate. Only available when compiling with `rust-log`
	/// feature.
	#[cfg(feature = "rust-log")]
	fn default() -> Self {
		Logger::new(log_handler)
	}

	/// Create a new default logger by calling `new_internal()` with debug log level.
	///
	/// Used when the crate is compiled without `rust-log` feature.
	#[cfg(not(feature = "rust-log"))]
	fn default() -> Self {
		Logger::new_internal(LogLevel::Debug)
	}
}

impl fmt::Debug for Logger {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Logger")
			.field("handler", &if self.handler.is_some() { "set" } else { "null" })
			.finish()
	}
}
