//! Logger
//!
//! Terminal output is filtered by `RUST_LOG` (default `info`), while the
//! optional log file is filtered by `RUST_LOG_FILE` (default `debug`).

// Imports
use {
	std::{fs, io, path::Path, sync::Mutex},
	tracing_subscriber::{fmt, prelude::*, EnvFilter},
};

/// Logging before the logger is initialized.
///
/// Messages are buffered and replayed once [`init`] is called.
pub mod pre_init {
	// Imports
	use std::sync::Mutex;

	/// Buffered message level
	#[derive(Clone, Copy, Debug)]
	pub(super) enum Level {
		Debug,
		Warn,
	}

	/// Buffered messages
	pub(super) static MESSAGES: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

	fn push(level: Level, msg: String) {
		// Note: A poisoned buffer only loses early messages
		if let Ok(mut messages) = MESSAGES.lock() {
			messages.push((level, msg));
		}
	}

	/// Buffers a debug message
	pub fn debug(msg: impl Into<String>) {
		self::push(Level::Debug, msg.into());
	}

	/// Buffers a warning message
	pub fn warn(msg: impl Into<String>) {
		self::push(Level::Warn, msg.into());
	}
}

/// Initializes the global logger.
///
/// If `log_file` is set, verbose output is also written to it,
/// appending if `log_file_append` is set and truncating otherwise.
pub fn init(log_file: Option<&Path>, log_file_append: bool) {
	let term_layer = fmt::layer()
		.with_writer(io::stderr)
		.with_filter(self::env_filter("RUST_LOG", "info"));

	let file_layer = log_file.and_then(|path| {
		let file = fs::OpenOptions::new()
			.create(true)
			.write(true)
			.append(log_file_append)
			.truncate(!log_file_append)
			.open(path);

		match file {
			Ok(file) => Some(
				fmt::layer()
					.with_ansi(false)
					.with_writer(Mutex::new(file))
					.with_filter(self::env_filter("RUST_LOG_FILE", "debug")),
			),
			Err(err) => {
				pre_init::warn(format!("Unable to open log file {path:?}: {err}"));
				None
			},
		}
	});

	if let Err(err) = tracing_subscriber::registry()
		.with(term_layer)
		.with(file_layer)
		.try_init()
	{
		eprintln!("Unable to initialize logger: {err}");
	}

	// Then replay everything logged before we were ready
	let messages = match pre_init::MESSAGES.lock() {
		Ok(mut messages) => std::mem::take(&mut *messages),
		Err(_) => vec![],
	};
	for (level, msg) in messages {
		match level {
			pre_init::Level::Debug => tracing::debug!("{msg}"),
			pre_init::Level::Warn => tracing::warn!("{msg}"),
		}
	}
}

/// Creates an env filter from `var`, falling back to `default`
fn env_filter(var: &str, default: &str) -> EnvFilter {
	EnvFilter::try_from_env(var).unwrap_or_else(|_| EnvFilter::new(default))
}
