use tracing::Level;

/// The log level for the number of times `-v` was given. Errors are always
/// shown.
pub fn level(verbosity: usize) -> Level {
	match verbosity {
		0 => Level::ERROR,
		1 => Level::WARN,
		2 => Level::INFO,
		_ => Level::DEBUG,
	}
}

/// Logs go to stderr, stdout may be carrying policy answers
pub fn init(verbosity: usize) {
	tracing_subscriber::fmt()
		.with_max_level(level(verbosity))
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}
