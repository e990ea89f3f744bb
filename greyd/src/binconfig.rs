use std::{
	collections::HashMap,
	net::SocketAddr,
	path::{Path, PathBuf},
};

use confindent::Confindent;
use getopts::{Matches, Options};
use grey::{Config, ConfigError};
use thiserror::Error;

const CONFIG_LOCATIONS: [&str; 2] = ["/etc/grey/grey.conf", "grey.conf"];

/// Settings for the `greyd` binary
pub struct BinConfig {
	pub config: Config,
	pub listen: Option<SocketAddr>,
	pub verbosity: usize,
}

pub fn print_usage<S: AsRef<str>>(prgm: S, opts: &Options, free: &str) {
	let brief = format!("Usage: {} [options]{}", prgm.as_ref(), free);
	println!("{}", opts.usage(&brief));
}

/// The options every binary understands
pub fn common_options() -> Options {
	let mut opts = Options::new();
	opts.optflag("h", "help", "Print this help message");
	opts.optopt(
		"c",
		"config",
		"An alternate location to read the config from\nDefault: /etc/grey/grey.conf, then ./grey.conf",
		"PATH",
	);
	opts.optopt(
		"d",
		"db-file",
		"The greylist database, overriding the config file\nDefault: greylist.db",
		"PATH",
	);
	opts.optflagmulti(
		"v",
		"",
		"Increase verbosity by one step, up to three times",
	);
	opts
}

/// Turns a cli key like `db-file` into the config key `DbFile`
pub fn conf_key(cli_key: &str) -> String {
	cli_key
		.split('-')
		.map(|word| {
			let mut c = word.chars();
			match c.next() {
				None => String::new(),
				Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
			}
		})
		.collect()
}

/// Reads the config file, if there is one, and layers the command line
/// options on top of it. An explicitly given file has to exist; otherwise
/// the default locations are tried and missing files are fine.
pub fn load_config(matches: &Matches, path: Option<String>) -> Result<Config, BinConfigError> {
	let file = match path {
		Some(path) => Some(read_file(Path::new(&path))?),
		None => match CONFIG_LOCATIONS.iter().map(Path::new).find(|p| p.exists()) {
			Some(path) => Some(read_file(path)?),
			None => {
				tracing::info!("no config file found, using defaults");
				None
			}
		},
	};

	// Options specified on the command line take priority
	let mut overrides = HashMap::new();
	if let Some(db_file) = matches.opt_str("db-file") {
		overrides.insert("db-file", db_file);
	}

	let config = Config::from_lookup(|key| {
		overrides.get(key).cloned().or_else(|| {
			file.as_ref()
				.and_then(|conf| conf.child_value(conf_key(key)))
				.map(String::from)
		})
	})?;

	Ok(config)
}

fn read_file(path: &Path) -> Result<Confindent, BinConfigError> {
	tracing::debug!("reading config from {}", path.display());
	Confindent::from_file(path).map_err(|err| BinConfigError::File {
		path: path.to_path_buf(),
		reason: err.to_string(),
	})
}

pub fn verbosity(matches: &Matches) -> usize {
	matches.opt_count("v")
}

impl BinConfig {
	/// Parses the command line. `Ok(None)` means there is nothing to run,
	/// because help was asked for.
	pub fn get() -> Result<Option<Self>, BinConfigError> {
		let args: Vec<String> = std::env::args().collect();
		Self::from_args(&args)
	}

	pub fn from_args(args: &[String]) -> Result<Option<Self>, BinConfigError> {
		let mut opts = common_options();
		opts.optopt(
			"l",
			"listen",
			"Serve policy requests over TCP on this address instead of stdin\nExample: 127.0.0.1:10023",
			"ADDR:PORT",
		);

		let matches = opts.parse(args.get(1..).unwrap_or_default())?;

		if matches.opt_present("help") {
			print_usage(args.first().map(String::as_str).unwrap_or("greyd"), &opts, "");
			return Ok(None);
		}

		let listen = match matches.opt_str("listen") {
			None => None,
			Some(addr) => Some(
				addr.parse()
					.map_err(|_| BinConfigError::ListenAddress(addr))?,
			),
		};

		let config = load_config(&matches, matches.opt_str("config"))?;

		Ok(Some(Self {
			config,
			listen,
			verbosity: verbosity(&matches),
		}))
	}
}

#[derive(Debug, Error)]
pub enum BinConfigError {
	#[error("{0}")]
	Options(#[from] getopts::Fail),
	#[error("failed to parse conf file {path:?}: {reason}")]
	File { path: PathBuf, reason: String },
	#[error("{0}")]
	Config(#[from] ConfigError),
	#[error("Failed to parse '{0}' as a listen address")]
	ListenAddress(String),
}
