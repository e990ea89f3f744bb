//! Settings and commands for `greyctl`.

use std::path::{Path, PathBuf};

use grey::{anon::Anonymizer, listing, munin::Graph, stats::Stats, Config, Store, Timestamp};
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

use crate::binconfig::{self, BinConfigError};

const FREE: &str = " [stats | show-greylist | show-whitelist | munin GRAPH [config]]";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
	Stats,
	ShowGreylist,
	ShowWhitelist,
	Munin { graph: Graph, config: bool },
}

/// What munin tells a plugin through its environment. `munin` is set when
/// we're running as a plugin at all.
#[derive(Clone, Debug, Default)]
pub struct MuninEnv {
	pub munin: bool,
	pub graph: Option<String>,
	pub config: Option<String>,
}

impl MuninEnv {
	pub fn from_env() -> Self {
		Self {
			munin: std::env::var_os("MUNIN").is_some(),
			graph: std::env::var("MUNIN_GRAPH").ok(),
			config: std::env::var("CONFIG").ok(),
		}
	}
}

pub struct CtlConfig {
	pub config: Config,
	pub command: Command,
	pub deanon: bool,
	pub limit: Option<u64>,
	pub verbosity: usize,
}

impl CtlConfig {
	/// Parses the command line. `Ok(None)` means help was printed and
	/// there is nothing to run.
	pub fn get() -> Result<Option<Self>, CtlError> {
		let args: Vec<String> = std::env::args().collect();
		Self::from_args(&args, &MuninEnv::from_env())
	}

	pub fn from_args(args: &[String], env: &MuninEnv) -> Result<Option<Self>, CtlError> {
		let program = args.first().map(String::as_str).unwrap_or("greyctl");

		let mut opts = binconfig::common_options();
		opts.optflag(
			"",
			"deanon",
			"Show addresses in listings instead of anonymizing them",
		);
		opts.optopt(
			"l",
			"limit",
			"Show at most this many entries in listings",
			"N",
		);

		let matches = opts
			.parse(args.get(1..).unwrap_or_default())
			.map_err(BinConfigError::from)?;

		if matches.opt_present("help") {
			binconfig::print_usage(program, &opts, FREE);
			return Ok(None);
		}

		let config_path = match (matches.opt_str("config"), env.munin) {
			(Some(path), _) => Some(path),
			(None, true) => env.config.clone(),
			(None, false) => None,
		};

		let command = if env.munin {
			munin_command(program, env, &matches.free)?
		} else {
			parse_command(&matches.free)?
		};

		let limit = match matches.opt_str("limit") {
			None => None,
			Some(limit) => Some(limit.parse().map_err(|_| CtlError::Limit(limit))?),
		};

		Ok(Some(Self {
			config: binconfig::load_config(&matches, config_path)?,
			command,
			deanon: matches.opt_present("deanon"),
			limit,
			verbosity: binconfig::verbosity(&matches),
		}))
	}

	/// Runs the command and returns what it prints. The database is only
	/// ever read; a schema that doesn't verify is an error here, rebuilding
	/// it is left to the daemon.
	pub fn run(&self) -> Result<String, CtlError> {
		if let Command::Munin { graph, config: true } = self.command {
			return Ok(graph.config());
		}

		let store = Store::open_read_only(&self.config.db_file).map_err(|source| CtlError::Open {
			path: self.config.db_file.clone(),
			source,
		})?;

		let out = match self.command {
			Command::Stats => Stats::gather(&store, Timestamp::now(), &self.config.stats)?.to_string(),
			Command::Munin { graph, .. } => {
				graph.data(&Stats::gather(&store, Timestamp::now(), &self.config.stats)?)
			}
			Command::ShowGreylist => {
				let entries = store.greylist_entries(self.limit)?;
				if self.deanon {
					listing::greylist(&entries, |address| address.to_owned())
				} else {
					let mut anon = Anonymizer::new(StdRng::from_entropy());
					listing::greylist(&entries, |address| anon.anonymize(address))
				}
			}
			Command::ShowWhitelist => listing::whitelist(&store.whitelist_entries(self.limit)?),
		};

		store.close()?;
		Ok(out)
	}
}

/// Munin picks the graph through `MUNIN_GRAPH`, or by the name the plugin
/// was linked as. The only argument it passes is `config`.
pub fn munin_command(program: &str, env: &MuninEnv, free: &[String]) -> Result<Command, CtlError> {
	let graph = match &env.graph {
		Some(graph) => graph.parse()?,
		None => {
			let name = Path::new(program)
				.file_name()
				.and_then(|name| name.to_str())
				.unwrap_or(program);
			Graph::from_program_name(name)?
		}
	};

	Ok(Command::Munin {
		graph,
		config: free.first().map(String::as_str) == Some("config"),
	})
}

pub fn parse_command(free: &[String]) -> Result<Command, CtlError> {
	let mut free = free.iter().map(String::as_str);

	let command = match free.next() {
		None | Some("stats") => Command::Stats,
		Some("show-greylist") => Command::ShowGreylist,
		Some("show-whitelist") => Command::ShowWhitelist,
		Some("munin") => {
			let graph = free.next().ok_or(CtlError::MissingGraph)?.parse()?;
			Command::Munin {
				graph,
				config: free.next() == Some("config"),
			}
		}
		Some(other) => return Err(CtlError::Command(other.to_owned())),
	};

	Ok(command)
}

#[derive(Debug, Error)]
pub enum CtlError {
	#[error("{0}")]
	BinConfig(#[from] BinConfigError),
	#[error("unknown command '{0}'")]
	Command(String),
	#[error("munin needs a graph: greylist, whitelist, overview or client_names")]
	MissingGraph,
	#[error("{0}")]
	Graph(#[from] grey::munin::UnknownGraph),
	#[error("Failed to parse '{0}' as a limit")]
	Limit(String),
	#[error("could not open {path:?}: {source}")]
	Open {
		path: PathBuf,
		#[source]
		source: grey::StoreError,
	},
	#[error("{0}")]
	Store(#[from] grey::StoreError),
}
