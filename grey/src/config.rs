use std::{path::PathBuf, str::FromStr};

use thiserror::Error;
use time::Duration;

/// Values that switch a numeric option off
const DISABLED: [&str; 3] = ["none", "off", "disabled"];

/// Everything the daemon and its tools can be told through the config file.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
	pub db_file: PathBuf,
	pub greylist: GreylistConfig,
	pub collector: CollectorConfig,
	pub stats: StatsConfig,
	pub responses: ResponseConfig,
}

/// Thresholds used when deciding on a single request
#[derive(Clone, Debug, PartialEq)]
pub struct GreylistConfig {
	/// Hits a client needs before it skips greylisting. `None` turns the
	/// whitelist check off entirely.
	pub auto_whitelist_threshold: Option<u64>,
	/// How long after first contact a retry is let through
	pub greylist_timeout: Duration,
	/// Delete the greylist entry once it has passed instead of keeping it
	/// around until it's collected
	pub move_to_whitelist: bool,
}

/// Bounds enforced after each decision. `None` disables the bound.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectorConfig {
	pub max_greylist_entries: Option<u64>,
	pub max_greylist_entries_per_client_name: Option<u64>,
	pub max_whitelist_entries: Option<u64>,
	pub greylist_expire: Option<Duration>,
	pub whitelist_expire: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatsConfig {
	/// Entries seen within this window count as active. `None` counts
	/// everything as active.
	pub active_threshold: Option<Duration>,
	/// Greylist entries never seen again after this long count as dead.
	/// `None` counts nothing as dead.
	pub dead_threshold: Option<Duration>,
	pub auto_whitelist_threshold: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseConfig {
	pub pass: String,
	pub defer: String,
	pub malformed: MalformedAction,
}

/// What to answer when a request can't be evaluated at all
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedAction {
	Pass,
	Defer,
}

impl FromStr for MalformedAction {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"pass" => Ok(Self::Pass),
			"defer" => Ok(Self::Defer),
			_ => Err(()),
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			db_file: PathBuf::from("greylist.db"),
			greylist: GreylistConfig::default(),
			collector: CollectorConfig::default(),
			stats: StatsConfig::default(),
			responses: ResponseConfig::default(),
		}
	}
}

impl Default for GreylistConfig {
	fn default() -> Self {
		Self {
			auto_whitelist_threshold: Some(10),
			greylist_timeout: Duration::seconds(60),
			move_to_whitelist: false,
		}
	}
}

impl Default for CollectorConfig {
	fn default() -> Self {
		Self {
			max_greylist_entries: Some(100_000),
			max_greylist_entries_per_client_name: Some(1_000),
			max_whitelist_entries: Some(1_000),
			greylist_expire: None,
			whitelist_expire: None,
		}
	}
}

impl Default for StatsConfig {
	fn default() -> Self {
		Self {
			active_threshold: Some(Duration::seconds(3600)),
			dead_threshold: Some(Duration::days(1)),
			auto_whitelist_threshold: Some(10),
		}
	}
}

impl Default for ResponseConfig {
	fn default() -> Self {
		Self {
			pass: String::from("action=dunno"),
			defer: String::from("action=defer_if_permit You have been greylisted."),
			malformed: MalformedAction::Defer,
		}
	}
}

impl Config {
	/// Builds a config from a key lookup, falling back to the defaults for
	/// every key the lookup doesn't know. Keys are kebab-case option names
	/// like `greylist-timeout`; mapping them onto a file format is up to
	/// the caller.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut config = Config::default();
		let get = |key: &'static str| lookup(key).map(|v| (key, v.trim().to_owned()));

		if let Some((_, value)) = get("db-file") {
			config.db_file = PathBuf::from(value);
		}

		if let Some((key, value)) = get("auto-whitelist-threshold") {
			config.greylist.auto_whitelist_threshold = parse_limit(key, &value)?;
		}
		if let Some((key, value)) = get("greylist-timeout") {
			config.greylist.greylist_timeout =
				parse_seconds(key, &value)?.unwrap_or(Duration::ZERO);
		}
		if let Some((key, value)) = get("move-to-whitelist") {
			config.greylist.move_to_whitelist = parse_bool(key, &value)?;
		}

		if let Some((key, value)) = get("max-greylist-entries") {
			config.collector.max_greylist_entries = parse_limit(key, &value)?;
		}
		if let Some((key, value)) = get("max-greylist-entries-per-client-name") {
			config.collector.max_greylist_entries_per_client_name = parse_limit(key, &value)?;
		}
		if let Some((key, value)) = get("max-whitelist-entries") {
			config.collector.max_whitelist_entries = parse_limit(key, &value)?;
		}
		if let Some((key, value)) = get("greylist-expire") {
			config.collector.greylist_expire = parse_seconds(key, &value)?;
		}
		if let Some((key, value)) = get("whitelist-expire") {
			config.collector.whitelist_expire = parse_seconds(key, &value)?;
		}

		if let Some((key, value)) = get("stats-active-threshold") {
			config.stats.active_threshold = parse_seconds(key, &value)?;
		}
		if let Some((key, value)) = get("stats-dead-threshold") {
			config.stats.dead_threshold = parse_seconds(key, &value)?;
		}
		config.stats.auto_whitelist_threshold = config.greylist.auto_whitelist_threshold;

		if let Some((_, value)) = get("pass-response") {
			config.responses.pass = value;
		}
		if let Some((_, value)) = get("defer-response") {
			config.responses.defer = value;
		}
		if let Some((key, value)) = get("malformed-request") {
			config.responses.malformed = value
				.parse()
				.map_err(|_| ConfigError::invalid(key, &value, "expected 'pass' or 'defer'"))?;
		}

		Ok(config)
	}
}

fn is_disabled(value: &str) -> bool {
	DISABLED.contains(&value.to_lowercase().as_str())
}

fn parse_limit(key: &'static str, value: &str) -> Result<Option<u64>, ConfigError> {
	if is_disabled(value) {
		return Ok(None);
	}

	value
		.parse()
		.map(Some)
		.map_err(|_| ConfigError::invalid(key, value, "expected a whole number or 'none'"))
}

fn parse_seconds(key: &'static str, value: &str) -> Result<Option<Duration>, ConfigError> {
	match parse_limit(key, value)? {
		None => Ok(None),
		Some(secs) => i64::try_from(secs)
			.map(|secs| Some(Duration::seconds(secs)))
			.map_err(|_| ConfigError::invalid(key, value, "too many seconds")),
	}
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
	match value.to_lowercase().as_str() {
		"true" | "yes" | "on" | "1" => Ok(true),
		"false" | "no" | "off" | "0" => Ok(false),
		_ => Err(ConfigError::invalid(key, value, "expected 'true' or 'false'")),
	}
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
	#[error("invalid value '{value}' for {key}: {reason}")]
	InvalidValue {
		key: &'static str,
		value: String,
		reason: &'static str,
	},
}

impl ConfigError {
	fn invalid(key: &'static str, value: &str, reason: &'static str) -> Self {
		Self::InvalidValue {
			key,
			value: value.to_owned(),
			reason,
		}
	}
}
