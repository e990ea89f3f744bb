use std::fmt::Display;

use crate::{
	config::StatsConfig,
	store::{Store, StoreError},
	timestamp::Timestamp,
};

/// Entry counts for one of the two lists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListStats {
	pub total: u64,
	pub active: u64,
}

impl ListStats {
	pub fn inactive(&self) -> u64 {
		self.total.saturating_sub(self.active)
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
	pub greylist: ListStats,
	pub whitelist: ListStats,
	pub distinct_client_names: u64,
	/// Greylist entries that were never retried and have gone quiet
	pub dead_greylist: u64,
	/// Whitelist entries that haven't reached the threshold yet
	pub pending_whitelist: u64,
}

impl Stats {
	pub fn gather(store: &Store, now: Timestamp, config: &StatsConfig) -> Result<Self, StoreError> {
		let greylist_total = store.count_greylist()?;
		let whitelist_total = store.count_whitelist()?;

		// Without a threshold, or with one reaching back past the beginning
		// of time, everything is active
		let active_since = config.active_threshold.and_then(|age| now.checked_sub(age));
		let (greylist_active, whitelist_active) = match active_since {
			None => (greylist_total, whitelist_total),
			Some(since) => (
				store.count_greylist_since(since)?,
				store.count_whitelist_since(since)?,
			),
		};

		let dead_greylist = match config.dead_threshold.and_then(|age| now.checked_sub(age)) {
			Some(before) => store.count_greylist_unrenewed_before(before)?,
			None => 0,
		};

		let pending_whitelist = match config.auto_whitelist_threshold {
			Some(threshold) => store.count_whitelist_below(threshold)?,
			None => 0,
		};

		Ok(Self {
			greylist: ListStats {
				total: greylist_total,
				active: greylist_active,
			},
			whitelist: ListStats {
				total: whitelist_total,
				active: whitelist_active,
			},
			distinct_client_names: store.count_distinct_client_names()?,
			dead_greylist,
			pending_whitelist,
		})
	}
}

impl Display for Stats {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "total_greylist {}", self.greylist.total)?;
		writeln!(f, "active_greylist {}", self.greylist.active)?;
		writeln!(f, "total_whitelist {}", self.whitelist.total)?;
		writeln!(f, "active_whitelist {}", self.whitelist.active)?;
		writeln!(f, "distinct_greylist_client_names {}", self.distinct_client_names)?;
		writeln!(f, "dead_greylist {}", self.dead_greylist)?;
		writeln!(f, "pending_whitelist {}", self.pending_whitelist)
	}
}
