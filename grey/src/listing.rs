//! Human readable dumps of the two lists.

use std::fmt::Write;

use crate::store::{GreylistEntry, WhitelistEntry};

/// Renders greylist entries grouped by recipient. Entries must already be
/// ordered by recipient, as [crate::Store::greylist_entries] returns them.
/// `hide` is applied to every address before it is shown.
pub fn greylist<F>(entries: &[GreylistEntry], mut hide: F) -> String
where
	F: FnMut(&str) -> String,
{
	let mut out = format!("    {:5} {:30} ({})\n", "id", "sender", "client name");
	let mut recipient: Option<&str> = None;

	for entry in entries {
		if recipient != Some(entry.key.recipient.as_str()) {
			recipient = Some(entry.key.recipient.as_str());
			let _ = writeln!(out, "recipient: {}", hide(&entry.key.recipient));
		}

		let _ = writeln!(
			out,
			"    #{:<4} {:30} (from {})\n        first: {}\n        last:  {}",
			entry.id,
			hide(&entry.key.sender),
			entry.key.client_name,
			entry.first_seen.to_seconds_string(),
			entry.last_seen.to_seconds_string()
		);
	}

	out
}

pub fn whitelist(entries: &[WhitelistEntry]) -> String {
	let mut out = format!("{:5} {:40} {:20} {:4}\n", "id", "client name", "last seen", "hitc");

	for entry in entries {
		let _ = writeln!(
			out,
			"#{:<4} {:40} {:20} {:4}",
			entry.id,
			entry.client_name,
			entry.last_seen.to_seconds_string(),
			entry.hit_count
		);
	}

	out
}
