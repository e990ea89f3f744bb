use rusqlite::Row;

use crate::timestamp::Timestamp;

/// The triple a greylist entry is keyed on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GreyKey {
	pub client_name: String,
	pub sender: String,
	pub recipient: String,
}

impl GreyKey {
	pub fn new<C, S, R>(client_name: C, sender: S, recipient: R) -> Self
	where
		C: Into<String>,
		S: Into<String>,
		R: Into<String>,
	{
		Self {
			client_name: client_name.into(),
			sender: sender.into(),
			recipient: recipient.into(),
		}
	}

	pub(crate) fn params(&self) -> [&str; 3] {
		[&self.client_name, &self.sender, &self.recipient]
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct GreylistEntry {
	pub id: i64,
	pub key: GreyKey,
	pub first_seen: Timestamp,
	pub last_seen: Timestamp,
}

impl GreylistEntry {
	/// Expects the columns `id, client_name, sender, recipient, first_seen, last_seen`
	pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(Self {
			id: row.get(0)?,
			key: GreyKey {
				client_name: row.get(1)?,
				sender: row.get(2)?,
				recipient: row.get(3)?,
			},
			first_seen: row.get(4)?,
			last_seen: row.get(5)?,
		})
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhitelistEntry {
	pub id: i64,
	pub client_name: String,
	pub last_seen: Timestamp,
	pub hit_count: u64,
}

impl WhitelistEntry {
	/// Expects the columns `id, client_name, last_seen, hit_count`
	pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(Self {
			id: row.get(0)?,
			client_name: row.get(1)?,
			last_seen: row.get(2)?,
			hit_count: row.get(3)?,
		})
	}
}
