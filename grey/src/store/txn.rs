use rusqlite::{params, OptionalExtension, Transaction};

use super::{GreyKey, GreylistEntry, StoreError, WhitelistEntry};
use crate::timestamp::Timestamp;

/// An open transaction on the store. Nothing is written until [Txn::commit];
/// dropping it rolls back.
pub struct Txn<'s> {
	tx: Transaction<'s>,
}

impl<'s> Txn<'s> {
	pub(super) fn new(tx: Transaction<'s>) -> Self {
		Self { tx }
	}

	pub fn commit(self) -> Result<(), StoreError> {
		Ok(self.tx.commit()?)
	}

	pub fn greylist_entry(&self, key: &GreyKey) -> Result<Option<GreylistEntry>, StoreError> {
		Ok(self
			.tx
			.query_row(
				"SELECT id, client_name, sender, recipient, first_seen, last_seen
				FROM greylist
				WHERE client_name = ?1 AND sender = ?2 AND recipient = ?3",
				key.params(),
				GreylistEntry::from_row,
			)
			.optional()?)
	}

	/// Inserts a fresh entry seen for the first time at `now`. Returns false
	/// if the key already existed, in which case nothing changed.
	pub fn insert_greylist(&self, key: &GreyKey, now: Timestamp) -> Result<bool, StoreError> {
		let inserted = self.tx.execute(
			"INSERT OR IGNORE INTO greylist (client_name, sender, recipient, first_seen, last_seen)
			VALUES (?1, ?2, ?3, ?4, ?4)",
			params![key.client_name, key.sender, key.recipient, now],
		)?;

		Ok(inserted > 0)
	}

	pub fn touch_greylist(&self, key: &GreyKey, now: Timestamp) -> Result<bool, StoreError> {
		let updated = self.tx.execute(
			"UPDATE greylist SET last_seen = ?4
			WHERE client_name = ?1 AND sender = ?2 AND recipient = ?3",
			params![key.client_name, key.sender, key.recipient, now],
		)?;

		Ok(updated > 0)
	}

	pub fn delete_greylist(&self, key: &GreyKey) -> Result<bool, StoreError> {
		let deleted = self.tx.execute(
			"DELETE FROM greylist
			WHERE client_name = ?1 AND sender = ?2 AND recipient = ?3",
			key.params(),
		)?;

		Ok(deleted > 0)
	}

	pub fn whitelist_entry(&self, client_name: &str) -> Result<Option<WhitelistEntry>, StoreError> {
		Ok(self
			.tx
			.query_row(
				"SELECT id, client_name, last_seen, hit_count
				FROM whitelist
				WHERE client_name = ?1",
				[client_name],
				WhitelistEntry::from_row,
			)
			.optional()?)
	}

	/// Records one more qualifying pass for `client_name`, creating its
	/// whitelist entry at zero hits first if there is none.
	pub fn hit_whitelist(&self, client_name: &str, now: Timestamp) -> Result<(), StoreError> {
		self.tx.execute(
			"INSERT OR IGNORE INTO whitelist (client_name, last_seen, hit_count)
			VALUES (?1, ?2, 0)",
			params![client_name, now],
		)?;
		self.tx.execute(
			"UPDATE whitelist SET last_seen = ?2, hit_count = hit_count + 1
			WHERE client_name = ?1",
			params![client_name, now],
		)?;

		Ok(())
	}

	/// Deletes greylist entries last seen at or before `cutoff`
	pub fn expire_greylist(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
		Ok(self
			.tx
			.execute("DELETE FROM greylist WHERE last_seen <= ?1", [cutoff])?)
	}

	/// Deletes whitelist entries last seen at or before `cutoff`
	pub fn expire_whitelist(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
		Ok(self
			.tx
			.execute("DELETE FROM whitelist WHERE last_seen <= ?1", [cutoff])?)
	}

	pub fn count_greylist(&self) -> Result<u64, StoreError> {
		Ok(self
			.tx
			.query_row("SELECT COUNT(*) FROM greylist", [], |row| row.get(0))?)
	}

	pub fn count_whitelist(&self) -> Result<u64, StoreError> {
		Ok(self
			.tx
			.query_row("SELECT COUNT(*) FROM whitelist", [], |row| row.get(0))?)
	}

	/// Every client name holding more than `cap` greylist entries, with its count
	pub fn clients_over(&self, cap: u64) -> Result<Vec<(String, u64)>, StoreError> {
		let mut stmt = self.tx.prepare(
			"SELECT client_name, COUNT(*) AS count
			FROM greylist
			GROUP BY client_name
			HAVING count > ?1
			ORDER BY client_name",
		)?;

		let rows = stmt.query_map([cap], |row| Ok((row.get(0)?, row.get(1)?)))?;
		let clients = rows.collect::<Result<Vec<_>, _>>()?;
		Ok(clients)
	}

	/// Deletes the `count` least recently seen greylist entries of one client
	pub fn evict_oldest_greylist_of(&self, client_name: &str, count: u64) -> Result<usize, StoreError> {
		Ok(self.tx.execute(
			"DELETE FROM greylist WHERE id IN (
				SELECT id FROM greylist
				WHERE client_name = ?1
				ORDER BY last_seen ASC, id ASC
				LIMIT ?2
			)",
			params![client_name, count],
		)?)
	}

	/// Deletes the `count` least recently seen greylist entries
	pub fn evict_oldest_greylist(&self, count: u64) -> Result<usize, StoreError> {
		Ok(self.tx.execute(
			"DELETE FROM greylist WHERE id IN (
				SELECT id FROM greylist ORDER BY last_seen ASC, id ASC LIMIT ?1
			)",
			[count],
		)?)
	}

	/// Deletes the `count` least recently seen whitelist entries
	pub fn evict_oldest_whitelist(&self, count: u64) -> Result<usize, StoreError> {
		Ok(self.tx.execute(
			"DELETE FROM whitelist WHERE id IN (
				SELECT id FROM whitelist ORDER BY last_seen ASC, id ASC LIMIT ?1
			)",
			[count],
		)?)
	}
}
