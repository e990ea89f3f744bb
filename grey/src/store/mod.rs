//! Persistence for the greylist and whitelist relations.
//!
//! The [Store] owns the sqlite connection. Decisions and collection steps
//! each run inside a [Txn], which exposes the handful of primitives they
//! need and nothing else.

mod entry;
mod schema;
mod txn;

use std::{path::Path, time::Duration};

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::timestamp::Timestamp;

pub use entry::{GreyKey, GreylistEntry, WhitelistEntry};
pub use schema::{SchemaError, SCHEMA};
pub use txn::Txn;

/// How long to wait on another process holding the write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Store {
	conn: Connection,
}

/// What happened to the schema while opening
#[derive(Debug)]
pub enum SchemaStatus {
	Verified,
	Recreated(SchemaError),
}

impl Store {
	/// Opens the database at `path`, creating it if needed, and makes sure
	/// the schema is usable. A schema that fails verification is recreated,
	/// which throws away all stored history.
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
		tracing::debug!("opening database at {}", path.as_ref().display());
		let conn = Connection::open(path)?;
		Self::prepare(conn).map(|(store, _)| store)
	}

	pub fn open_in_memory() -> Result<Self, StoreError> {
		let conn = Connection::open_in_memory()?;
		Self::prepare(conn).map(|(store, _)| store)
	}

	/// Like [Store::open], but also reports whether the schema was recreated.
	pub fn open_with_status<P: AsRef<Path>>(path: P) -> Result<(Self, SchemaStatus), StoreError> {
		let conn = Connection::open(path)?;
		Self::prepare(conn)
	}

	/// Opens an existing database for reading only. Nothing is created and
	/// a schema that fails verification is reported instead of rebuilt.
	pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
		tracing::debug!("opening database at {} read only", path.as_ref().display());
		let conn = Connection::open_with_flags(
			path,
			OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
		)?;
		conn.busy_timeout(BUSY_TIMEOUT)?;

		let store = Self { conn };
		store.verify_schema()?;
		Ok(store)
	}

	fn prepare(mut conn: Connection) -> Result<(Self, SchemaStatus), StoreError> {
		conn.busy_timeout(BUSY_TIMEOUT)?;

		let status = match schema::verify_or_recreate(&mut conn)? {
			None => {
				tracing::info!("database schema verified successfully");
				SchemaStatus::Verified
			}
			Some(err) => {
				tracing::warn!("database schema had errors: {}", err);
				tracing::warn!("recreated the database, all greylist and whitelist entries are lost");
				SchemaStatus::Recreated(err)
			}
		};

		Ok((Self { conn }, status))
	}

	pub fn verify_schema(&self) -> Result<(), SchemaError> {
		schema::verify(&self.conn)
	}

	/// Drops and rebuilds both relations. This deletes every entry.
	pub fn recreate_schema(&mut self) -> Result<(), StoreError> {
		schema::recreate(&mut self.conn)?;
		Ok(())
	}

	pub fn close(self) -> Result<(), StoreError> {
		self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
	}

	/// Starts a write transaction. The write lock is taken immediately so
	/// that a read-check-write sequence can't interleave with another
	/// process doing the same, and waiting for it honours the busy timeout.
	pub fn immediate(&mut self) -> Result<Txn<'_>, StoreError> {
		let tx = self
			.conn
			.transaction_with_behavior(TransactionBehavior::Immediate)?;
		Ok(Txn::new(tx))
	}

	pub fn count_greylist(&self) -> Result<u64, StoreError> {
		Ok(self
			.conn
			.query_row("SELECT COUNT(*) FROM greylist", [], |row| row.get(0))?)
	}

	pub fn count_whitelist(&self) -> Result<u64, StoreError> {
		Ok(self
			.conn
			.query_row("SELECT COUNT(*) FROM whitelist", [], |row| row.get(0))?)
	}

	/// Greylist entries with `last_seen` at or after `since`
	pub fn count_greylist_since(&self, since: Timestamp) -> Result<u64, StoreError> {
		Ok(self.conn.query_row(
			"SELECT COUNT(*) FROM greylist WHERE last_seen >= ?1",
			[since],
			|row| row.get(0),
		)?)
	}

	pub fn count_whitelist_since(&self, since: Timestamp) -> Result<u64, StoreError> {
		Ok(self.conn.query_row(
			"SELECT COUNT(*) FROM whitelist WHERE last_seen >= ?1",
			[since],
			|row| row.get(0),
		)?)
	}

	/// Greylist entries that were never seen again and went quiet before
	/// `before`
	pub fn count_greylist_unrenewed_before(&self, before: Timestamp) -> Result<u64, StoreError> {
		Ok(self.conn.query_row(
			"SELECT COUNT(*) FROM greylist WHERE first_seen = last_seen AND last_seen < ?1",
			[before],
			|row| row.get(0),
		)?)
	}

	pub fn count_whitelist_below(&self, hit_count: u64) -> Result<u64, StoreError> {
		Ok(self.conn.query_row(
			"SELECT COUNT(*) FROM whitelist WHERE hit_count < ?1",
			[hit_count],
			|row| row.get(0),
		)?)
	}

	pub fn count_distinct_client_names(&self) -> Result<u64, StoreError> {
		Ok(self.conn.query_row(
			"SELECT COUNT(DISTINCT client_name) FROM greylist",
			[],
			|row| row.get(0),
		)?)
	}

	/// Greylist entries ordered for display: by recipient and sender, most
	/// recently seen first.
	pub fn greylist_entries(&self, limit: Option<u64>) -> Result<Vec<GreylistEntry>, StoreError> {
		let mut stmt = self.conn.prepare(
			"SELECT id, client_name, sender, recipient, first_seen, last_seen
			FROM greylist
			ORDER BY recipient ASC, sender ASC, last_seen DESC
			LIMIT ?1",
		)?;

		let rows = stmt.query_map([limit_param(limit)], GreylistEntry::from_row)?;
		let entries = rows.collect::<Result<Vec<_>, _>>()?;
		Ok(entries)
	}

	pub fn whitelist_entries(&self, limit: Option<u64>) -> Result<Vec<WhitelistEntry>, StoreError> {
		let mut stmt = self.conn.prepare(
			"SELECT id, client_name, last_seen, hit_count
			FROM whitelist
			ORDER BY client_name ASC, last_seen DESC
			LIMIT ?1",
		)?;

		let rows = stmt.query_map([limit_param(limit)], WhitelistEntry::from_row)?;
		let entries = rows.collect::<Result<Vec<_>, _>>()?;
		Ok(entries)
	}

	pub fn greylist_entry(&self, key: &GreyKey) -> Result<Option<GreylistEntry>, StoreError> {
		Ok(self
			.conn
			.query_row(
				"SELECT id, client_name, sender, recipient, first_seen, last_seen
				FROM greylist
				WHERE client_name = ?1 AND sender = ?2 AND recipient = ?3",
				key.params(),
				GreylistEntry::from_row,
			)
			.optional()?)
	}

	pub fn whitelist_entry(&self, client_name: &str) -> Result<Option<WhitelistEntry>, StoreError> {
		Ok(self
			.conn
			.query_row(
				"SELECT id, client_name, last_seen, hit_count
				FROM whitelist
				WHERE client_name = ?1",
				[client_name],
				WhitelistEntry::from_row,
			)
			.optional()?)
	}
}

// sqlite reads a negative LIMIT as no limit at all
fn limit_param(limit: Option<u64>) -> i64 {
	limit
		.and_then(|limit| i64::try_from(limit).ok())
		.unwrap_or(-1)
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("sqlite error: {0}")]
	Sqlite(#[from] rusqlite::Error),
	#[error("schema error: {0}")]
	Schema(#[from] SchemaError),
}
