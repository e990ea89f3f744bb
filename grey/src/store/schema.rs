use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

/// What kind of object a schema entry is, as sqlite_master names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
	Table,
	Index,
}

impl ObjectKind {
	fn as_str(&self) -> &'static str {
		match self {
			ObjectKind::Table => "table",
			ObjectKind::Index => "index",
		}
	}
}

pub struct SchemaObject {
	pub kind: ObjectKind,
	pub name: &'static str,
	pub sql: &'static str,
}

// Tables come first, recreation relies on it.
pub const SCHEMA: [SchemaObject; 4] = [
	SchemaObject {
		kind: ObjectKind::Table,
		name: "greylist",
		sql: "CREATE TABLE greylist (id INTEGER PRIMARY KEY, client_name TEXT, sender TEXT, recipient TEXT, first_seen TIMESTAMP, last_seen TIMESTAMP, CONSTRAINT match UNIQUE (client_name, sender, recipient))",
	},
	SchemaObject {
		kind: ObjectKind::Table,
		name: "whitelist",
		sql: "CREATE TABLE whitelist (id INTEGER PRIMARY KEY, client_name TEXT, last_seen TIMESTAMP, hit_count INTEGER, CONSTRAINT client_name UNIQUE (client_name))",
	},
	SchemaObject {
		kind: ObjectKind::Index,
		name: "greylist_last_seen",
		sql: "CREATE INDEX greylist_last_seen ON greylist (last_seen)",
	},
	SchemaObject {
		kind: ObjectKind::Index,
		name: "whitelist_last_seen",
		sql: "CREATE INDEX whitelist_last_seen ON whitelist (last_seen)",
	},
];

/// One row of sqlite_master that is not an sqlite internal
struct MasterRow {
	kind: String,
	name: String,
	sql: String,
}

fn user_objects(conn: &Connection) -> rusqlite::Result<Vec<MasterRow>> {
	let mut stmt = conn.prepare(
		"SELECT type, name, sql FROM sqlite_master
		WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'",
	)?;

	let rows = stmt.query_map([], |row| {
		Ok(MasterRow {
			kind: row.get(0)?,
			name: row.get(1)?,
			sql: row.get(2)?,
		})
	})?;

	rows.collect()
}

/// Checks the database against [SCHEMA]. Every user object must be one we
/// know with exactly the SQL we would have created it with, and every
/// object we know must be present.
pub fn verify(conn: &Connection) -> Result<(), SchemaError> {
	let found = user_objects(conn)?;

	for row in &found {
		let expected = SCHEMA
			.iter()
			.find(|obj| obj.kind.as_str() == row.kind && obj.name == row.name)
			.ok_or_else(|| SchemaError::Unexpected {
				kind: row.kind.clone(),
				name: row.name.clone(),
			})?;

		if expected.sql != row.sql {
			return Err(SchemaError::Differs {
				name: row.name.clone(),
				found: row.sql.clone(),
				expected: expected.sql,
			});
		}
	}

	let missing: Vec<&str> = SCHEMA
		.iter()
		.filter(|obj| {
			!found
				.iter()
				.any(|row| row.kind == obj.kind.as_str() && row.name == obj.name)
		})
		.map(|obj| obj.name)
		.collect();

	if !missing.is_empty() {
		return Err(SchemaError::Missing(missing.join(", ")));
	}

	Ok(())
}

/// Verifies the schema and rebuilds it if that fails, returning what was
/// wrong when it had to rebuild. The check is repeated under the write
/// lock, so of several processes opening the same database only the first
/// rebuilds it and the others keep what it wrote.
pub fn verify_or_recreate(conn: &mut Connection) -> rusqlite::Result<Option<SchemaError>> {
	if verify(conn).is_ok() {
		return Ok(None);
	}

	let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
	let outcome = match verify(&tx) {
		Ok(()) => {
			tracing::debug!("schema was repaired while waiting for the write lock");
			None
		}
		Err(err) => {
			rebuild(&tx)?;
			Some(err)
		}
	};

	tx.commit()?;
	Ok(outcome)
}

/// Drops every user object and creates [SCHEMA] from scratch. All existing
/// history is lost.
pub fn recreate(conn: &mut Connection) -> rusqlite::Result<()> {
	let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
	rebuild(&tx)?;
	tx.commit()
}

// Expects to run inside a write transaction
fn rebuild(conn: &Connection) -> rusqlite::Result<()> {
	let found = user_objects(conn)?;
	// Indexes and triggers go away with their tables, but a stray one might
	// sit on a table we don't own
	for row in found.iter().filter(|row| row.kind != "table") {
		tracing::info!("dropping {} {}", row.kind, row.name);
		conn.execute_batch(&format!(
			"DROP {} IF EXISTS \"{}\"",
			row.kind.to_uppercase(),
			row.name.replace('"', "\"\"")
		))?;
	}
	for row in found.iter().filter(|row| row.kind == "table") {
		tracing::info!("dropping table {}", row.name);
		conn.execute_batch(&format!(
			"DROP TABLE IF EXISTS \"{}\"",
			row.name.replace('"', "\"\"")
		))?;
	}

	for obj in &SCHEMA {
		tracing::info!("creating {} {}", obj.kind.as_str(), obj.name);
		conn.execute_batch(obj.sql)?;
	}

	Ok(())
}

#[derive(Debug, Error)]
pub enum SchemaError {
	#[error("could not read the schema: {0}")]
	Unreadable(#[from] rusqlite::Error),
	#[error("unexpected {kind}: {name}")]
	Unexpected { kind: String, name: String },
	#[error("schema of {name} differs, found {found:?}, expected {expected:?}")]
	Differs {
		name: String,
		found: String,
		expected: &'static str,
	},
	#[error("missing: {0}")]
	Missing(String),
}
