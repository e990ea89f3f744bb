//! The greylisting decision itself.

use std::fmt::Display;

use crate::{
	config::GreylistConfig,
	store::{GreyKey, Store, StoreError},
	timestamp::Timestamp,
};

/// One delivery attempt: which client wants to pass mail from whom to whom
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
	key: GreyKey,
}

impl Observation {
	pub fn new<C, S, R>(client_name: C, sender: S, recipient: R) -> Self
	where
		C: Into<String>,
		S: Into<String>,
		R: Into<String>,
	{
		Self {
			key: GreyKey::new(client_name, sender, recipient),
		}
	}

	pub fn client_name(&self) -> &str {
		&self.key.client_name
	}

	pub fn sender(&self) -> &str {
		&self.key.sender
	}

	pub fn recipient(&self) -> &str {
		&self.key.recipient
	}

	pub fn key(&self) -> &GreyKey {
		&self.key
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
	Pass,
	Defer,
}

impl Display for Verdict {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Verdict::Pass => write!(f, "PASS"),
			Verdict::Defer => write!(f, "DEFER"),
		}
	}
}

pub struct Engine {
	config: GreylistConfig,
}

impl Engine {
	pub fn new(config: GreylistConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> &GreylistConfig {
		&self.config
	}

	/// Decides on one observation made at `now` and records it. Everything
	/// happens in a single write transaction, so two processes seeing the
	/// same triple at once are serialized. Nothing is recorded if an error
	/// is returned.
	pub fn decide(
		&self,
		store: &mut Store,
		now: Timestamp,
		obs: &Observation,
	) -> Result<Verdict, StoreError> {
		tracing::debug!(
			"processing request: sender={:?}, recipient={:?}, client_name={:?}",
			obs.sender(),
			obs.recipient(),
			obs.client_name()
		);

		let tx = store.immediate()?;

		if let Some(threshold) = self.config.auto_whitelist_threshold {
			if let Some(entry) = tx.whitelist_entry(obs.client_name())? {
				if entry.hit_count >= threshold {
					tracing::debug!("whitelist check: client_name={:?} succeeded", obs.client_name());
					return Ok(Verdict::Pass);
				}
			}
		}

		let key = obs.key();
		let entry = match tx.greylist_entry(key)? {
			Some(entry) => entry,
			None => {
				if tx.insert_greylist(key, now)? {
					tracing::debug!("greylist check: no match, created new entry");
					tx.commit()?;
					return Ok(Verdict::Defer);
				}

				// Somebody else got the row in first, use theirs
				tx.greylist_entry(key)?.ok_or(StoreError::Sqlite(
					rusqlite::Error::QueryReturnedNoRows,
				))?
			}
		};

		tracing::debug!("greylist check: match, first_seen={}", entry.first_seen);

		let verdict = if now - entry.first_seen >= self.config.greylist_timeout {
			tracing::debug!("greylist check: passed, increasing whitelist hit counter");
			tx.hit_whitelist(obs.client_name(), now)?;

			if self.config.move_to_whitelist {
				tx.delete_greylist(key)?;
			}

			Verdict::Pass
		} else {
			tracing::debug!("greylist check: defer");
			tx.touch_greylist(key, now)?;
			Verdict::Defer
		};

		tx.commit()?;
		Ok(verdict)
	}
}
