//! Keeps the greylist and whitelist bounded.
//!
//! A pass runs four steps, each in its own transaction: expiry by age, the
//! per-client greylist cap, the global greylist cap and the global
//! whitelist cap. Expired rows are gone before anything is counted, and
//! single clients are trimmed before everybody loses their oldest entries.
//! If a step fails the ones before it stay done, and the next pass picks
//! up from whatever state is left.

use std::fmt::Display;

use thiserror::Error;

use crate::{
	config::CollectorConfig,
	store::{Store, StoreError},
	timestamp::Timestamp,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
	Expire,
	ClientCap,
	GreylistCap,
	WhitelistCap,
}

impl Display for Step {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}",
			match self {
				Step::Expire => "expiry",
				Step::ClientCap => "per-client greylist cap",
				Step::GreylistCap => "greylist cap",
				Step::WhitelistCap => "whitelist cap",
			}
		)
	}
}

/// How many rows each step removed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
	pub greylist_expired: usize,
	pub whitelist_expired: usize,
	/// Clients that were over their cap, with the number of rows removed
	pub clients_capped: Vec<(String, usize)>,
	pub greylist_evicted: usize,
	pub whitelist_evicted: usize,
}

impl CollectReport {
	pub fn total(&self) -> usize {
		self.greylist_expired
			+ self.whitelist_expired
			+ self.clients_capped.iter().map(|(_, n)| n).sum::<usize>()
			+ self.greylist_evicted
			+ self.whitelist_evicted
	}
}

pub struct Collector {
	config: CollectorConfig,
}

impl Collector {
	pub fn new(config: CollectorConfig) -> Self {
		Self { config }
	}

	pub fn collect(&self, store: &mut Store, now: Timestamp) -> Result<CollectReport, CollectError> {
		let mut report = CollectReport::default();

		self.expire(store, now, &mut report)
			.map_err(CollectError::at(Step::Expire))?;
		self.cap_clients(store, &mut report)
			.map_err(CollectError::at(Step::ClientCap))?;
		self.cap_greylist(store, &mut report)
			.map_err(CollectError::at(Step::GreylistCap))?;
		self.cap_whitelist(store, &mut report)
			.map_err(CollectError::at(Step::WhitelistCap))?;

		Ok(report)
	}

	fn expire(&self, store: &mut Store, now: Timestamp, report: &mut CollectReport) -> Result<(), StoreError> {
		let greylist_cutoff = self.config.greylist_expire.and_then(|age| now.checked_sub(age));
		let whitelist_cutoff = self.config.whitelist_expire.and_then(|age| now.checked_sub(age));

		if greylist_cutoff.is_none() && whitelist_cutoff.is_none() {
			return Ok(());
		}

		let tx = store.immediate()?;

		if let Some(cutoff) = greylist_cutoff {
			report.greylist_expired = tx.expire_greylist(cutoff)?;
		}
		if let Some(cutoff) = whitelist_cutoff {
			report.whitelist_expired = tx.expire_whitelist(cutoff)?;
		}

		tx.commit()?;

		if report.greylist_expired > 0 {
			tracing::info!("removed {} greylist entries due to expiry", report.greylist_expired);
		}
		if report.whitelist_expired > 0 {
			tracing::info!("removed {} whitelist entries due to expiry", report.whitelist_expired);
		}

		Ok(())
	}

	fn cap_clients(&self, store: &mut Store, report: &mut CollectReport) -> Result<(), StoreError> {
		let cap = match self.config.max_greylist_entries_per_client_name {
			Some(cap) => cap,
			None => return Ok(()),
		};

		let tx = store.immediate()?;

		// Only kicks in when there is no global cap or the global cap is
		// already blown
		if let Some(max) = self.config.max_greylist_entries {
			if tx.count_greylist()? <= max {
				return Ok(());
			}
		}

		for (client_name, count) in tx.clients_over(cap)? {
			tracing::warn!("client_name={:?} crossed entry limit, count={}", client_name, count);
			let purged = tx.evict_oldest_greylist_of(&client_name, count - cap)?;
			tracing::info!("purged {} entries from client_name={:?}", purged, client_name);
			report.clients_capped.push((client_name, purged));
		}

		tx.commit()?;
		Ok(())
	}

	fn cap_greylist(&self, store: &mut Store, report: &mut CollectReport) -> Result<(), StoreError> {
		let max = match self.config.max_greylist_entries {
			Some(max) => max,
			None => return Ok(()),
		};

		let tx = store.immediate()?;
		let count = tx.count_greylist()?;
		if count > max {
			tracing::info!("purging {} entries from greylist (oversized)", count - max);
			report.greylist_evicted = tx.evict_oldest_greylist(count - max)?;
			tx.commit()?;
		}

		Ok(())
	}

	fn cap_whitelist(&self, store: &mut Store, report: &mut CollectReport) -> Result<(), StoreError> {
		let max = match self.config.max_whitelist_entries {
			Some(max) => max,
			None => return Ok(()),
		};

		let tx = store.immediate()?;
		let count = tx.count_whitelist()?;
		if count > max {
			tracing::info!("purging {} entries from whitelist (oversized)", count - max);
			report.whitelist_evicted = tx.evict_oldest_whitelist(count - max)?;
			tx.commit()?;
		}

		Ok(())
	}
}

#[derive(Debug, Error)]
#[error("garbage collection failed during {step}: {source}")]
pub struct CollectError {
	pub step: Step,
	#[source]
	pub source: StoreError,
}

impl CollectError {
	fn at(step: Step) -> impl Fn(StoreError) -> Self {
		move |source| Self { step, source }
	}
}

#[cfg(test)]
mod test {
	use time::Duration;

	use super::*;
	use crate::store::GreyKey;

	fn at(s: &str) -> Timestamp {
		s.parse().unwrap()
	}

	fn unbounded() -> CollectorConfig {
		CollectorConfig {
			max_greylist_entries: None,
			max_greylist_entries_per_client_name: None,
			max_whitelist_entries: None,
			greylist_expire: None,
			whitelist_expire: None,
		}
	}

	/// Adds greylist entries for `client`, the nth one last seen n seconds
	/// after midnight
	fn fill(store: &mut Store, client: &str, seconds: &[u32]) {
		let tx = store.immediate().unwrap();
		for s in seconds {
			let now = at("2024-01-01 00:00:00")
				.checked_add(Duration::seconds(i64::from(*s)))
				.unwrap();
			tx.insert_greylist(&GreyKey::new(client, format!("s{}@x", s), "r@y"), now)
				.unwrap();
		}
		tx.commit().unwrap();
	}

	fn greylist_seconds(store: &Store) -> Vec<i64> {
		let midnight = at("2024-01-01 00:00:00");
		let mut seconds: Vec<i64> = store
			.greylist_entries(None)
			.unwrap()
			.iter()
			.map(|e| (e.last_seen - midnight).whole_seconds())
			.collect();
		seconds.sort();
		seconds
	}

	#[test]
	fn nothing_to_do_when_unbounded() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "c", &[0, 1, 2]);

		let report = Collector::new(unbounded())
			.collect(&mut store, at("2030-01-01 00:00:00"))
			.unwrap();

		assert_eq!(report, CollectReport::default());
		assert_eq!(store.count_greylist().unwrap(), 3);
	}

	#[test]
	fn expiry_runs_once() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "c", &[0, 10, 20]);
		let tx = store.immediate().unwrap();
		tx.hit_whitelist("old", at("2024-01-01 00:00:00")).unwrap();
		tx.hit_whitelist("new", at("2024-01-01 00:00:30")).unwrap();
		tx.commit().unwrap();

		let collector = Collector::new(CollectorConfig {
			greylist_expire: Some(Duration::seconds(20)),
			whitelist_expire: Some(Duration::seconds(20)),
			..unbounded()
		});
		let now = at("2024-01-01 00:00:30");

		let first = collector.collect(&mut store, now).unwrap();
		assert_eq!(first.greylist_expired, 2);
		assert_eq!(first.whitelist_expired, 1);
		assert_eq!(greylist_seconds(&store), vec![20]);
		assert!(store.whitelist_entry("new").unwrap().is_some());

		let second = collector.collect(&mut store, now).unwrap();
		assert_eq!(second.total(), 0);
		assert_eq!(store.count_greylist().unwrap(), 1);
	}

	#[test]
	fn huge_expiry_deletes_nothing() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "c", &[0]);

		let collector = Collector::new(CollectorConfig {
			greylist_expire: Some(Duration::seconds(i64::MAX)),
			..unbounded()
		});

		assert_eq!(collector.collect(&mut store, at("2024-06-01 00:00:00")).unwrap().total(), 0);
		assert_eq!(store.count_greylist().unwrap(), 1);
	}

	#[test]
	fn global_greylist_cap_keeps_newest() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "a", &[5, 1, 9]);
		fill(&mut store, "b", &[3, 7]);

		let report = Collector::new(CollectorConfig {
			max_greylist_entries: Some(3),
			..unbounded()
		})
		.collect(&mut store, at("2024-01-01 00:01:00"))
		.unwrap();

		assert_eq!(report.greylist_evicted, 2);
		assert_eq!(greylist_seconds(&store), vec![5, 7, 9]);
	}

	#[test]
	fn whitelist_cap_keeps_newest() {
		let mut store = Store::open_in_memory().unwrap();
		let tx = store.immediate().unwrap();
		tx.hit_whitelist("c1", at("2024-01-01 00:00:03")).unwrap();
		tx.hit_whitelist("c2", at("2024-01-01 00:00:01")).unwrap();
		tx.hit_whitelist("c3", at("2024-01-01 00:00:02")).unwrap();
		tx.commit().unwrap();

		let report = Collector::new(CollectorConfig {
			max_whitelist_entries: Some(2),
			..unbounded()
		})
		.collect(&mut store, at("2024-01-01 00:01:00"))
		.unwrap();

		assert_eq!(report.whitelist_evicted, 1);
		assert!(store.whitelist_entry("c2").unwrap().is_none());
		assert_eq!(store.count_whitelist().unwrap(), 2);
	}

	#[test]
	fn client_cap_without_global_cap() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "noisy", &[1, 2, 3, 4, 5]);
		fill(&mut store, "quiet", &[0]);

		let report = Collector::new(CollectorConfig {
			max_greylist_entries_per_client_name: Some(2),
			..unbounded()
		})
		.collect(&mut store, at("2024-01-01 00:01:00"))
		.unwrap();

		assert_eq!(report.clients_capped, vec![(String::from("noisy"), 3)]);
		// the quiet client's older entry survives, the noisy one loses its oldest
		assert_eq!(greylist_seconds(&store), vec![0, 4, 5]);
	}

	#[test]
	fn client_cap_waits_for_global_cap() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "noisy", &[1, 2, 3, 4]);

		let collector = Collector::new(CollectorConfig {
			max_greylist_entries: Some(4),
			max_greylist_entries_per_client_name: Some(1),
			..unbounded()
		});

		let report = collector.collect(&mut store, at("2024-01-01 00:01:00")).unwrap();
		assert!(report.clients_capped.is_empty());
		assert_eq!(store.count_greylist().unwrap(), 4);

		fill(&mut store, "other", &[0]);
		let report = collector.collect(&mut store, at("2024-01-01 00:01:00")).unwrap();
		assert_eq!(report.clients_capped, vec![(String::from("noisy"), 3)]);
		assert_eq!(report.greylist_evicted, 0);
		assert_eq!(greylist_seconds(&store), vec![0, 4]);
	}

	#[test]
	fn all_bounds_hold_after_collection() {
		let mut store = Store::open_in_memory().unwrap();
		fill(&mut store, "a", &[0, 1, 2, 3, 4, 5, 6, 7]);
		fill(&mut store, "b", &[8, 9, 10]);
		fill(&mut store, "c", &[11, 12]);
		let tx = store.immediate().unwrap();
		for client in ["a", "b", "c", "d"] {
			tx.hit_whitelist(client, at("2024-01-01 00:00:00")).unwrap();
		}
		tx.commit().unwrap();

		let config = CollectorConfig {
			max_greylist_entries: Some(5),
			max_greylist_entries_per_client_name: Some(3),
			max_whitelist_entries: Some(2),
			greylist_expire: Some(Duration::seconds(60)),
			whitelist_expire: None,
		};
		Collector::new(config)
			.collect(&mut store, at("2024-01-01 00:01:01"))
			.unwrap();

		// expiry takes second 0 and 1, the per-client cap trims a to 5, 6, 7
		// and the global cap leaves the five newest
		assert!(store.count_greylist().unwrap() <= 5);
		assert_eq!(greylist_seconds(&store), vec![8, 9, 10, 11, 12]);
		assert_eq!(store.count_whitelist().unwrap(), 2);
	}
}
