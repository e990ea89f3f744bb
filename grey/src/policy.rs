use crate::{
	collector::Collector,
	config::{Config, MalformedAction, ResponseConfig},
	engine::{Engine, Verdict},
	request::{Request, RequestError},
	response::Response,
	store::{Store, StoreError},
	timestamp::Timestamp,
};

/// Where the current time comes from
pub trait Clock: Send {
	fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Timestamp {
		Timestamp::now()
	}
}

/// Something that answers policy requests. A session hands every request
/// it reads to the policy and writes back whatever it returns.
pub trait Policy: Send {
	/// Decide on a well formed request
	fn evaluate(&mut self, request: &Request) -> Response;

	/// Answer a request that could not be read
	fn reject(&mut self, error: &RequestError) -> Response;

	/// Called after each answer has been sent, to do work that can wait
	fn housekeeping(&mut self);
}

/// The greylisting policy: owns the store and runs the engine and the
/// collector against it.
pub struct GreylistPolicy<C: Clock> {
	store: Option<Store>,
	engine: Engine,
	collector: Collector,
	responses: ResponseConfig,
	clock: C,
}

impl GreylistPolicy<SystemClock> {
	pub fn open(config: &Config) -> Result<Self, StoreError> {
		let store = Store::open(&config.db_file)?;
		Ok(Self::new(store, config, SystemClock))
	}
}

impl<C: Clock> GreylistPolicy<C> {
	pub fn new(store: Store, config: &Config, clock: C) -> Self {
		Self {
			store: Some(store),
			engine: Engine::new(config.greylist.clone()),
			collector: Collector::new(config.collector.clone()),
			responses: config.responses.clone(),
			clock,
		}
	}

	pub fn store(&self) -> Option<&Store> {
		self.store.as_ref()
	}

	pub fn close(&mut self) -> Result<(), StoreError> {
		match self.store.take() {
			Some(store) => store.close(),
			None => Ok(()),
		}
	}

	fn malformed(&self) -> Response {
		match self.responses.malformed {
			MalformedAction::Pass => Response::new(&self.responses.pass),
			MalformedAction::Defer => Response::new(&self.responses.defer),
		}
	}
}

impl<C: Clock> Policy for GreylistPolicy<C> {
	fn evaluate(&mut self, request: &Request) -> Response {
		let obs = match request.observation() {
			Ok(obs) => obs,
			Err(err) => return self.reject(&err),
		};

		let store = match self.store.as_mut() {
			Some(store) => store,
			None => {
				tracing::error!("request after the store was closed");
				return Response::for_verdict(Verdict::Defer, &self.responses);
			}
		};

		let verdict = match self.engine.decide(store, self.clock.now(), &obs) {
			Ok(verdict) => verdict,
			Err(err) => {
				// Whatever happened wasn't recorded, so this can't be a pass
				tracing::error!("could not record {:?}: {}", obs.key(), err);
				Verdict::Defer
			}
		};

		tracing::info!(
			"{} client_name={:?} sender={:?} recipient={:?}",
			verdict,
			obs.client_name(),
			obs.sender(),
			obs.recipient()
		);
		Response::for_verdict(verdict, &self.responses)
	}

	fn reject(&mut self, error: &RequestError) -> Response {
		tracing::error!("malformed request: {}", error);
		let response = self.malformed();
		tracing::warn!("returning {:?}", response.action());
		response
	}

	fn housekeeping(&mut self) {
		let now = self.clock.now();
		if let Some(store) = self.store.as_mut() {
			if let Err(err) = self.collector.collect(store, now) {
				tracing::error!("{}", err);
			}
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::{
		atomic::{AtomicI64, Ordering},
		Arc,
	};

	use time::Duration;

	use super::*;
	use crate::{config::CollectorConfig, store::GreyKey};

	/// A clock that only moves when told to
	#[derive(Clone)]
	pub struct ManualClock {
		start: Timestamp,
		offset_ms: Arc<AtomicI64>,
	}

	impl ManualClock {
		pub fn new(start: &str) -> Self {
			Self {
				start: start.parse().unwrap(),
				offset_ms: Arc::new(AtomicI64::new(0)),
			}
		}

		pub fn advance(&self, secs: i64) {
			self.offset_ms.fetch_add(secs * 1_000, Ordering::SeqCst);
		}
	}

	impl Clock for ManualClock {
		fn now(&self) -> Timestamp {
			let offset = Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst));
			self.start.checked_add(offset).unwrap()
		}
	}

	fn request(client: &str, sender: &str, recipient: &str) -> Request {
		let mut request = Request::new();
		request.insert("request", "smtpd_access_policy");
		request.insert("client_name", client);
		request.insert("sender", sender);
		request.insert("recipient", recipient);
		request
	}

	fn policy(config: &Config, clock: &ManualClock) -> GreylistPolicy<ManualClock> {
		GreylistPolicy::new(Store::open_in_memory().unwrap(), config, clock.clone())
	}

	#[test]
	fn greylisting() {
		let mut config = Config::default();
		config.greylist.greylist_timeout = Duration::seconds(1);
		let clock = ManualClock::new("2024-05-01 12:00:00");
		let mut policy = policy(&config, &clock);
		let req = request("example.com", "foo@dom1.example.com", "bar@dom2.example.com");

		assert_eq!(policy.evaluate(&req).action(), config.responses.defer);
		clock.advance(1);
		assert_eq!(policy.evaluate(&req).action(), config.responses.pass);
	}

	#[test]
	fn whitelisting() {
		let mut config = Config::default();
		config.greylist.greylist_timeout = Duration::seconds(1);
		config.greylist.auto_whitelist_threshold = Some(2);
		let clock = ManualClock::new("2024-05-01 12:00:00");
		let mut policy = policy(&config, &clock);
		let req = request("example.com", "foo@dom1.example.com", "bar@dom2.example.com");

		assert_eq!(policy.evaluate(&req).action(), config.responses.defer);
		clock.advance(1);
		for _ in 0..3 {
			assert_eq!(policy.evaluate(&req).action(), config.responses.pass);
		}

		// a new sender from the trusted client goes straight through
		let req = request("example.com", "new@dom1.example.com", "bar@dom2.example.com");
		assert_eq!(policy.evaluate(&req).action(), config.responses.pass);
	}

	#[test]
	fn malformed_request_leaves_store_alone() {
		let mut config = Config::default();
		config.responses.malformed = MalformedAction::Pass;
		let clock = ManualClock::new("2024-05-01 12:00:00");
		let mut policy = policy(&config, &clock);

		let mut req = Request::new();
		req.insert("client_name", "example.com");
		req.insert("recipient", "bar@dom2.example.com");

		assert_eq!(policy.evaluate(&req).action(), config.responses.pass);
		assert_eq!(policy.store().unwrap().count_greylist().unwrap(), 0);

		let format = RequestError::Format(String::from("nonsense"));
		assert_eq!(policy.reject(&format).action(), config.responses.pass);
	}

	#[test]
	fn closed_store_defers() {
		let config = Config::default();
		let clock = ManualClock::new("2024-05-01 12:00:00");
		let mut policy = policy(&config, &clock);
		policy.close().unwrap();

		let req = request("example.com", "a@x", "b@y");
		assert_eq!(policy.evaluate(&req).action(), config.responses.defer);
		policy.housekeeping();
	}

	#[test]
	fn storage_failure_defers() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("greylist.db");

		let mut config = Config::default();
		config.greylist.greylist_timeout = Duration::ZERO;
		config.greylist.auto_whitelist_threshold = None;
		let clock = ManualClock::new("2024-05-01 12:00:00");
		let mut policy = GreylistPolicy::new(Store::open(&path).unwrap(), &config, clock.clone());

		let req = request("example.com", "a@x", "b@y");
		assert_eq!(policy.evaluate(&req).action(), config.responses.defer);

		// The retry would pass, but recording the pass needs the whitelist
		rusqlite::Connection::open(&path)
			.unwrap()
			.execute_batch("DROP TABLE whitelist")
			.unwrap();

		clock.advance(1);
		assert_eq!(policy.evaluate(&req).action(), config.responses.defer);

		let entry = policy
			.store()
			.unwrap()
			.greylist_entry(&GreyKey::new("example.com", "a@x", "b@y"))
			.unwrap()
			.unwrap();
		assert_eq!(entry.first_seen, entry.last_seen);
	}

	#[test]
	fn housekeeping_collects() {
		let mut config = Config::default();
		config.collector = CollectorConfig {
			greylist_expire: Some(Duration::seconds(10)),
			..config.collector
		};
		let clock = ManualClock::new("2024-05-01 12:00:00");
		let mut policy = policy(&config, &clock);

		policy.evaluate(&request("example.com", "a@x", "b@y"));
		policy.housekeeping();
		assert_eq!(policy.store().unwrap().count_greylist().unwrap(), 1);

		clock.advance(10);
		policy.housekeeping();
		let key = GreyKey::new("example.com", "a@x", "b@y");
		assert!(policy.store().unwrap().greylist_entry(&key).unwrap().is_none());
	}
}
