use std::collections::HashMap;

use rand::RngCore;

/// Hides the local part of mail addresses behind random hex, keeping the
/// domain. The same address always maps to the same replacement for the
/// life of the anonymizer.
pub struct Anonymizer<R: RngCore> {
	rng: R,
	seen: HashMap<String, String>,
}

impl<R: RngCore> Anonymizer<R> {
	pub fn new(rng: R) -> Self {
		Self {
			rng,
			seen: HashMap::new(),
		}
	}

	pub fn anonymize(&mut self, address: &str) -> String {
		if let Some(known) = self.seen.get(address) {
			return known.clone();
		}

		let mut bytes = [0u8; 6];
		self.rng.fill_bytes(&mut bytes);
		let key: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

		let replaced = match address.split_once('@') {
			Some((_, domain)) => format!("{}@{}", key, domain),
			None => key,
		};

		self.seen.insert(address.to_owned(), replaced.clone());
		replaced
	}
}

#[cfg(test)]
mod test {
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	#[test]
	fn keeps_domain_and_is_stable() {
		let mut anon = Anonymizer::new(StdRng::seed_from_u64(7));

		let first = anon.anonymize("alice@example.com");
		let (local, domain) = first.split_once('@').unwrap();
		assert_eq!(domain, "example.com");
		assert_eq!(local.len(), 12);
		assert!(local.chars().all(|c| c.is_ascii_hexdigit()));

		assert_eq!(anon.anonymize("alice@example.com"), first);
		assert_ne!(anon.anonymize("bob@example.com"), first);
	}

	#[test]
	fn address_without_domain() {
		let mut anon = Anonymizer::new(StdRng::seed_from_u64(7));
		let hidden = anon.anonymize("postmaster");

		assert_eq!(hidden.len(), 12);
		assert!(!hidden.contains('@'));
	}

	#[test]
	fn same_seed_same_mapping() {
		let mut one = Anonymizer::new(StdRng::seed_from_u64(42));
		let mut two = Anonymizer::new(StdRng::seed_from_u64(42));

		assert_eq!(one.anonymize("a@x"), two.anonymize("a@x"));
	}
}
