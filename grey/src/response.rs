use crate::{config::ResponseConfig, engine::Verdict};

/// The answer to one policy request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
	action: String,
}

impl Response {
	pub fn new<S: Into<String>>(action: S) -> Self {
		Self {
			action: action.into(),
		}
	}

	pub fn for_verdict(verdict: Verdict, config: &ResponseConfig) -> Self {
		match verdict {
			Verdict::Pass => Self::new(&config.pass),
			Verdict::Defer => Self::new(&config.defer),
		}
	}

	pub fn action(&self) -> &str {
		&self.action
	}

	/// The response as it goes on the wire, with the empty line that ends it
	pub fn as_string(&self) -> String {
		format!("{}\n\n", self.action.trim_end())
	}
}
