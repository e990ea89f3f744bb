//! Policy delegation requests as the MTA sends them: `name=value` lines,
//! ended by an empty line.

use std::collections::HashMap;

use pest::Parser;
use pest_derive::*;
use thiserror::Error;

use crate::engine::Observation;

#[derive(Parser)]
#[grammar = "request/request.pest"]
struct AttributeParser;

/// Splits one trimmed line into its name and value
pub fn parse_attribute(line: &str) -> Result<(String, String), RequestError> {
	let pairs = AttributeParser::parse(Rule::attribute, line)
		.map_err(|_| RequestError::Format(line.to_owned()))?;

	let mut name = None;
	let mut value = String::new();
	for pair in pairs.flatten() {
		match pair.as_rule() {
			Rule::name => name = Some(pair.as_str().to_owned()),
			Rule::value => value = pair.as_str().to_owned(),
			_ => (),
		}
	}

	match name {
		Some(name) => Ok((name, value)),
		None => Err(RequestError::Format(line.to_owned())),
	}
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Request {
	attributes: HashMap<String, String>,
}

impl Request {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
		self.attributes.insert(name.into(), value.into());
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.attributes.get(name).map(|s| s.as_str())
	}

	pub fn is_empty(&self) -> bool {
		self.attributes.is_empty()
	}

	/// Pulls out the triple the greylist works on. The client is named by
	/// `client_name`, or by `client_address` if the MTA didn't send a name.
	pub fn observation(&self) -> Result<Observation, RequestError> {
		let client_name = self
			.get("client_name")
			.or_else(|| self.get("client_address"))
			.ok_or(RequestError::MissingAttribute("client_name"))?;
		let sender = self
			.get("sender")
			.ok_or(RequestError::MissingAttribute("sender"))?;
		let recipient = self
			.get("recipient")
			.ok_or(RequestError::MissingAttribute("recipient"))?;

		Ok(Observation::new(client_name, sender, recipient))
	}
}

/// Collects lines into requests.
#[derive(Debug, Default)]
pub struct RequestReader {
	request: Request,
	malformed: Option<String>,
}

impl RequestReader {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one line, with or without its line ending. Returns a request
	/// once the empty line that ends it arrives. A request containing a bad
	/// line is read to its end and then reported as a single error.
	pub fn push(&mut self, line: &str) -> Result<Option<Request>, RequestError> {
		let line = line.trim();

		if !line.is_empty() {
			if self.malformed.is_none() {
				match parse_attribute(line) {
					Ok((name, value)) => self.request.insert(name, value),
					Err(RequestError::Format(bad)) => self.malformed = Some(bad),
					Err(err) => return Err(err),
				}
			}

			return Ok(None);
		}

		let request = std::mem::take(&mut self.request);
		match self.malformed.take() {
			Some(bad) => Err(RequestError::Format(bad)),
			// A lone empty line isn't a request
			None if request.is_empty() => Ok(None),
			None => Ok(Some(request)),
		}
	}

	/// True if lines were read that haven't made up a full request yet
	pub fn is_partial(&self) -> bool {
		!self.request.is_empty() || self.malformed.is_some()
	}
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RequestError {
	#[error("input format violation: {0:?}")]
	Format(String),
	#[error("missing critical attribute: {0}")]
	MissingAttribute(&'static str),
}

#[cfg(test)]
mod test {
	use super::*;

	fn read_all(reader: &mut RequestReader, lines: &[&str]) -> Vec<Result<Request, RequestError>> {
		lines
			.iter()
			.filter_map(|line| reader.push(line).transpose())
			.collect()
	}

	#[test]
	fn attribute_split() {
		assert_eq!(
			parse_attribute("sender=foo@example.com").unwrap(),
			(String::from("sender"), String::from("foo@example.com"))
		);
		assert_eq!(
			parse_attribute("ccert_subject=").unwrap(),
			(String::from("ccert_subject"), String::new())
		);
		assert_eq!(
			parse_attribute("sasl_method=a=b").unwrap(),
			(String::from("sasl_method"), String::from("a=b"))
		);
	}

	#[test]
	fn attribute_without_equals() {
		assert!(matches!(
			parse_attribute("request smtpd_access_policy"),
			Err(RequestError::Format(_))
		));
		assert!(parse_attribute("=value").is_err());
	}

	#[test]
	fn reads_requests_in_sequence() {
		let mut reader = RequestReader::new();
		let requests = read_all(
			&mut reader,
			&[
				"request=smtpd_access_policy\n",
				"sender=a@x\r\n",
				"recipient=b@y\n",
				"client_address=192.0.2.1\n",
				"\n",
				"\n",
				"sender=c@x\n",
				"recipient=d@y\n",
				"client_name=mx.example.com\n",
				"\n",
			],
		);

		assert_eq!(requests.len(), 2);
		let first = requests[0].as_ref().unwrap();
		assert_eq!(first.get("sender"), Some("a@x"));
		assert_eq!(first.get("request"), Some("smtpd_access_policy"));
		let second = requests[1].as_ref().unwrap();
		assert_eq!(second.get("sender"), Some("c@x"));
		assert_eq!(second.get("request"), None);
		assert!(!reader.is_partial());
	}

	#[test]
	fn malformed_request_is_one_error() {
		let mut reader = RequestReader::new();
		let requests = read_all(
			&mut reader,
			&["sender=a@x", "garbage", "recipient=b@y", "", "sender=c@x", "recipient=d@y", "client_address=::1", ""],
		);

		assert_eq!(requests.len(), 2);
		assert_eq!(requests[0], Err(RequestError::Format(String::from("garbage"))));
		assert_eq!(requests[1].as_ref().unwrap().get("sender"), Some("c@x"));
	}

	#[test]
	fn partial_request_is_tracked() {
		let mut reader = RequestReader::new();
		assert_eq!(reader.push("sender=a@x").unwrap(), None);
		assert!(reader.is_partial());
	}

	#[test]
	fn client_name_falls_back_to_address() {
		let mut request = Request::new();
		request.insert("sender", "a@x");
		request.insert("recipient", "b@y");
		request.insert("client_address", "192.0.2.7");

		let obs = request.observation().unwrap();
		assert_eq!(obs.client_name(), "192.0.2.7");

		request.insert("client_name", "mail.example.net");
		assert_eq!(request.observation().unwrap().client_name(), "mail.example.net");
	}

	#[test]
	fn missing_attributes() {
		let mut request = Request::new();
		request.insert("client_name", "mx");
		request.insert("recipient", "b@y");
		assert_eq!(
			request.observation(),
			Err(RequestError::MissingAttribute("sender"))
		);

		let mut request = Request::new();
		request.insert("sender", "a@x");
		request.insert("recipient", "b@y");
		assert_eq!(
			request.observation(),
			Err(RequestError::MissingAttribute("client_name"))
		);
	}
}
