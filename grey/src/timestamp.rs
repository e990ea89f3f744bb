use std::{fmt::Display, ops::Sub, str::FromStr};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use thiserror::Error;
use time::{macros::format_description, Duration, OffsetDateTime, PrimitiveDateTime};

/// A UTC wall-clock instant with microsecond precision.
///
/// Stored in the database as `YYYY-MM-DD HH:MM:SS.ffffff`. That layout is
/// fixed-width, so comparing the text compares the instants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
	pub fn now() -> Self {
		let now = OffsetDateTime::now_utc();
		Self::from_datetime(PrimitiveDateTime::new(now.date(), now.time()))
	}

	pub fn from_datetime(datetime: PrimitiveDateTime) -> Self {
		// Anything below a microsecond would not survive a trip through the db
		let sub_micro = Duration::nanoseconds(i64::from(datetime.nanosecond() % 1_000));
		Self(datetime - sub_micro)
	}

	pub fn datetime(&self) -> PrimitiveDateTime {
		self.0
	}

	/// The instant `duration` before this one, or `None` if that falls
	/// outside of the representable range.
	pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
		self.0.checked_sub(duration).map(Self)
	}

	pub fn checked_add(&self, duration: Duration) -> Option<Self> {
		self.0.checked_add(duration).map(Self)
	}

	/// Format with whole seconds only, for display.
	pub fn to_seconds_string(&self) -> String {
		self.0
			.format(format_description!(
				"[year]-[month]-[day] [hour]:[minute]:[second]"
			))
			.unwrap_or_default()
	}
}

impl Sub for Timestamp {
	type Output = Duration;

	fn sub(self, rhs: Self) -> Self::Output {
		self.0 - rhs.0
	}
}

impl Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let formatted = self
			.0
			.format(format_description!(
				"[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
			))
			.map_err(|_| std::fmt::Error)?;

		write!(f, "{}", formatted)
	}
}

impl FromStr for Timestamp {
	type Err = TimestampError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();

		// Rows written without a fractional part are still valid
		let datetime = match s.contains('.') {
			true => PrimitiveDateTime::parse(
				s,
				format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
			)?,
			false => PrimitiveDateTime::parse(
				s,
				format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
			)?,
		};

		Ok(Self::from_datetime(datetime))
	}
}

impl ToSql for Timestamp {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		Ok(ToSqlOutput::from(self.to_string()))
	}
}

impl FromSql for Timestamp {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
		value
			.as_str()?
			.parse()
			.map_err(|err: TimestampError| FromSqlError::Other(Box::new(err)))
	}
}

#[derive(Debug, Error)]
pub enum TimestampError {
	#[error("malformed timestamp: {0}")]
	Malformed(#[from] time::error::Parse),
}
