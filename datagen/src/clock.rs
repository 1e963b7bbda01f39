//! The production clock.
//!
//! Records are stamped with nanoseconds since the Unix epoch. In batch mode
//! the [`Clock`] walks a synthetic timestamp over `[start, end)` by a fixed
//! step. In continuous mode the synthetic timestamp is reset to the wall
//! clock on every tick once it has caught up. A continuous clock without a
//! configured end runs until stopped. One with an end stops there like a
//! batch clock.

use std::time::Duration;

use time::{
    Date, OffsetDateTime, PrimitiveDateTime, format_description::well_known::Rfc3339,
    macros::format_description,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Clock`]
pub enum Error {
    /// Timestamp is neither `YYYY-MM-DD HH:MM:SS` nor `YYYY-MM-DD`
    #[error("Failed to parse timestamp '{input}': {source}")]
    Parse {
        /// The rejected input
        input: String,
        /// Error of the last form tried
        #[source]
        source: time::error::Parse,
    },
    /// Timestamp cannot be represented as `i64` nanoseconds
    #[error("Timestamp '{0}' is out of range")]
    OutOfRange(String),
    /// The clock would never advance
    #[error("Step must not be zero")]
    ZeroStep,
}

/// Parse `input` as a UTC timestamp in nanoseconds since the Unix epoch.
///
/// Accepts the long form `2006-01-02 15:04:05` first, then the short form
/// `2006-01-02` which denotes midnight.
///
/// # Errors
///
/// Returns an error if neither form matches or the instant does not fit in
/// `i64` nanoseconds.
pub fn parse_timestamp(input: &str) -> Result<i64, Error> {
    let long = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let short = format_description!("[year]-[month]-[day]");

    let datetime = match PrimitiveDateTime::parse(input, long) {
        Ok(datetime) => datetime,
        Err(_) => Date::parse(input, short)
            .map(Date::midnight)
            .map_err(|source| Error::Parse {
                input: input.to_string(),
                source,
            })?,
    };

    i64::try_from(datetime.assume_utc().unix_timestamp_nanos())
        .map_err(|_| Error::OutOfRange(input.to_string()))
}

/// Wall clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

/// Render `timestamp` as RFC 3339, falling back to the raw nanoseconds.
#[must_use]
pub fn display(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp))
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| timestamp.to_string())
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The production clock of the producer.
pub struct Clock {
    timestamp: i64,
    end: Option<i64>,
    step: Duration,
    continuous: bool,
}

impl Clock {
    /// Create a new [`Clock`] over `[start, end)`. A `None` end leaves the
    /// interval open.
    ///
    /// # Errors
    ///
    /// Returns an error if `step` is zero.
    pub fn new(
        start: i64,
        end: Option<i64>,
        step: Duration,
        continuous: bool,
    ) -> Result<Self, Error> {
        if step.is_zero() {
            return Err(Error::ZeroStep);
        }
        Ok(Self {
            timestamp: start,
            end,
            step,
            continuous,
        })
    }

    /// Create a new [`Clock`] from configuration strings. A missing `start`
    /// defaults to one day before `now`. A missing `end` defaults to `now` in
    /// batch mode and leaves a continuous clock unbounded.
    ///
    /// # Errors
    ///
    /// Returns an error if either timestamp is malformed or `step` is zero.
    pub fn from_config(
        start: Option<&str>,
        end: Option<&str>,
        step: Duration,
        continuous: bool,
        now: i64,
    ) -> Result<Self, Error> {
        let start = match start {
            Some(start) => parse_timestamp(start)?,
            None => now.saturating_sub(nanos(Duration::from_secs(24 * 60 * 60))),
        };
        let end = match end {
            Some(end) => Some(parse_timestamp(end)?),
            None if continuous => None,
            None => Some(now),
        };
        Self::new(start, end, step, continuous)
    }

    /// The current timestamp.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The period between two rounds.
    #[must_use]
    pub fn step(&self) -> Duration {
        self.step
    }

    /// True when running continuously and the synthetic timestamp has reached
    /// `now`.
    #[must_use]
    pub fn caught_up(&self, now: i64) -> bool {
        self.continuous && self.timestamp >= now
    }

    /// True when the synthetic timestamp has reached the end of the interval.
    /// An open interval is never exhausted.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.end.is_some_and(|end| self.timestamp >= end)
    }

    /// Advance the synthetic timestamp by one step.
    pub fn advance(&mut self) {
        self.timestamp = self.timestamp.saturating_add(nanos(self.step));
    }

    /// Move the timestamp to the wall clock reading `now`.
    pub fn set(&mut self, now: i64) {
        self.timestamp = now;
    }
}
