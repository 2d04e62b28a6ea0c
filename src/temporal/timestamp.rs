//! Millisecond instants on a milestoning timeline
//!
//! Both time axes share one representation: milliseconds since the Unix
//! epoch. `INFINITY` is the framework's conventional "still in effect" date
//! (9999-12-01 23:59:00.000 UTC) and `MIN` stands in for an axis an entity
//! does not track.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const INFINITY_MILLIS: i64 = 253_399_708_740_000;

/// A point on the business or processing timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(i64);

impl Timestamp {
    /// Open upper bound: compares greater than every finite instant
    pub const INFINITY: Timestamp = Timestamp(INFINITY_MILLIS);

    /// Lower bound used for axes an entity is not dated on
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Create from milliseconds since the epoch
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Whether this is the infinity sentinel
    #[inline]
    pub fn is_infinity(&self) -> bool {
        *self == Self::INFINITY
    }

    /// Shift by a number of milliseconds, saturating below infinity
    pub fn plus_millis(&self, millis: i64) -> Self {
        if self.is_infinity() || *self == Self::MIN {
            return *self;
        }
        Self(self.0.saturating_add(millis).min(INFINITY_MILLIS))
    }

    /// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD HH:MM:SS.fff`
    /// (a `T` separator is accepted too), or the words `infinity` / `min`.
    /// Instants after the infinity date are rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let parsed = Self::parse_unbounded(text)?;
        if parsed > Self::INFINITY {
            return Err(Error::TimestampParse(format!("{} is after infinity", text.trim())));
        }
        Ok(parsed)
    }

    fn parse_unbounded(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "infinity" => return Ok(Self::INFINITY),
            "min" | "-infinity" => return Ok(Self::MIN),
            _ => {}
        }

        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(Self::from_naive(naive));
            }
        }

        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(Self::from_naive)
            .ok_or_else(|| Error::TimestampParse(text.to_string()))
    }

    /// Interpret a naive date-time as UTC
    pub fn from_naive(naive: NaiveDateTime) -> Self {
        Self(naive.and_utc().timestamp_millis())
    }

    /// Convert to a chrono UTC date-time (None for `MIN`)
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if *self == Self::MIN {
            return None;
        }
        DateTime::from_timestamp_millis(self.0)
    }
}

/// Instants past the infinity date collapse onto it
impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis().min(INFINITY_MILLIS))
    }
}

impl TryFrom<String> for Timestamp {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinity() {
            return write!(f, "infinity");
        }
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => write!(f, "min"),
        }
    }
}
