//! Half-open `[from, to)` intervals

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Timestamp;
use crate::error::{Error, Result};

/// A half-open interval on one time axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    from: Timestamp,
    to: Timestamp,
}

impl Interval {
    /// Create an interval, rejecting `from > to`.
    ///
    /// `from == to` is accepted here so that callers can detect and report
    /// degenerate intervals themselves; see [`Interval::is_degenerate`].
    pub fn new(from: Timestamp, to: Timestamp) -> Result<Self> {
        if from > to {
            return Err(Error::InvalidInterval {
                axis: "time",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self { from, to })
    }

    /// `[from, INFINITY)`
    pub fn open_from(from: Timestamp) -> Self {
        Self {
            from,
            to: Timestamp::INFINITY,
        }
    }

    /// `[MIN, INFINITY)`; stands in for an axis the entity is not dated on
    pub fn full() -> Self {
        Self {
            from: Timestamp::MIN,
            to: Timestamp::INFINITY,
        }
    }

    /// Parse both bounds
    pub fn parse(from: &str, to: &str) -> Result<Self> {
        Self::new(Timestamp::parse(from)?, Timestamp::parse(to)?)
    }

    #[inline]
    pub fn from(&self) -> Timestamp {
        self.from
    }

    #[inline]
    pub fn to(&self) -> Timestamp {
        self.to
    }

    /// Still in effect (`to == INFINITY`)
    #[inline]
    pub fn is_open(&self) -> bool {
        self.to.is_infinity()
    }

    /// Zero-length interval
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.from == self.to
    }

    /// Whether the point lies in the interval.
    ///
    /// An as-of of `INFINITY` means "latest" and matches only open intervals.
    pub fn contains(&self, point: Timestamp) -> bool {
        if point.is_infinity() {
            return self.is_open();
        }
        self.from <= point && point < self.to
    }

    /// Neither interval lies entirely before the other
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Overlap with a query range; a degenerate query range is treated as a point
    pub fn intersects(&self, range: &Interval) -> bool {
        if range.is_degenerate() {
            return self.contains(range.from);
        }
        self.overlaps(range)
    }

    /// The common part of two intervals, if any
    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from < to).then_some(Interval { from, to })
    }

    /// Same start, end moved to `at`
    pub fn closed_at(&self, at: Timestamp) -> Interval {
        Interval { from: self.from, to: at }
    }

    /// Same end, start moved to `at`
    pub fn starting_at(&self, at: Timestamp) -> Interval {
        Interval { from: at, to: self.to }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(from: &str, to: &str) -> Interval {
        Interval::parse(from, to).unwrap()
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        assert!(Interval::parse("2002-01-03", "2002-01-02").is_err());
        assert!(iv("2002-01-02", "2002-01-02").is_degenerate());
    }

    #[test]
    fn test_half_open_containment() {
        let i = iv("2002-01-02", "2002-01-03");
        assert!(i.contains(Timestamp::parse("2002-01-02").unwrap()));
        assert!(!i.contains(Timestamp::parse("2002-01-03").unwrap()));
        assert!(!i.contains(Timestamp::INFINITY));
        assert!(Interval::open_from(i.from()).contains(Timestamp::INFINITY));
    }

    #[test]
    fn test_adjacent_intervals_do_not_overlap() {
        let a = iv("2002-01-02", "2002-01-03");
        let b = iv("2002-01-03", "infinity");
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&iv("2002-01-01", "2002-01-02 00:00:01")));
    }

    #[test]
    fn test_intersection() {
        let a = iv("2002-01-01", "2002-01-10");
        let b = iv("2002-01-05", "infinity");
        assert_eq!(a.intersection(&b), Some(iv("2002-01-05", "2002-01-10")));
        assert_eq!(a.intersection(&iv("2002-01-10", "2002-01-11")), None);
    }
}
