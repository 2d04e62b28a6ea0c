//! Milestoning rectangles: business interval × processing interval

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Interval, Timestamp};
use crate::error::{Error, Result};

/// The 2-D validity region of one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub business: Interval,
    pub processing: Interval,
}

impl Rectangle {
    pub fn new(business: Interval, processing: Interval) -> Self {
        Self {
            business,
            processing,
        }
    }

    /// Rectangle of a non-dated entity
    pub fn full() -> Self {
        Self::new(Interval::full(), Interval::full())
    }

    /// Both axes overlap
    pub fn overlaps(&self, other: &Rectangle) -> bool {
        self.business.overlaps(&other.business) && self.processing.overlaps(&other.processing)
    }

    /// The point `(business, processing)` lies inside
    pub fn contains(&self, business: Timestamp, processing: Timestamp) -> bool {
        self.business.contains(business) && self.processing.contains(processing)
    }

    /// Intersects a query region on both axes
    pub fn intersects_range(&self, business: &Interval, processing: &Interval) -> bool {
        self.business.intersects(business) && self.processing.intersects(processing)
    }

    /// Processing interval still open
    pub fn is_open(&self) -> bool {
        self.processing.is_open()
    }

    /// Reject degenerate axes. Either axis being zero-length is a fatal
    /// configuration error for the identity that carries it.
    pub fn validate(&self, identity: &dyn fmt::Display) -> Result<()> {
        for (axis, interval) in [("business", &self.business), ("processing", &self.processing)] {
            if interval.is_degenerate() {
                return Err(Error::DegenerateInterval {
                    identity: identity.to_string(),
                    axis,
                    from: interval.from().to_string(),
                    to: interval.to().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Total order used to decide which of two overlapping rectangles is the
    /// original and which the duplicate: earlier processing start first,
    /// then earlier business start, then the shorter interval.
    pub fn canonical_cmp(&self, other: &Rectangle) -> Ordering {
        self.processing
            .from()
            .cmp(&other.processing.from())
            .then(self.business.from().cmp(&other.business.from()))
            .then(self.processing.to().cmp(&other.processing.to()))
            .then(self.business.to().cmp(&other.business.to()))
    }

    /// Order two overlapping rectangles as (original, duplicate); None when
    /// they do not overlap.
    pub fn overlap_pair<'a>(
        a: &'a Rectangle,
        b: &'a Rectangle,
    ) -> Option<(&'a Rectangle, &'a Rectangle)> {
        if !a.overlaps(b) {
            return None;
        }
        match a.canonical_cmp(b) {
            Ordering::Greater => Some((b, a)),
            _ => Some((a, b)),
        }
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "business {} × processing {}", self.business, self.processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(b: (&str, &str), p: (&str, &str)) -> Rectangle {
        Rectangle::new(
            Interval::parse(b.0, b.1).unwrap(),
            Interval::parse(p.0, p.1).unwrap(),
        )
    }

    #[test]
    fn test_overlap_requires_both_axes() {
        let a = rect(("2002-01-01", "infinity"), ("2002-01-02", "2002-01-03"));
        let b = rect(("2002-01-01", "infinity"), ("2002-01-03", "infinity"));
        let c = rect(("2002-01-01", "infinity"), ("2002-01-02 12:00:00", "infinity"));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_canonical_pair_order() {
        let early = rect(("2002-01-01", "infinity"), ("2002-01-02", "infinity"));
        let late = rect(("2002-01-01", "infinity"), ("2002-01-05", "infinity"));

        let (orig, dup) = Rectangle::overlap_pair(&late, &early).unwrap();
        assert_eq!(orig, &early);
        assert_eq!(dup, &late);
    }

    #[test]
    fn test_validate_degenerate() {
        let r = rect(("2002-01-01", "2002-01-01"), ("2002-01-02", "infinity"));
        let err = r.validate(&"[7]").unwrap_err();
        assert!(matches!(err, Error::DegenerateInterval { axis: "business", .. }));
        assert!(Rectangle::full().validate(&"[7]").is_ok());
    }

    #[test]
    fn test_contains_latest() {
        let open = rect(("2002-01-01", "infinity"), ("2002-01-02", "infinity"));
        let closed = rect(("2002-01-01", "infinity"), ("2002-01-01", "2002-01-02"));
        let biz = Timestamp::parse("2005-06-01").unwrap();
        assert!(open.contains(biz, Timestamp::INFINITY));
        assert!(!closed.contains(biz, Timestamp::INFINITY));
        assert!(closed.contains(biz, Timestamp::parse("2002-01-01 12:00:00").unwrap()));
    }
}
