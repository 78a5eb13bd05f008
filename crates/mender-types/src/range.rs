//! Token intervals on the partitioner ring.
//!
//! A [`RingRange`] is the half-open interval `[start, end)` over the token
//! space. When `start > end` the interval wraps through the ring origin;
//! when `start == end` it covers the whole ring.

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// A token on the partitioner ring.
///
/// Tokens are arbitrary-precision because the random partitioner's space
/// (`[0, 2^127)`) does not fit the arithmetic needed to split it.
pub type Token = BigInt;

/// A (possibly wrapping) token interval.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingRange {
    start: Token,
    end: Token,
}

/// One linear piece of a range: `None` bounds are unbounded.
type Piece<'a> = (Option<&'a Token>, Option<&'a Token>);

impl RingRange {
    /// Create a range from `start` (inclusive) to `end` (exclusive).
    pub fn new(start: impl Into<Token>, end: impl Into<Token>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// First token of the range.
    pub fn start(&self) -> &Token {
        &self.start
    }

    /// Exclusive upper bound of the range.
    pub fn end(&self) -> &Token {
        &self.end
    }

    /// Whether the range crosses the ring origin.
    pub fn is_wrapping(&self) -> bool {
        self.start > self.end
    }

    /// Whether the range covers the whole ring.
    pub fn is_full_ring(&self) -> bool {
        self.start == self.end
    }

    /// Number of tokens covered, given the size of the ring.
    pub fn span(&self, ring_size: &BigInt) -> BigInt {
        if self.end > self.start {
            &self.end - &self.start
        } else {
            &self.end - &self.start + ring_size
        }
    }

    /// Whether `token` falls inside the range.
    pub fn contains(&self, token: &Token) -> bool {
        if self.is_full_ring() {
            true
        } else if self.is_wrapping() {
            *token >= self.start || *token < self.end
        } else {
            *token >= self.start && *token < self.end
        }
    }

    /// Whether `other` lies entirely inside this range.
    pub fn encloses(&self, other: &RingRange) -> bool {
        if self.is_full_ring() {
            return true;
        }
        if other.is_full_ring() {
            return false;
        }

        match (self.is_wrapping(), other.is_wrapping()) {
            (false, false) => other.start >= self.start && other.end <= self.end,
            (false, true) => false,
            // A linear range fits a wrapping one if it sits wholly on
            // either side of the origin.
            (true, false) => other.start >= self.start || other.end <= self.end,
            (true, true) => other.start >= self.start && other.end <= self.end,
        }
    }

    /// Whether the two ranges share at least one token.
    pub fn intersects(&self, other: &RingRange) -> bool {
        let mine = self.pieces();
        let theirs = other.pieces();
        mine.iter()
            .any(|a| theirs.iter().any(|b| pieces_overlap(*a, *b)))
    }

    /// Split the range into at most two linear pieces.
    fn pieces(&self) -> Vec<Piece<'_>> {
        if self.is_full_ring() {
            vec![(None, None)]
        } else if self.is_wrapping() {
            vec![(Some(&self.start), None), (None, Some(&self.end))]
        } else {
            vec![(Some(&self.start), Some(&self.end))]
        }
    }
}

fn pieces_overlap(a: Piece<'_>, b: Piece<'_>) -> bool {
    let lower = match (a.0, b.0) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };
    let upper = match (a.1, b.1) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };
    match (lower, upper) {
        (Some(lo), Some(hi)) => lo < hi,
        _ => true,
    }
}

impl Ord for RingRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl PartialOrd for RingRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl fmt::Debug for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingRange({}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: i64, end: i64) -> RingRange {
        RingRange::new(start, end)
    }

    #[test]
    fn test_span_linear_and_wrapping() {
        let size = BigInt::from(300);
        assert_eq!(r(0, 50).span(&size), BigInt::from(50));
        assert_eq!(r(250, 0).span(&size), BigInt::from(50));
        assert_eq!(r(287, 10).span(&size), BigInt::from(23));
        assert_eq!(r(7, 7).span(&size), size);
    }

    #[test]
    fn test_contains() {
        assert!(r(0, 50).contains(&BigInt::from(0)));
        assert!(!r(0, 50).contains(&BigInt::from(50)));
        assert!(r(250, 0).contains(&BigInt::from(299)));
        assert!(!r(250, 0).contains(&BigInt::from(0)));
        assert!(r(250, 10).contains(&BigInt::from(5)));
        assert!(r(3, 3).contains(&BigInt::from(-1000)));
    }

    #[test]
    fn test_encloses_linear() {
        assert!(r(0, 150).encloses(&r(0, 10)));
        assert!(r(0, 150).encloses(&r(140, 150)));
        assert!(!r(0, 150).encloses(&r(140, 160)));
        assert!(!r(0, 150).encloses(&r(287, 0)));
    }

    #[test]
    fn test_encloses_wrapping() {
        let slot = r(150, 0);
        assert!(slot.encloses(&r(150, 200)));
        assert!(slot.encloses(&r(287, 0)));
        assert!(!slot.encloses(&r(0, 9)));
        assert!(!slot.encloses(&r(100, 160)));
        // Wrapping slot that ends past the origin.
        let slot = r(250, 20);
        assert!(slot.encloses(&r(0, 10)));
        assert!(slot.encloses(&r(290, 5)));
        assert!(!slot.encloses(&r(10, 30)));
    }

    #[test]
    fn test_full_ring_encloses_everything() {
        let full = r(0, 0);
        assert!(full.encloses(&r(0, 1)));
        assert!(full.encloses(&r(250, 0)));
        assert!(!r(0, 299).encloses(&full));
    }

    #[test]
    fn test_intersects() {
        assert!(r(0, 50).intersects(&r(49, 60)));
        assert!(!r(0, 50).intersects(&r(50, 60)));
        assert!(r(250, 10).intersects(&r(0, 5)));
        assert!(r(250, 10).intersects(&r(200, 260)));
        assert!(!r(250, 10).intersects(&r(10, 250)));
        assert!(r(250, 10).intersects(&r(240, 20)));
        assert!(r(5, 5).intersects(&r(100, 101)));
    }

    #[test]
    fn test_ordering_by_start() {
        let mut ranges = vec![r(150, 200), r(287, 0), r(0, 9), r(50, 58)];
        ranges.sort();
        let starts: Vec<i64> = ranges
            .iter()
            .map(|range| i64::try_from(range.start()).unwrap())
            .collect();
        assert_eq!(starts, vec![0, 50, 150, 287]);
    }

    #[test]
    fn test_display() {
        assert_eq!(r(-5, 10).to_string(), "[-5, 10)");
    }
}
