//! Segment generation over a partitioner's token space.

use mender_types::{RingRange, Token};
use num_bigint::BigInt;
use num_traits::{One, ToPrimitive, Zero};
use tracing::debug;

use crate::RangeError;

/// Token space of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    /// Tokens in `[0, 2^127 - 1]`.
    Random,
    /// Tokens in `[-2^63, 2^63 - 1]`.
    Murmur3,
}

impl Partitioner {
    /// Resolve a partitioner from its (possibly fully qualified) class name.
    pub fn from_name(name: &str) -> Result<Self, RangeError> {
        let short = name.rsplit('.').next().unwrap_or(name);
        match short {
            "RandomPartitioner" => Ok(Self::Random),
            "Murmur3Partitioner" => Ok(Self::Murmur3),
            _ => Err(RangeError::UnknownPartitioner(name.to_string())),
        }
    }

    /// Smallest valid token.
    pub fn min_token(self) -> Token {
        match self {
            Self::Random => BigInt::zero(),
            Self::Murmur3 => -(BigInt::one() << 63u32),
        }
    }

    /// Largest valid token.
    pub fn max_token(self) -> Token {
        match self {
            Self::Random => (BigInt::one() << 127) - 1,
            Self::Murmur3 => (BigInt::one() << 63) - 1,
        }
    }
}

/// Splits a token ring into repair segments.
#[derive(Debug, Clone)]
pub struct SegmentGenerator {
    min: Token,
    max: Token,
    ring_size: BigInt,
}

impl SegmentGenerator {
    /// Generator over the inclusive token space `[min, max]`.
    pub fn new(min: impl Into<Token>, max: impl Into<Token>) -> Self {
        let min = min.into();
        let max = max.into();
        let ring_size = &max - &min + 1;
        Self {
            min,
            max,
            ring_size,
        }
    }

    /// Generator for a partitioner class name.
    pub fn from_partitioner(name: &str) -> Result<Self, RangeError> {
        let partitioner = Partitioner::from_name(name)?;
        Ok(Self::new(partitioner.min_token(), partitioner.max_token()))
    }

    /// Number of tokens in the ring.
    pub fn ring_size(&self) -> &BigInt {
        &self.ring_size
    }

    /// Whether `token` is a valid token of this ring.
    pub fn in_range(&self, token: &Token) -> bool {
        *token >= self.min && *token <= self.max
    }

    /// Split the ring described by `ring_tokens` into roughly
    /// `total_segments` segments.
    ///
    /// Each interval `[token_i, token_{i+1})` receives
    /// `ceil(span * total / ring_size)` segments, so the result may contain a
    /// few more segments than requested. The last interval wraps back to the
    /// first token. The result is ordered by interval, then by position.
    pub fn generate_segments(
        &self,
        total_segments: u32,
        ring_tokens: &[Token],
    ) -> Result<Vec<RingRange>, RangeError> {
        if ring_tokens.is_empty() {
            return Err(RangeError::EmptyRing);
        }
        if (total_segments as usize) < ring_tokens.len() {
            return Err(RangeError::TooFewSegments {
                requested: total_segments,
                tokens: ring_tokens.len(),
            });
        }

        let mut tokens = ring_tokens.to_vec();
        tokens.sort();
        if let Some(bad) = tokens.iter().find(|t| !self.in_range(t)) {
            return Err(RangeError::TokenOutOfRange(bad.clone()));
        }
        if let Some(pair) = tokens.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(RangeError::DuplicateToken(pair[0].clone()));
        }

        let total = BigInt::from(total_segments);
        let mut segments = Vec::new();
        for (i, start) in tokens.iter().enumerate() {
            let stop = &tokens[(i + 1) % tokens.len()];
            let span = RingRange::new(start.clone(), stop.clone()).span(&self.ring_size);

            // ceil(span * total / ring_size), bounded by total_segments
            let count: BigInt = (&span * &total + &self.ring_size - 1) / &self.ring_size;
            let count = count.to_u32().unwrap_or(total_segments).max(1);

            let boundaries: Vec<Token> = (0..=count)
                .map(|j| self.wrap(start + &span * j / count))
                .collect();
            segments.extend(
                boundaries
                    .windows(2)
                    .map(|pair| RingRange::new(pair[0].clone(), pair[1].clone())),
            );
        }

        let covered = segments
            .iter()
            .fold(BigInt::zero(), |acc, seg| acc + seg.span(&self.ring_size));
        if covered != self.ring_size {
            return Err(RangeError::IncompleteTiling {
                covered,
                ring_size: self.ring_size.clone(),
            });
        }

        debug!(
            requested = total_segments,
            generated = segments.len(),
            tokens = tokens.len(),
            "generated ring segments"
        );
        Ok(segments)
    }

    fn wrap(&self, token: Token) -> Token {
        if token > self.max {
            token - &self.ring_size
        } else {
            token
        }
    }
}
