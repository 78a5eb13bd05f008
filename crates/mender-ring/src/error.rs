//! Error types for ring segmentation.

use mender_types::Token;

/// Errors returned while validating a ring or generating segments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    /// The partitioner is not one we know the token space of.
    #[error("unsupported partitioner: {0}")]
    UnknownPartitioner(String),

    /// The ring has no tokens.
    #[error("cannot segment an empty ring")]
    EmptyRing,

    /// Fewer segments were requested than there are ring intervals.
    #[error("{requested} segments requested but the ring has {tokens} tokens")]
    TooFewSegments {
        /// Requested segment count.
        requested: u32,
        /// Number of ring tokens.
        tokens: usize,
    },

    /// A ring token lies outside the partitioner's token space.
    #[error("token {0} is outside the partitioner range")]
    TokenOutOfRange(Token),

    /// The same token appears twice on the ring.
    #[error("duplicate ring token {0}")]
    DuplicateToken(Token),

    /// Generated segments do not cover the ring exactly once.
    #[error("segments cover {covered} tokens, ring has {ring_size}")]
    IncompleteTiling {
        /// Sum of all segment spans.
        covered: Token,
        /// Size of the token space.
        ring_size: Token,
    },
}
