//! Token ring segmentation.
//!
//! A repair run splits the cluster's token ring into many small
//! [`RingRange`](mender_types::RingRange)s so that each repair session stays
//! short. [`SegmentGenerator`] performs the split: every segment falls inside
//! exactly one interval between two consecutive ring tokens, and together the
//! segments tile the ring exactly once.
//!
//! The token space depends on the cluster's [`Partitioner`].

mod error;
mod generator;

pub use error::RangeError;
pub use generator::{Partitioner, SegmentGenerator};
