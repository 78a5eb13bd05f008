//! Tests for the mender-repair crate, run against a simulated cluster.

pub(crate) mod helpers;
