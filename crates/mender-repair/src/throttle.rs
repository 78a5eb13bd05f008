//! Intensity throttling.
//!
//! A run's intensity is the fraction of time its coordinators should spend
//! repairing. After a segment that kept a coordinator busy for `active`, the
//! slot idles for `active * (1 / intensity - 1)` before its next segment.

use std::time::Duration;

/// Idle time owed after `active` time of repair at `intensity`.
///
/// Intensities outside `(0, 1]` are clamped; at `1.0` there is no pause.
pub fn intensity_delay(active: Duration, intensity: f64) -> Duration {
    let intensity = if intensity.is_finite() {
        intensity.clamp(0.01, 1.0)
    } else {
        1.0
    };
    active.mul_f64(1.0 / intensity - 1.0)
}
