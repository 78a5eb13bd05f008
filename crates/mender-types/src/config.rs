//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RepairParallelism;

/// Tunables of the repair engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Segments per run when a request does not say.
    pub segment_count: u32,
    /// Parallelism when a request does not say.
    pub parallelism: RepairParallelism,
    /// Intensity when a request does not say.
    pub intensity: f64,
    /// Days between activations of new schedules.
    pub schedule_days_between: u32,
    /// Size of the segment worker pool.
    pub repair_run_threads: usize,
    /// How long a segment may run before it is considered hung.
    pub hanging_repair_timeout: Duration,
    /// Delay before a runner re-dispatches after a transient problem.
    pub retry_delay: Duration,
    /// How often due schedules are checked.
    pub scheduling_poll_interval: Duration,
    /// How often expired runs are removed.
    pub cleaner_interval: Duration,
    /// Automatic schedule discovery.
    pub auto_scheduling: AutoSchedulingConfig,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            segment_count: 200,
            parallelism: RepairParallelism::DatacenterAware,
            intensity: 0.9,
            schedule_days_between: 7,
            repair_run_threads: 15,
            hanging_repair_timeout: Duration::from_secs(30 * 60),
            retry_delay: Duration::from_secs(10),
            scheduling_poll_interval: Duration::from_secs(60),
            cleaner_interval: Duration::from_secs(24 * 60 * 60),
            auto_scheduling: AutoSchedulingConfig::default(),
        }
    }
}

/// Settings of the keyspace auto-scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSchedulingConfig {
    /// Whether keyspaces get schedules automatically.
    pub enabled: bool,
    /// Delay before the first poll after startup.
    pub initial_delay: Duration,
    /// Delay between two polls.
    pub period_between_polls: Duration,
    /// Offset of the first activation of a new schedule.
    pub time_before_first_schedule: Duration,
    /// Stagger between first activations of schedules created together.
    pub schedule_spread_period: Duration,
}

impl Default for AutoSchedulingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(15),
            period_between_polls: Duration::from_secs(10 * 60),
            time_before_first_schedule: Duration::from_secs(5 * 60),
            schedule_spread_period: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RepairConfig::default();
        assert_eq!(config.segment_count, 200);
        assert_eq!(config.parallelism, RepairParallelism::DatacenterAware);
        assert_eq!(config.repair_run_threads, 15);
        assert_eq!(config.hanging_repair_timeout, Duration::from_secs(1800));
        assert!(!config.auto_scheduling.enabled);
    }
}
