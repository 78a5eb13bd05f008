//! TOML configuration for the Mender daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use mender_types::{RepairConfig, RepairParallelism};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Data directory and storage backend.
    pub node: NodeSection,
    /// Repair engine tuning.
    pub repair: RepairSection,
    /// Automatic keyspace scheduling.
    pub auto_scheduling: AutoSchedulingSection,
    /// Simulated clusters managed by this daemon.
    pub clusters: Vec<ClusterSection>,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory of the repair store.
    pub data_dir: PathBuf,
    /// Storage backend: `"fjall"` (default) or `"memory"`.
    pub storage: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".mender"))
            .unwrap_or_else(|| PathBuf::from(".mender"));
        Self {
            data_dir,
            storage: "fjall".to_string(),
        }
    }
}

/// `[repair]` section. Unset values keep the engine defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepairSection {
    pub segment_count: Option<u32>,
    pub parallelism: Option<RepairParallelism>,
    pub intensity: Option<f64>,
    pub schedule_days_between: Option<u32>,
    pub repair_run_threads: Option<usize>,
    /// e.g. `"30m"`.
    pub hanging_repair_timeout: Option<String>,
    pub retry_delay: Option<String>,
    pub scheduling_poll_interval: Option<String>,
    pub cleaner_interval: Option<String>,
}

/// `[auto_scheduling]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AutoSchedulingSection {
    pub enabled: Option<bool>,
    pub initial_delay: Option<String>,
    pub period_between_polls: Option<String>,
    pub time_before_first_schedule: Option<String>,
    pub schedule_spread_period: Option<String>,
}

/// One `[[clusters]]` entry: a simulated cluster.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub name: String,
    /// Number of nodes.
    pub nodes: usize,
    /// How long each simulated segment repair takes.
    pub repair_delay: String,
    pub keyspaces: Vec<KeyspaceSection>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "demo".to_string(),
            nodes: 3,
            repair_delay: "1s".to_string(),
            keyspaces: Vec::new(),
        }
    }
}

/// A keyspace of a simulated cluster.
#[derive(Debug, Deserialize)]
pub struct KeyspaceSection {
    pub name: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub tables: Vec<String>,
}

fn default_replication_factor() -> usize {
    3
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("cannot read {}", p.display()))?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Whether the store lives in memory only.
    pub fn memory_mode(&self) -> bool {
        self.node.storage == "memory"
    }

    /// Engine settings: defaults overridden by the `[repair]` and
    /// `[auto_scheduling]` sections.
    pub fn repair_config(&self) -> anyhow::Result<RepairConfig> {
        let mut config = RepairConfig::default();
        let repair = &self.repair;

        if let Some(v) = repair.segment_count {
            config.segment_count = v;
        }
        if let Some(v) = repair.parallelism {
            config.parallelism = v;
        }
        if let Some(v) = repair.intensity {
            config.intensity = v;
        }
        if let Some(v) = repair.schedule_days_between {
            config.schedule_days_between = v;
        }
        if let Some(v) = repair.repair_run_threads {
            config.repair_run_threads = v;
        }
        override_duration(&mut config.hanging_repair_timeout, &repair.hanging_repair_timeout)?;
        override_duration(&mut config.retry_delay, &repair.retry_delay)?;
        override_duration(&mut config.scheduling_poll_interval, &repair.scheduling_poll_interval)?;
        override_duration(&mut config.cleaner_interval, &repair.cleaner_interval)?;

        let auto = &self.auto_scheduling;
        let target = &mut config.auto_scheduling;
        if let Some(v) = auto.enabled {
            target.enabled = v;
        }
        override_duration(&mut target.initial_delay, &auto.initial_delay)?;
        override_duration(&mut target.period_between_polls, &auto.period_between_polls)?;
        override_duration(&mut target.time_before_first_schedule, &auto.time_before_first_schedule)?;
        override_duration(&mut target.schedule_spread_period, &auto.schedule_spread_period)?;

        if !(config.intensity > 0.0 && config.intensity <= 1.0) {
            bail!("intensity must be in (0, 1], got {}", config.intensity);
        }
        if config.repair_run_threads == 0 {
            bail!("repair_run_threads must be positive");
        }
        Ok(config)
    }
}

fn override_duration(target: &mut Duration, value: &Option<String>) -> anyhow::Result<()> {
    if let Some(s) = value {
        *target = parse_duration(s).with_context(|| format!("invalid duration {s:?}"))?;
    }
    Ok(())
}

/// Parse a human-readable duration.
///
/// Supports `"250ms"`, `"10s"`, `"30m"`, `"6h"`, `"2d"` and raw seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let n: u64 = number
        .parse()
        .with_context(|| format!("missing number in {s:?}"))?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        "d" => Duration::from_secs(n * 86_400),
        other => bail!("unknown duration unit {other:?}"),
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[node]
data_dir = "/tmp/mender-test"
storage = "memory"

[repair]
segment_count = 64
parallelism = "PARALLEL"
intensity = 0.5
repair_run_threads = 4
hanging_repair_timeout = "10m"
retry_delay = "500ms"

[auto_scheduling]
enabled = true
schedule_spread_period = "1h"

[[clusters]]
name = "prod"
nodes = 6
repair_delay = "2s"
keyspaces = [
    { name = "shop", replication_factor = 3, tables = ["orders", "carts"] },
    { name = "logs", tables = ["events"] },
]

[log]
level = "debug"
"#;

        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.node.data_dir, PathBuf::from("/tmp/mender-test"));
        assert!(config.memory_mode());
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].nodes, 6);
        assert_eq!(config.clusters[0].keyspaces[1].replication_factor, 3);

        let repair = config.repair_config().unwrap();
        assert_eq!(repair.segment_count, 64);
        assert_eq!(repair.parallelism, RepairParallelism::Parallel);
        assert_eq!(repair.intensity, 0.5);
        assert_eq!(repair.repair_run_threads, 4);
        assert_eq!(repair.hanging_repair_timeout, Duration::from_secs(600));
        assert_eq!(repair.retry_delay, Duration::from_millis(500));
        assert!(repair.auto_scheduling.enabled);
        assert_eq!(
            repair.auto_scheduling.schedule_spread_period,
            Duration::from_secs(3600)
        );
        // Untouched values keep their defaults.
        assert_eq!(repair.cleaner_interval, Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = CliConfig::from_toml("").unwrap();
        let expected_default = dirs::home_dir()
            .map(|h| h.join(".mender"))
            .unwrap_or_else(|| PathBuf::from(".mender"));
        assert_eq!(config.node.data_dir, expected_default);
        assert!(!config.memory_mode());
        assert!(config.clusters.is_empty());
        assert_eq!(config.repair_config().unwrap(), RepairConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = CliConfig::from_toml("[repair]\nintensity = 1.5\n").unwrap();
        assert!(config.repair_config().is_err());
        let config = CliConfig::from_toml("[repair]\nretry_delay = \"soon\"\n").unwrap();
        assert!(config.repair_config().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        std::fs::write(&path, "[node]\ndata_dir = \"/tmp/test-mender\"\n").unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node.data_dir, PathBuf::from("/tmp/test-mender"));
        assert!(CliConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(21_600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5 weeks").is_err());
    }
}
