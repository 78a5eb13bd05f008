//! `menderd` — the Mender repair daemon.
//!
//! Drives anti-entropy repairs of the configured clusters, resumes runs
//! interrupted by a restart and activates repair schedules.
//!
//! # Usage
//!
//! ```text
//! menderd start                          # start the daemon
//! menderd start -c mender.toml           # start with a config file
//! menderd start --memory --repair shop   # in-memory, repair `shop` right away
//! menderd status                         # runs and schedules in the store
//! menderd runs --cluster demo --json     # runs as JSON
//! ```

mod config;
mod telemetry;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mender_cluster::sim::{SimConnector, SimulatedCluster};
use mender_meta::{FjallStore, MemoryStore, RepairStore, RunFilter, ScheduleFilter};
use mender_repair::{NewRunRequest, RepairContext, RepairService};
use mender_types::SegmentState;
use tracing::{error, info, warn};

use config::{CliConfig, parse_duration};

/// Owner recorded on runs started from the command line.
const CLI_OWNER: &str = "menderd";

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "menderd", version, about = "Mender repair orchestration daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "MENDER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Start {
        /// Override the data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Keep all state in memory (nothing survives a restart).
        #[arg(short, long)]
        memory: bool,

        /// Keyspace to repair on every configured cluster at startup.
        /// Can be specified multiple times.
        #[arg(short, long)]
        repair: Vec<String>,
    },

    /// Show runs and schedules from the local store.
    Status,

    /// List repair runs.
    Runs {
        /// Only runs of this cluster.
        #[arg(long)]
        cluster: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List repair schedules.
    Schedules {
        /// Only schedules of this cluster.
        #[arg(long)]
        cluster: Option<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            memory,
            repair,
        } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if memory {
                config.node.storage = "memory".to_string();
            }
            cmd_start(config, repair).await
        }
        Commands::Status => cmd_status(&config),
        Commands::Runs { cluster, json } => cmd_runs(&config, cluster, json),
        Commands::Schedules { cluster } => cmd_schedules(&config, cluster),
    }
}

// -----------------------------------------------------------------------
// menderd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig, repair_keyspaces: Vec<String>) -> Result<()> {
    let repair_config = config.repair_config().context("invalid [repair] settings")?;
    info!(
        data_dir = %config.node.data_dir.display(),
        storage = %config.node.storage,
        threads = repair_config.repair_run_threads,
        auto_scheduling = repair_config.auto_scheduling.enabled,
        "starting menderd"
    );

    let store: Arc<dyn RepairStore> = if config.memory_mode() {
        Arc::new(MemoryStore::new())
    } else {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
        Arc::new(open_store(&config.node.data_dir)?)
    };

    // --- Simulated clusters ---
    let mut connector = SimConnector::new();
    let mut seeds = Vec::new();
    for section in &config.clusters {
        let delay = parse_duration(&section.repair_delay)
            .with_context(|| format!("invalid repair_delay of cluster {}", section.name))?;
        let cluster = Arc::new(SimulatedCluster::new(&section.name, section.nodes, delay));
        for ks in &section.keyspaces {
            let tables: Vec<&str> = ks.tables.iter().map(String::as_str).collect();
            cluster.add_keyspace(&ks.name, ks.replication_factor, &tables);
        }
        seeds.push(cluster.hosts().iter().cloned().collect::<BTreeSet<_>>());
        connector = connector.with_cluster(cluster);
    }
    if seeds.is_empty() {
        warn!("no [[clusters]] configured, nothing to repair");
    }

    let ctx = RepairContext::new(store, Arc::new(connector), repair_config);
    let service = Arc::new(RepairService::new(Arc::clone(&ctx)));

    let mut clusters = Vec::new();
    for seed_hosts in seeds {
        let cluster = service
            .register_cluster(seed_hosts)
            .await
            .context("failed to register cluster")?;
        clusters.push(cluster);
    }

    // --- Crash recovery ---
    let resumed = service
        .manager()
        .resume_running_runs()
        .await
        .context("failed to resume running repairs")?;
    if resumed > 0 {
        info!(resumed, "resumed interrupted repair runs");
    }

    // --- Background loops ---
    let scheduling = Arc::clone(service.scheduling());
    tokio::spawn(async move { scheduling.run().await });
    let cleaner = Arc::clone(service.cleaner());
    tokio::spawn(async move { cleaner.run().await });
    if ctx.config.auto_scheduling.enabled {
        let auto_scheduler = Arc::clone(service.auto_scheduler());
        tokio::spawn(async move { auto_scheduler.run().await });
    }

    // --- Runs requested on the command line ---
    for cluster in &clusters {
        for keyspace in &repair_keyspaces {
            let mut request = NewRunRequest::new(&cluster.name, keyspace, CLI_OWNER);
            request.cause = Some("requested at startup".to_string());
            let started = match service.create_run(request).await {
                Ok(run) => service.start_run(run.id).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(run) => info!(run_id = %run.id, cluster = %cluster.name, %keyspace, "repair started"),
                Err(e) => error!(cluster = %cluster.name, %keyspace, error = %e, "cannot start repair"),
            }
        }
    }

    info!("menderd ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(active_runs = service.manager().active_runs().len(), "shutting down");
    Ok(())
}

fn open_store(data_dir: &Path) -> Result<FjallStore> {
    let path = data_dir.join("meta");
    FjallStore::open(&path).map_err(|e| {
        anyhow::anyhow!(
            "cannot open repair store at {}. Is another menderd running? ({e})",
            path.display(),
        )
    })
}

// -----------------------------------------------------------------------
// menderd status / runs / schedules
// -----------------------------------------------------------------------

fn cmd_status(config: &CliConfig) -> Result<()> {
    let store = open_store(&config.node.data_dir)?;

    let clusters = store.list_clusters()?;
    println!("Clusters: {}", clusters.len());
    for cluster in &clusters {
        println!("  {} seeds={}", cluster.name, cluster.seed_hosts.len());
    }

    print_runs(&store, &RunFilter::default())?;
    print_schedules(&store, &ScheduleFilter::default())?;
    Ok(())
}

fn cmd_runs(config: &CliConfig, cluster: Option<String>, json: bool) -> Result<()> {
    let store = open_store(&config.node.data_dir)?;
    let filter = RunFilter {
        cluster,
        ..RunFilter::default()
    };
    if json {
        let runs = store.list_repair_runs(&filter)?;
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    print_runs(&store, &filter)
}

fn cmd_schedules(config: &CliConfig, cluster: Option<String>) -> Result<()> {
    let store = open_store(&config.node.data_dir)?;
    let filter = ScheduleFilter {
        cluster,
        ..ScheduleFilter::default()
    };
    print_schedules(&store, &filter)
}

fn print_runs(store: &dyn RepairStore, filter: &RunFilter) -> Result<()> {
    let runs = store.list_repair_runs(filter)?;
    println!("Repair runs: {}", runs.len());
    for run in &runs {
        let done = store.segment_count_in_state(run.id, SegmentState::Done)?;
        let total = store.segment_count(run.id)?;
        let keyspace = store
            .get_repair_unit(run.unit_id)?
            .map(|u| u.keyspace)
            .unwrap_or_default();
        println!(
            "  #{} {}/{} {} {done}/{total} segments owner={} last_event={:?}",
            run.id, run.cluster_name, keyspace, run.state, run.owner, run.last_event,
        );
    }
    Ok(())
}

fn print_schedules(store: &dyn RepairStore, filter: &ScheduleFilter) -> Result<()> {
    let schedules = store.list_repair_schedules(filter)?;
    println!("Repair schedules: {}", schedules.len());
    for schedule in &schedules {
        let unit = store.get_repair_unit(schedule.unit_id)?;
        let (cluster, keyspace) = unit
            .map(|u| (u.cluster_name, u.keyspace))
            .unwrap_or_default();
        // Histories keep ids of runs the cleaner already deleted.
        let mut kept = 0;
        for run_id in &schedule.run_history {
            if store.get_repair_run(*run_id)?.is_some() {
                kept += 1;
            }
        }
        println!(
            "  #{} {cluster}/{keyspace} {} every {}d next={} runs={} owner={}",
            schedule.id,
            schedule.state,
            schedule.days_between,
            schedule.next_activation,
            kept,
            schedule.owner,
        );
    }
    Ok(())
}
