//! Creation of new repair runs.

use chrono::Utc;
use mender_ring::SegmentGenerator;
use mender_types::{Cluster, NewRepairRun, RepairParallelism, RepairRun, RepairUnit};
use tracing::info;

use crate::RepairError;
use crate::context::RepairContext;

/// Tunables of a run being created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunParams {
    /// Target number of segments.
    pub segment_count: u32,
    /// Validation parallelism.
    pub parallelism: RepairParallelism,
    /// Target intensity in `(0, 1]`.
    pub intensity: f64,
}

impl RunParams {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), RepairError> {
        if !(self.intensity > 0.0 && self.intensity <= 1.0) {
            return Err(RepairError::Validation(format!(
                "intensity must be in (0, 1], got {}",
                self.intensity
            )));
        }
        if self.segment_count == 0 {
            return Err(RepairError::Validation("segment count must be positive".into()));
        }
        Ok(())
    }
}

/// Segment the cluster's ring and store a new `NOT_STARTED` run for `unit`.
///
/// Nothing is written unless the ring could be read and segmented.
pub async fn create_repair_run(
    ctx: &RepairContext,
    cluster: &Cluster,
    unit: &RepairUnit,
    params: RunParams,
    cause: &str,
    owner: &str,
) -> Result<RepairRun, RepairError> {
    params.validate()?;
    let hosts: Vec<String> = cluster.seed_hosts.iter().cloned().collect();
    let client = ctx.connector.connect_any(&hosts).await?;
    let tokens = client.tokens().await?;

    let generator = SegmentGenerator::from_partitioner(&cluster.partitioner)?;
    let ranges = generator.generate_segments(params.segment_count, &tokens)?;

    let run = ctx.store.add_repair_run(
        NewRepairRun {
            unit_id: unit.id,
            cluster_name: cluster.name.clone(),
            cause: cause.to_string(),
            owner: owner.to_string(),
            creation_time: Utc::now(),
            intensity: params.intensity,
            segment_count: params.segment_count,
            parallelism: params.parallelism,
        },
        &ranges,
    )?;
    info!(
        run_id = %run.id,
        cluster = %cluster.name,
        keyspace = %unit.keyspace,
        segments = ranges.len(),
        "repair run created"
    );
    Ok(run)
}
