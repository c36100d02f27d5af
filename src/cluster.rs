//! Runs a whole scheduler cluster inside one process, one named thread per rank.

use std::thread;

use crate::config::{MAILBOX_CAPACITY, SchedulerConfig};
use crate::curve::Curve;
use crate::error::SchedError;
use crate::fabric::{Fabric, Rank};
use crate::host::{Collaborators, HostError};
use crate::local_fabric::local_cluster;
use crate::worker::{RunReport, WorkerRole};

/// `host` builds each rank's collaborators on that rank's own thread. Reports come back
/// in rank order.
pub fn run_local_cluster<H>(
    config: &SchedulerConfig,
    n_procs: usize,
    seeds: &[Curve],
    host: H,
) -> Result<Vec<RunReport>, SchedError>
where
    H: Fn(Rank) -> Result<Collaborators, HostError> + Sync,
{
    config.validate(n_procs)?;
    let fabrics = local_cluster(n_procs, MAILBOX_CAPACITY);
    let host = &host;

    thread::scope(|scope| -> Result<Vec<RunReport>, SchedError> {
        let handles = fabrics
            .into_iter()
            .map(|fabric| {
                let rank = fabric.rank();
                let seeds = seeds.to_vec();
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || -> Result<RunReport, SchedError> {
                        WorkerRole::create(config, fabric, host(rank)?)?.run(seeds)
                    })
                    .map(|h| (rank, h))
            })
            .collect::<Result<Vec<_>, _>>()?;

        handles
            .into_iter()
            .map(|(rank, h)| h.join().map_err(|_| SchedError::WorkerPanicked { rank })?)
            .collect()
    })
}
