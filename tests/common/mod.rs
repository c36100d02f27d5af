#![allow(dead_code)]

use std::collections::HashSet;
use std::time::Duration;

use curveflow::curve::Curve;
use curveflow::host::{Collaborators, HostError};
use curveflow::worker::RunReport;
use curveflow::{DomainId, DomainSpace, SchedulerConfig, synthetic};

pub fn config(max_batch: usize, work_group_size: usize, space: DomainSpace) -> SchedulerConfig {
    SchedulerConfig {
        idle_sleep: Duration::from_micros(50),
        rng_seed: 11,
        ..SchedulerConfig::new(max_batch, work_group_size, space)
    }
}

/// Every slave starts with one domain resident, round-robin by rank.
pub fn round_robin_host(
    space: DomainSpace,
    cache: usize,
) -> impl Fn(usize) -> Result<Collaborators, HostError> + Sync {
    move |rank| synthetic::collaborators(space, cache, [space.id(rank % space.len())])
}

pub fn all_curves(reports: &[RunReport]) -> Vec<&Curve> {
    let mut all: Vec<&Curve> = reports.iter().flat_map(|r| &r.curves).collect();
    all.sort_by_key(|c| c.id);
    all
}

/// Each seed comes back exactly once, terminated.
pub fn assert_conserved(seeds: &[Curve], reports: &[RunReport]) {
    let all = all_curves(reports);
    let ids: HashSet<u64> = all.iter().map(|c| c.id).collect();
    assert_eq!(ids.len(), all.len(), "a curve was finished twice");
    let expected: HashSet<u64> = seeds.iter().map(|c| c.id).collect();
    assert_eq!(ids, expected, "every seed finishes exactly once");
    assert!(all.iter().all(|c| c.is_terminated()));
}

/// Merged paths must be a single monotone sweep in x starting from the seed.
pub fn assert_paths_continuous(seeds: &[Curve], reports: &[RunReport]) {
    for c in all_curves(reports) {
        let seed = seeds.iter().find(|s| s.id == c.id).expect("seed exists");
        assert_eq!(c.path.len() as u32, c.steps_taken, "curve {} lost steps", c.id);
        let mut prev = seed.position[0];
        for step in &c.path {
            assert!(step.position[0] > prev, "curve {} path out of order", c.id);
            prev = step.position[0];
        }
    }
}

pub fn stop_broadcasts(reports: &[RunReport]) -> u32 {
    reports.iter().map(|r| r.stats.stop_broadcasts).sum()
}

pub fn domain(d: u32) -> DomainId {
    DomainId::new(d, 0)
}
