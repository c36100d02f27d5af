use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use curveflow::cluster::run_local_cluster;
use curveflow::config::{
    DEFAULT_MAX_BATCH, DEFAULT_RECV_SLOTS, DEFAULT_WORK_GROUP_SIZE, HeuristicSet,
};
use curveflow::{DomainSpace, SchedulerConfig, metrics, synthetic};

#[derive(Parser)]
#[command(about = "Dynamic load-balanced integral-curve scheduling on an in-process cluster")]
struct Args {
    /// Number of ranks (threads)
    #[arg(short = 'n', long, default_value_t = 9)]
    procs: usize,

    /// Ranks per worker group, master included
    #[arg(short = 'g', long, default_value_t = DEFAULT_WORK_GROUP_SIZE)]
    work_group_size: usize,

    /// Seeded curves
    #[arg(short, long, default_value_t = 2000)]
    curves: usize,

    /// Spatial domains (x-slabs)
    #[arg(short, long, default_value_t = 16)]
    domains: u32,

    #[arg(long, default_value_t = 1)]
    timesteps: u32,

    /// Resident domains per slave
    #[arg(long, default_value_t = 4)]
    cache: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_BATCH)]
    max_batch: usize,

    /// Integration step budget per curve
    #[arg(long, default_value_t = 2000)]
    max_steps: u32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Receive slots posted per channel
    #[arg(long, default_value_t = DEFAULT_RECV_SLOTS)]
    recv_slots: usize,

    /// Enable overloaded-to-idle redistribution
    #[arg(long)]
    case5: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();
    metrics::spawn_reporter();
    let args = Args::parse();

    let space = DomainSpace::new(args.domains, args.timesteps);
    let config = SchedulerConfig {
        recv_slots: args.recv_slots,
        rng_seed: args.seed,
        heuristics: HeuristicSet {
            case5: args.case5,
            ..HeuristicSet::default()
        },
        ..SchedulerConfig::new(args.max_batch, args.work_group_size, space)
    };
    let seeds = synthetic::seed_curves(space, args.curves, args.max_steps, args.seed);
    info!(
        procs = args.procs,
        work_group_size = args.work_group_size,
        curves = seeds.len(),
        domains = space.len(),
        "starting cluster"
    );

    // Slaves start with a round-robin slice of the domains resident.
    let host = |rank: usize| {
        let first = space.id(rank % space.len());
        synthetic::collaborators(space, args.cache, [first])
    };
    let reports = match run_local_cluster(&config, args.procs, &seeds, host) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "run failed");
            return ExitCode::FAILURE;
        }
    };

    let finished: usize = reports.iter().map(|r| r.curves.len()).sum();
    let steps: u64 = reports
        .iter()
        .flat_map(|r| &r.curves)
        .map(|c| c.path.len() as u64)
        .sum();
    let early: u64 = reports.iter().map(|r| r.stats.early_terminations).sum();
    let loads: u64 = reports.iter().map(|r| r.stats.total_domain_loads()).sum();
    let busiest = reports
        .iter()
        .filter(|r| !r.is_master)
        .map(|r| r.stats.integration_fraction())
        .fold(0.0f64, f64::max);
    info!(
        finished,
        early_terminations = early,
        steps,
        domain_loads = loads,
        busiest_integration_fraction = busiest,
        "run complete"
    );
    ExitCode::SUCCESS
}
