//! Role selection and the full lifecycle of one rank: scheduling loop, reassembly, shutdown.

use std::time::Instant;

use tracing::info;

use crate::config::SchedulerConfig;
use crate::curve::Curve;
use crate::error::SchedError;
use crate::fabric::{Fabric, Rank};
use crate::host::Collaborators;
use crate::master::MasterState;
use crate::partition::{Role, WorkGroups};
use crate::reassembly;
use crate::slave::SlaveState;
use crate::stats::WorkerStats;
use crate::transport::Transport;

/// What a scheduling loop hands over to reassembly.
pub struct LoopOutput<F: Fabric> {
    pub transport: Transport<F>,
    /// Terminated curves this rank finished; it owns their reassembly.
    pub owned: Vec<Curve>,
    /// Path pieces left behind by migrations.
    pub fragments: Vec<Curve>,
    pub stats: WorkerStats,
    pub window: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub rank: Rank,
    pub is_master: bool,
    /// Fully merged curves owned by this rank, sorted by id.
    pub curves: Vec<Curve>,
    pub stats: WorkerStats,
}

pub enum WorkerRole<F: Fabric> {
    Slave(SlaveState<F>),
    Master(MasterState<F>),
}

impl<F: Fabric> WorkerRole<F> {
    /// Validate the configuration and pick this rank's role from the fabric's rank and size.
    /// Masters drop `host`; they never integrate.
    pub fn create(
        config: &SchedulerConfig,
        fabric: F,
        host: Collaborators,
    ) -> Result<Self, SchedError> {
        let rank = fabric.rank();
        let n_procs = fabric.size();
        let work_group_size = config.validate(n_procs)?;
        let groups = WorkGroups::new(n_procs, work_group_size)?;
        let role = groups.role(rank)?;
        let transport = Transport::new(
            fabric,
            config.space,
            config.recv_slots,
            config.max_curve_message_bytes,
        )?;

        Ok(match role {
            Role::Master { slaves, peers } => {
                info!(rank, ?slaves, ?peers, "role: master");
                Self::Master(MasterState::new(config, transport, &groups, peers))
            }
            Role::Slave { master } => {
                info!(rank, master, "role: slave");
                let group = groups.group_members(master);
                Self::Slave(SlaveState::new(config, transport, master, group, host))
            }
        })
    }

    pub fn rank(&self) -> Rank {
        match self {
            Self::Slave(s) => s.rank(),
            Self::Master(m) => m.rank(),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master(_))
    }

    /// Run to completion. Every rank passes the same `seeds`; masters keep their share and
    /// slaves only use them to size reassembly.
    pub fn run(self, seeds: Vec<Curve>) -> Result<RunReport, SchedError> {
        let rank = self.rank();
        let is_master = self.is_master();
        let total_ids = seeds.iter().map(|c| c.id + 1).max().unwrap_or(0);

        let LoopOutput {
            mut transport,
            owned,
            fragments,
            mut stats,
            window,
        } = match self {
            Self::Slave(s) => s.run()?,
            Self::Master(m) => m.run(seeds)?,
        };

        let t = Instant::now();
        let curves = reassembly::reassemble(&mut transport, owned, fragments, total_ids, window)?;
        stats.comm += t.elapsed();
        stats.total += t.elapsed();
        transport.shutdown();

        stats.log_summary(rank, if is_master { "master" } else { "slave" });
        Ok(RunReport {
            rank,
            is_master,
            curves,
            stats,
        })
    }
}
