//! Master scheduler: owns a pool of unassigned curves and directs its slaves.
//!
//! The root master additionally tracks every other master, balances work between groups
//! and decides global completion.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{STALL_CYCLES_BEFORE_FORCE, SchedulerConfig};
use crate::curve::Curve;
use crate::domain::{DomainId, DomainSpace};
use crate::error::SchedError;
use crate::fabric::{Fabric, Rank};
use crate::metrics;
use crate::partition::{ROOT, WorkGroups};
use crate::protocol::Message;
use crate::rebalance::{Directive, GroupState, Rebalancer};
use crate::stats::WorkerStats;
use crate::status::{MasterInfo, StatusReporter};
use crate::transport::Transport;
use crate::worker::LoopOutput;

pub struct MasterState<F: Fabric> {
    transport: Transport<F>,
    group: Vec<Rank>,
    /// Root: every other master. Others: just the root.
    peers: Vec<Rank>,
    num_masters: usize,
    space: DomainSpace,
    state: GroupState,
    rebalancer: Rebalancer,
    /// Root only. Position 0 is the root's own group, then `peers` in order.
    masters: Vec<MasterInfo>,
    /// Non-root: diffs the group status forwarded to the root.
    reporter: StatusReporter,
    total_curves: u64,
    /// Root: terminations reported from everywhere. Others: always 0.
    terminated: u64,
    slave_update: bool,
    master_update: bool,
    quiet_cycles: u32,
    stopped: bool,
    fragments: Vec<Curve>,
    offload_cap: usize,
    idle_sleep: Duration,
    window: usize,
    stats: WorkerStats,
}

impl<F: Fabric> MasterState<F> {
    pub fn new(
        config: &SchedulerConfig,
        transport: Transport<F>,
        groups: &WorkGroups,
        peers: Vec<Rank>,
    ) -> Self {
        let rank = transport.rank();
        let space = config.space;
        let masters = if rank == ROOT {
            std::iter::once(ROOT)
                .chain(peers.iter().copied())
                .map(|r| MasterInfo::new(r, space.len()))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            group: groups.group_members(rank),
            state: GroupState::new(space, groups.slaves_of(rank)),
            rebalancer: Rebalancer::new(config, rank),
            num_masters: groups.num_masters(),
            transport,
            peers,
            space,
            masters,
            reporter: StatusReporter::new(),
            total_curves: 0,
            terminated: 0,
            slave_update: false,
            master_update: false,
            quiet_cycles: 0,
            stopped: false,
            fragments: Vec::new(),
            offload_cap: config.offload_cap(),
            idle_sleep: config.idle_sleep,
            window: config.reassembly_window,
            stats: WorkerStats::new(space.len()),
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Keep this master's contiguous share of the global seed list.
    fn seed(&mut self, mut seeds: Vec<Curve>) {
        seeds.sort_by_key(|c| c.id);
        self.total_curves = seeds.len() as u64;
        let m = self.rank();
        let start = m * seeds.len() / self.num_masters;
        let end = (m + 1) * seeds.len() / self.num_masters;
        let share: Vec<Curve> = seeds.drain(start..end).collect();
        info!(
            rank = m,
            seeded = share.len(),
            total = self.total_curves,
            slaves = self.state.slaves.len(),
            "master started"
        );
        self.state.pool.extend(share);
        self.slave_update = true;
    }

    pub fn run(mut self, seeds: Vec<Curve>) -> Result<LoopOutput<F>, SchedError> {
        let start = Instant::now();
        self.transport.barrier(&self.group);
        self.seed(seeds);
        if !self.is_root() {
            self.forward_status(true)?;
        }

        while !self.stopped {
            self.cycle()?;
        }

        self.stats.total = start.elapsed();
        Ok(LoopOutput {
            transport: self.transport,
            owned: Vec::new(),
            fragments: self.fragments,
            stats: self.stats,
            window: self.window,
        })
    }

    fn cycle(&mut self) -> Result<(), SchedError> {
        self.transport.poll_completed_sends();

        let t = Instant::now();
        let heard = self.process_messages()? + self.absorb_curves()?;
        self.stats.comm += t.elapsed();
        if self.stopped {
            return Ok(());
        }

        let dirty = self.slave_update || self.master_update;
        if dirty {
            self.rebalance()?;
        }

        if self.is_root() {
            if self.check_completion(heard)? {
                return Ok(());
            }
        } else {
            self.forward_status(false)?;
        }
        self.slave_update = false;
        self.master_update = false;

        if !dirty {
            let t = Instant::now();
            std::thread::sleep(self.idle_sleep);
            self.stats.idle += t.elapsed();
            metrics::inc_idle_sleeps();
        }
        Ok(())
    }

    fn note_terminated(&mut self, n: i32) {
        if self.is_root() {
            self.terminated = self.terminated.saturating_add_signed(n as i64);
        } else {
            self.reporter.add_terminated(n);
        }
    }

    /// Returns the number of messages handled.
    fn process_messages(&mut self) -> Result<usize, SchedError> {
        let rank = self.rank();
        let envs = self.transport.receive_messages()?;
        let n = envs.len();
        for env in envs {
            self.stats.status_received += 1;
            match env.body {
                Message::Status { counts, terminated } => {
                    let Some(info) = self.state.slave_mut(env.source) else {
                        warn!(rank, source = env.source, "status from a stranger");
                        continue;
                    };
                    info.update(&counts);
                    self.note_terminated(terminated);
                    self.slave_update = true;
                }
                Message::MasterStatus { counts, terminated } => {
                    let Some(info) = self.masters.iter_mut().skip(1).find(|m| m.rank == env.source)
                    else {
                        warn!(rank, source = env.source, "master status from a non-peer");
                        continue;
                    };
                    info.update(&counts);
                    self.note_terminated(terminated);
                    self.master_update = true;
                }
                Message::Offload { dst, domains } => self.offload(dst, &domains)?,
                Message::Done => {
                    self.broadcast_slaves(&Message::Done)?;
                    self.stopped = true;
                    info!(rank, "stop relayed to group");
                }
                Message::ForceStatus => {
                    self.broadcast_slaves(&Message::ForceStatus)?;
                    self.reporter.force_next();
                }
                other => {
                    warn!(rank, source = env.source, kind = other.kind(), "unexpected message");
                }
            }
        }
        Ok(n)
    }

    /// Pull curves routed to this master into the pool.
    fn absorb_curves(&mut self) -> Result<usize, SchedError> {
        let mut absorbed = 0;
        for env in self.transport.receive_curves()? {
            for curve in env.body {
                self.stats.curves_received += 1;
                if !self.space.contains(curve.domain) {
                    warn!(rank = self.rank(), id = curve.id, domain = %curve.domain, "curve outside the domain space, discarding");
                    self.stats.early_terminations += 1;
                    metrics::inc_early_terminations();
                    self.note_terminated(1);
                    continue;
                }
                self.state.pool.insert(curve);
                absorbed += 1;
            }
        }
        if absorbed > 0 {
            debug!(rank = self.rank(), absorbed, pool = self.state.pool.len(), "curves absorbed");
            self.slave_update = true;
        }
        Ok(absorbed)
    }

    fn rebalance(&mut self) -> Result<(), SchedError> {
        let mut directives = self.rebalancer.cycle(&mut self.state);
        if self.is_root() {
            let own_fresh = self.slave_update;
            let own = &mut self.masters[0];
            own.update(&self.state.status_vector());
            own.just_updated = own_fresh;
            directives.extend(self.rebalancer.manage_masters(&mut self.masters));
            for m in &mut self.masters {
                m.just_updated = false;
            }
        }
        for d in directives {
            self.execute(d)?;
        }
        self.stats.rebalance_cycles += 1;
        metrics::inc_rebalance_cycles();
        Ok(())
    }

    fn execute(&mut self, directive: Directive) -> Result<(), SchedError> {
        match directive {
            Directive::Assign { slave, curves } => self.ship(slave, curves),
            Directive::LoadDomain { slave, domain } => self.transport.send_message(
                slave,
                &Message::LoadDomain {
                    domain: self.space.id(domain),
                },
            ),
            Directive::SendCurves {
                from,
                to,
                domain,
                count,
            } => self.transport.send_message(
                from,
                &Message::SendCurves {
                    dst: to,
                    domain: self.space.id(domain),
                    count,
                },
            ),
            Directive::Offload { from, to, domains } => {
                let domains: Vec<DomainId> = domains.into_iter().map(|d| self.space.id(d)).collect();
                debug!(from, to, n = domains.len(), "pairing busy master with idle master");
                if from == self.rank() {
                    self.offload(to, &domains)
                } else {
                    self.transport
                        .send_message(from, &Message::Offload { dst: to, domains })
                }
            }
        }
    }

    fn ship(&mut self, dst: Rank, curves: Vec<Curve>) -> Result<(), SchedError> {
        self.stats.curves_sent += curves.len() as u64;
        let kept = self.transport.migrate(dst, curves)?;
        self.fragments.extend(kept);
        Ok(())
    }

    /// Move work matching `domains` (any, if empty) toward the idle master `dst`: pool curves
    /// go directly, slaves with matching waiting curves are told to send theirs.
    fn offload(&mut self, dst: Rank, domains: &[DomainId]) -> Result<(), SchedError> {
        if dst == self.rank() {
            return Ok(());
        }
        let wanted = |d: &DomainId| domains.is_empty() || domains.contains(d);
        let batch = self.state.pool.take_where(self.offload_cap, |c| wanted(&c.domain));
        if !batch.is_empty() {
            debug!(rank = self.rank(), dst, n = batch.len(), "offloading pool curves");
            self.ship(dst, batch)?;
        }

        let space = self.space;
        let holders: Vec<Rank> = self
            .state
            .slaves
            .iter()
            .filter(|s| {
                s.initialized
                    && (0..space.len())
                        .any(|i| !s.domain_loaded[i] && s.domain_cnt[i] > 0 && wanted(&space.id(i)))
            })
            .map(|s| s.rank)
            .collect();
        let msg = Message::Offload {
            dst,
            domains: domains.to_vec(),
        };
        for slave in holders {
            self.transport.send_message(slave, &msg)?;
        }
        Ok(())
    }

    fn broadcast_slaves(&mut self, msg: &Message) -> Result<(), SchedError> {
        for slave in self.state.slaves.iter().map(|s| s.rank).collect::<Vec<_>>() {
            self.transport.send_message(slave, msg)?;
        }
        Ok(())
    }

    fn forward_status(&mut self, force: bool) -> Result<(), SchedError> {
        let words = self.state.status_vector();
        if let Some((counts, terminated)) = self.reporter.prepare(words, force) {
            self.transport
                .send_message(ROOT, &Message::MasterStatus { counts, terminated })?;
            self.stats.status_sent += 1;
        }
        Ok(())
    }

    /// Root only. Stops everyone once no group holds curves and every seeded curve has
    /// been accounted for. A long quiet spell without completion asks for fresh reports,
    /// replacing speculative bookkeeping with ground truth.
    fn check_completion(&mut self, heard: usize) -> Result<bool, SchedError> {
        let own_idle = self.state.all_initialized() && self.state.curve_total() == 0;
        let peers_idle = self.masters[1..]
            .iter()
            .all(|m| m.initialized && m.sl_count == 0);
        if own_idle && peers_idle && self.terminated >= self.total_curves {
            if self.terminated > self.total_curves {
                warn!(terminated = self.terminated, total = self.total_curves, "more terminations than curves");
            }
            self.broadcast_stop()?;
            return Ok(true);
        }

        if heard > 0 || self.slave_update || self.master_update {
            self.quiet_cycles = 0;
            return Ok(false);
        }
        self.quiet_cycles += 1;
        if self.quiet_cycles >= STALL_CYCLES_BEFORE_FORCE {
            warn!(
                terminated = self.terminated,
                total = self.total_curves,
                "no progress, forcing fresh status reports"
            );
            self.quiet_cycles = 0;
            self.broadcast_slaves(&Message::ForceStatus)?;
            for peer in self.peers.clone() {
                self.transport.send_message(peer, &Message::ForceStatus)?;
            }
        }
        Ok(false)
    }

    fn broadcast_stop(&mut self) -> Result<(), SchedError> {
        self.broadcast_slaves(&Message::Done)?;
        for peer in self.peers.clone() {
            self.transport.send_message(peer, &Message::Done)?;
        }
        self.stats.stop_broadcasts += 1;
        self.stopped = true;
        info!(terminated = self.terminated, "all curves terminated, stop broadcast");
        Ok(())
    }
}
