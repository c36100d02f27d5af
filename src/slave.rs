//! Slave worker: integrates curves in resident domains and follows its master's orders.
//!
//! Curves live in two arenas. `active` holds curves whose domain is resident, `oob` holds
//! curves waiting for a domain this rank does not have. Each cycle re-splits them, advances
//! the active set one traversal at a time, and drains control traffic between traversals
//! so SEND_CURVES and STOP are seen promptly.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::arena::CurveArena;
use crate::config::SchedulerConfig;
use crate::curve::{Curve, CurveStatus};
use crate::domain::{DomainId, DomainSpace};
use crate::error::SchedError;
use crate::fabric::{Fabric, Rank};
use crate::host::{Collaborators, DomainStore, Integrator};
use crate::metrics;
use crate::protocol::Message;
use crate::stats::WorkerStats;
use crate::status::{StatusReporter, encode_status};
use crate::transport::Transport;
use crate::worker::LoopOutput;

pub struct SlaveState<F: Fabric> {
    transport: Transport<F>,
    master: Rank,
    /// Master first, then every slave of the group.
    group: Vec<Rank>,
    space: DomainSpace,
    domains: Box<dyn DomainStore + Send>,
    integrator: Box<dyn Integrator + Send>,
    active: CurveArena,
    oob: CurveArena,
    terminated: Vec<Curve>,
    fragments: Vec<Curve>,
    reporter: StatusReporter,
    stats: WorkerStats,
    offload_cap: usize,
    idle_sleep: Duration,
    window: usize,
    stopped: bool,
}

impl<F: Fabric> SlaveState<F> {
    pub fn new(
        config: &SchedulerConfig,
        transport: Transport<F>,
        master: Rank,
        group: Vec<Rank>,
        host: Collaborators,
    ) -> Self {
        Self {
            transport,
            master,
            group,
            space: config.space,
            domains: host.domains,
            integrator: host.integrator,
            active: CurveArena::new(),
            oob: CurveArena::new(),
            terminated: Vec::new(),
            fragments: Vec::new(),
            reporter: StatusReporter::new(),
            stats: WorkerStats::new(config.space.len()),
            offload_cap: config.offload_cap(),
            idle_sleep: config.idle_sleep,
            window: config.reassembly_window,
            stopped: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn master(&self) -> Rank {
        self.master
    }

    pub fn run(mut self) -> Result<LoopOutput<F>, SchedError> {
        let start = Instant::now();
        self.report(true)?;
        self.transport.barrier(&self.group);
        info!(rank = self.rank(), master = self.master, "slave started");

        while !self.stopped {
            self.cycle()?;
        }

        let stranded = self.active.len() + self.oob.len();
        if stranded > 0 {
            warn!(rank = self.rank(), stranded, "stopped while still holding curves");
        }
        self.stats.total = start.elapsed();
        Ok(LoopOutput {
            transport: self.transport,
            owned: self.terminated,
            fragments: self.fragments,
            stats: self.stats,
            window: self.window,
        })
    }

    fn cycle(&mut self) -> Result<(), SchedError> {
        self.transport.poll_completed_sends();
        self.repartition();

        for key in self.active.keys() {
            if self.stopped {
                return Ok(());
            }
            self.advance(key);
            if self.active.is_empty() {
                self.report(false)?;
            }
            self.process_messages()?;
        }

        let t = Instant::now();
        self.receive_curves()?;
        self.process_messages()?;
        self.report(false)?;
        self.stats.comm += t.elapsed();

        if self.active.is_empty() && !self.stopped {
            let t = Instant::now();
            std::thread::sleep(self.idle_sleep);
            self.stats.idle += t.elapsed();
            metrics::inc_idle_sleeps();
        }
        Ok(())
    }

    /// Put every curve in the arena matching its domain's current residency.
    fn repartition(&mut self) {
        let waiting: Vec<Curve> = self.oob.drain().collect();
        self.active.extend(waiting);
        let domains = &self.domains;
        let away = self
            .active
            .take_where(usize::MAX, |c| !domains.domain_loaded(c.domain));
        self.oob.extend(away);
    }

    /// One domain traversal for the curve at `key`, if it is still here and still resident.
    fn advance(&mut self, key: usize) {
        let Some(curve) = self.active.get_mut(key) else {
            return;
        };
        if !self.domains.domain_loaded(curve.domain) {
            if let Some(c) = self.active.remove(key) {
                self.oob.insert(c);
            }
            return;
        }

        let t = Instant::now();
        self.integrator.integrate(curve);
        self.stats.integration += t.elapsed();
        self.stats.integrate_calls += 1;

        match curve.status {
            CurveStatus::Active => {}
            CurveStatus::OutOfBounds => {
                curve.status = CurveStatus::Active;
                if !self.domains.domain_loaded(curve.domain) {
                    if let Some(c) = self.active.remove(key) {
                        self.oob.insert(c);
                    }
                }
            }
            CurveStatus::Terminated => {
                if let Some(c) = self.active.remove(key) {
                    self.terminated.push(c);
                    self.reporter.add_terminated(1);
                    self.stats.curves_terminated += 1;
                    metrics::inc_curves_terminated();
                }
            }
        }
    }

    fn early_terminate(&mut self, curve: Curve, source: Rank) {
        warn!(
            rank = self.rank(),
            id = curve.id,
            domain = %curve.domain,
            source,
            "curve endpoint outside its claimed domain, discarding"
        );
        self.reporter.add_terminated(1);
        self.stats.early_terminations += 1;
        metrics::inc_early_terminations();
    }

    fn load(&mut self, domain: DomainId) -> Result<(), SchedError> {
        self.domains.get_domain(domain)?;
        self.stats.domain_loads[self.space.index(domain)] += 1;
        metrics::inc_domain_loads();
        debug!(rank = self.rank(), %domain, "domain loaded");
        Ok(())
    }

    /// Admit pushed curves. Curves from our master are assignments: their domain is
    /// loaded on demand and a failed admission is fatal. Curves from peers wait out of
    /// bounds until their domain is made resident.
    fn receive_curves(&mut self) -> Result<(), SchedError> {
        for env in self.transport.receive_curves()? {
            let assigned = env.source == self.master;
            for curve in env.body {
                self.stats.curves_received += 1;
                let admissible = self.space.contains(curve.domain)
                    && self.domains.point_in_domain(curve.endpoint(), curve.domain);
                if !admissible {
                    if assigned {
                        return Err(SchedError::UnexpectedEarlyTermination {
                            id: curve.id,
                            domain: curve.domain,
                        });
                    }
                    self.early_terminate(curve, env.source);
                    continue;
                }
                if assigned && !self.domains.domain_loaded(curve.domain) {
                    self.load(curve.domain)?;
                }
                if self.domains.domain_loaded(curve.domain) {
                    self.active.insert(curve);
                } else {
                    self.oob.insert(curve);
                }
            }
        }
        Ok(())
    }

    fn process_messages(&mut self) -> Result<(), SchedError> {
        for env in self.transport.receive_messages()? {
            self.stats.status_received += 1;
            match env.body {
                Message::Done => self.stopped = true,
                Message::LoadDomain { domain } => self.load(domain)?,
                Message::SendCurves { dst, domain, count } => {
                    let count = count as usize;
                    let mut batch = self.oob.take_domain(domain, count);
                    if batch.len() < count {
                        batch.extend(self.active.take_domain(domain, count - batch.len()));
                    }
                    self.ship(dst, batch)?;
                }
                Message::Offload { dst, domains } => {
                    let batch = self.oob.take_where(self.offload_cap, |c| {
                        domains.is_empty() || domains.contains(&c.domain)
                    });
                    self.ship(dst, batch)?;
                }
                Message::ForceStatus => self.reporter.force_next(),
                other => {
                    warn!(rank = self.rank(), source = env.source, kind = other.kind(), "unexpected message");
                }
            }
        }
        Ok(())
    }

    fn ship(&mut self, dst: Rank, curves: Vec<Curve>) -> Result<(), SchedError> {
        if curves.is_empty() {
            return Ok(());
        }
        debug!(rank = self.rank(), dst, n = curves.len(), "shipping curves");
        self.stats.curves_sent += curves.len() as u64;
        let kept = self.transport.migrate(dst, curves)?;
        self.fragments.extend(kept);
        Ok(())
    }

    fn status_vector(&self) -> Vec<i32> {
        let mut counts = self.active.counts_by_domain(&self.space);
        for (n, m) in counts.iter_mut().zip(self.oob.counts_by_domain(&self.space)) {
            *n += m;
        }
        let resident: Vec<bool> = self
            .space
            .iter()
            .map(|d| self.domains.domain_loaded(d))
            .collect();
        encode_status(&counts, &resident)
    }

    fn report(&mut self, force: bool) -> Result<(), SchedError> {
        let words = self.status_vector();
        if let Some((counts, terminated)) = self.reporter.prepare(words, force) {
            self.transport
                .send_message(self.master, &Message::Status { counts, terminated })?;
            self.stats.status_sent += 1;
        }
        Ok(())
    }
}
