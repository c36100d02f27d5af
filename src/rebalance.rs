//! Master-side rebalancing heuristics.
//!
//! Each case reads the group view, decides, and applies speculative updates to the
//! `SlaveInfo` records so later cases in the same cycle (and later cycles before the next
//! report) see the effect of what was already ordered. Decisions come back as
//! [`Directive`]s; the master turns them into messages.

use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::arena::CurveArena;
use crate::config::{HeuristicSet, SchedulerConfig};
use crate::curve::Curve;
use crate::domain::DomainSpace;
use crate::fabric::Rank;
use crate::status::{MasterInfo, SlaveInfo, encode_status};

/// One scheduling decision. Domains are flat indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Ship these pool curves to `slave`.
    Assign { slave: Rank, curves: Vec<Curve> },
    LoadDomain { slave: Rank, domain: usize },
    /// Tell `from` to push up to `count` curves of `domain` to `to`.
    SendCurves {
        from: Rank,
        to: Rank,
        domain: usize,
        count: u32,
    },
    /// Tell `from` to move waiting curves for `domains` (any, if empty) to `to`.
    Offload {
        from: Rank,
        to: Rank,
        domains: Vec<usize>,
    },
}

/// Everything a master knows about its group.
#[derive(Debug)]
pub struct GroupState {
    pub space: DomainSpace,
    pub slaves: Vec<SlaveInfo>,
    /// Curves held by the master, not yet handed to a slave.
    pub pool: CurveArena,
    /// Waiting curves per domain across the group (slave backlog plus pool).
    pub sl_dom_cnts: Vec<u32>,
    /// Number of slaves with each domain resident.
    pub dom_loaded: Vec<u32>,
}

impl GroupState {
    pub fn new(space: DomainSpace, slaves: impl IntoIterator<Item = Rank>) -> Self {
        let n = space.len();
        Self {
            space,
            slaves: slaves.into_iter().map(|r| SlaveInfo::new(r, n)).collect(),
            pool: CurveArena::new(),
            sl_dom_cnts: vec![0; n],
            dom_loaded: vec![0; n],
        }
    }

    pub fn slave_mut(&mut self, rank: Rank) -> Option<&mut SlaveInfo> {
        self.slaves.iter_mut().find(|s| s.rank == rank)
    }

    pub fn recompute_totals(&mut self) {
        self.sl_dom_cnts = self.pool.counts_by_domain(&self.space);
        self.dom_loaded.iter_mut().for_each(|n| *n = 0);
        for s in self.slaves.iter().filter(|s| s.initialized) {
            for d in 0..self.space.len() {
                if s.domain_loaded[d] {
                    self.dom_loaded[d] += 1;
                } else {
                    self.sl_dom_cnts[d] += s.domain_cnt[d];
                }
            }
        }
    }

    pub fn all_initialized(&self) -> bool {
        self.slaves.iter().all(|s| s.initialized)
    }

    /// Curves the group is known to hold: pool plus every slave's last report.
    pub fn curve_total(&self) -> u64 {
        self.pool.len() as u64 + self.slaves.iter().map(|s| s.sl_count as u64).sum::<u64>()
    }

    /// Group-level status vector for the root: a domain is resident if any slave has it.
    pub fn status_vector(&self) -> Vec<i32> {
        let mut counts = self.pool.counts_by_domain(&self.space);
        let mut resident = vec![false; self.space.len()];
        for s in self.slaves.iter().filter(|s| s.initialized) {
            for d in 0..self.space.len() {
                counts[d] += s.domain_cnt[d];
                resident[d] |= s.domain_loaded[d];
            }
        }
        encode_status(&counts, &resident)
    }

    pub fn reset_updates(&mut self) {
        for s in &mut self.slaves {
            s.just_updated = false;
        }
    }
}

pub struct Rebalancer<R: Rng = ChaCha8Rng> {
    policy: HeuristicSet,
    max_batch: usize,
    case4_threshold: usize,
    overload_cap: usize,
    transfer_limit: usize,
    rng: R,
}

impl Rebalancer<ChaCha8Rng> {
    /// Seeded from the configuration, mixed with the rank so masters do not mirror each other.
    pub fn new(config: &SchedulerConfig, rank: Rank) -> Self {
        let seed = config.rng_seed ^ (rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self::with_rng(config, ChaCha8Rng::seed_from_u64(seed))
    }
}

impl<R: Rng> Rebalancer<R> {
    pub fn with_rng(config: &SchedulerConfig, rng: R) -> Self {
        Self {
            policy: config.heuristics,
            max_batch: config.max_batch,
            case4_threshold: config.case4_threshold(),
            overload_cap: config.overload_cap(),
            transfer_limit: config.transfer_limit(),
            rng,
        }
    }

    /// One full scheduling pass in the fixed case order. Clears `just_updated` at the end.
    pub fn cycle(&mut self, g: &mut GroupState) -> Vec<Directive> {
        g.recompute_totals();
        let mut out = Vec::new();
        if self.policy.case4 {
            out.extend(self.case4(g, self.case4_threshold));
        }
        if self.policy.case1 {
            out.extend(self.case1(g));
        }
        if self.policy.case2 {
            out.extend(self.case2(g));
        }
        if self.policy.case4 {
            out.extend(self.case4(g, 0));
        }
        if self.policy.case3 {
            out.extend(self.case3(g));
        }
        if self.policy.case5 {
            out.extend(self.case5(g, None));
        }
        g.reset_updates();
        if !out.is_empty() {
            debug!(directives = out.len(), pool = g.pool.len(), "rebalance cycle");
        }
        out
    }

    /// Force a load on fresh slackers whose backlog reaches `threshold`. The domain is the
    /// one with the most waiting curves.
    pub fn case4(&mut self, g: &mut GroupState, threshold: usize) -> Vec<Directive> {
        let mut out = Vec::new();
        for s in &mut g.slaves {
            if !(s.is_slacker() && s.just_updated) {
                continue;
            }
            if s.sl_oob_count == 0 || (s.sl_oob_count as usize) < threshold {
                continue;
            }
            let Some(d) = s.most_waited_domain() else {
                continue;
            };
            s.load_dom(d);
            g.dom_loaded[d] += 1;
            g.sl_dom_cnts[d] = g.sl_dom_cnts[d].saturating_sub(s.domain_cnt[d]);
            out.push(Directive::LoadDomain {
                slave: s.rank,
                domain: d,
            });
        }
        out
    }

    /// Hand slackers pool curves for domains they already have resident.
    pub fn case1(&mut self, g: &mut GroupState) -> Vec<Directive> {
        let mut out = Vec::new();
        let mut pool_counts = g.pool.counts_by_domain(&g.space);
        for i in 0..g.slaves.len() {
            if g.pool.is_empty() {
                break;
            }
            if !g.slaves[i].is_slacker() {
                continue;
            }
            let mut doms: Vec<(usize, u32)> = g.slaves[i]
                .resident_domains()
                .map(|d| (d, pool_counts[d]))
                .filter(|&(_, n)| n > 0)
                .collect();
            doms.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let mut batch = Vec::new();
            for (d, _) in doms {
                let want = self.max_batch - batch.len();
                if want == 0 {
                    break;
                }
                let got = g.pool.take_domain(g.space.id(d), want);
                pool_counts[d] -= got.len() as u32;
                g.sl_dom_cnts[d] = g.sl_dom_cnts[d].saturating_sub(got.len() as u32);
                g.slaves[i].add_sl(d, got.len() as u32);
                batch.extend(got);
            }
            if !batch.is_empty() {
                out.push(Directive::Assign {
                    slave: g.slaves[i].rank,
                    curves: batch,
                });
            }
        }
        out
    }

    /// Hand each remaining slacker a batch of one pool domain, preferring domains no slave
    /// has resident; the slave loads it on arrival.
    pub fn case2(&mut self, g: &mut GroupState) -> Vec<Directive> {
        let mut out = Vec::new();
        let mut pool_counts = g.pool.counts_by_domain(&g.space);
        for i in 0..g.slaves.len() {
            if g.pool.is_empty() {
                break;
            }
            if !g.slaves[i].is_slacker() {
                continue;
            }
            let mut candidates: Vec<usize> =
                (0..pool_counts.len()).filter(|&d| pool_counts[d] > 0).collect();
            candidates.sort_by(|&a, &b| pool_counts[b].cmp(&pool_counts[a]).then(a.cmp(&b)));
            let pick = match candidates.iter().find(|&&d| g.dom_loaded[d] == 0) {
                Some(&d) => d,
                None => match candidates.choose(&mut self.rng) {
                    Some(&d) => d,
                    None => break,
                },
            };

            let got = g.pool.take_domain(g.space.id(pick), self.max_batch);
            let n = got.len() as u32;
            pool_counts[pick] -= n;
            g.sl_dom_cnts[pick] = g.sl_dom_cnts[pick].saturating_sub(n);
            let slave = &mut g.slaves[i];
            if !slave.domain_loaded[pick] {
                slave.load_dom(pick);
                g.dom_loaded[pick] += 1;
            }
            slave.add_sl(pick, n);
            out.push(Directive::Assign {
                slave: slave.rank,
                curves: got,
            });
        }
        out
    }

    /// Move backlog from slaves lacking a domain to slaves that have it resident and room.
    pub fn case3(&mut self, g: &mut GroupState) -> Vec<Directive> {
        let mut out = Vec::new();
        let cap = self.overload_cap as u32;
        for src in 0..g.slaves.len() {
            if !(g.slaves[src].initialized && g.slaves[src].just_updated) {
                continue;
            }
            for d in 0..g.space.len() {
                let mut backlog = g.slaves[src].domain_cnt[d];
                if backlog == 0 || g.slaves[src].domain_loaded[d] {
                    continue;
                }
                let mut candidates: Vec<usize> = (0..g.slaves.len())
                    .filter(|&j| {
                        let s = &g.slaves[j];
                        j != src && s.initialized && s.domain_loaded[d] && s.sl_count < cap
                    })
                    .collect();
                candidates.shuffle(&mut self.rng);

                for dst in candidates {
                    if backlog == 0 {
                        break;
                    }
                    let room = cap.saturating_sub(g.slaves[dst].sl_count);
                    let n = backlog.min(self.transfer_limit as u32).min(room);
                    if n == 0 {
                        continue;
                    }
                    g.slaves[src].remove_sl(d, n);
                    g.slaves[dst].add_sl(d, n);
                    g.sl_dom_cnts[d] = g.sl_dom_cnts[d].saturating_sub(n);
                    backlog -= n;
                    out.push(Directive::SendCurves {
                        from: g.slaves[src].rank,
                        to: g.slaves[dst].rank,
                        domain: d,
                        count: n,
                    });
                }
            }
        }
        out
    }

    /// Move curves from overloaded slaves to idle ones, pairing at random. With a filter,
    /// only the listed domains are moved.
    pub fn case5(&mut self, g: &mut GroupState, filter: Option<&[usize]>) -> Vec<Directive> {
        let cap = self.overload_cap as u32;
        let mut idle: Vec<usize> = (0..g.slaves.len())
            .filter(|&i| g.slaves[i].initialized && g.slaves[i].sl_count == 0)
            .collect();
        let mut busy: Vec<usize> = (0..g.slaves.len())
            .filter(|&i| {
                let s = &g.slaves[i];
                s.initialized && s.just_updated && s.sl_loaded_count >= cap
            })
            .collect();
        idle.shuffle(&mut self.rng);
        busy.shuffle(&mut self.rng);

        let mut out = Vec::new();
        for (&b, &i) in busy.iter().zip(&idle) {
            let best = g.slaves[b]
                .resident_domains()
                .filter(|d| filter.is_none_or(|f| f.contains(d)))
                .max_by(|&x, &y| {
                    let c = &g.slaves[b].domain_cnt;
                    c[x].cmp(&c[y]).then(y.cmp(&x))
                });
            let Some(d) = best else {
                continue;
            };
            let n = (g.slaves[b].domain_cnt[d] / 2).min(self.transfer_limit as u32);
            if n == 0 {
                continue;
            }
            g.slaves[b].remove_sl(d, n);
            g.slaves[i].add_sl(d, n);
            out.push(Directive::SendCurves {
                from: g.slaves[b].rank,
                to: g.slaves[i].rank,
                domain: d,
                count: n,
            });
        }
        out
    }

    /// Root only: pair busy masters with idle ones at random and have each busy master
    /// offload toward the idle master's resident domains. `masters` includes the root's own
    /// group record.
    pub fn manage_masters(&mut self, masters: &mut [MasterInfo]) -> Vec<Directive> {
        if !self.policy.manage_masters {
            return Vec::new();
        }
        let mut idle: Vec<usize> = (0..masters.len())
            .filter(|&i| masters[i].initialized && masters[i].sl_count == 0)
            .collect();
        let mut busy: Vec<usize> = (0..masters.len())
            .filter(|&i| {
                let m = &masters[i];
                m.initialized && m.just_updated && m.sl_count > 0
            })
            .collect();
        if idle.is_empty() || busy.is_empty() {
            return Vec::new();
        }
        idle.shuffle(&mut self.rng);
        busy.shuffle(&mut self.rng);

        busy.iter()
            .zip(&idle)
            .map(|(&b, &i)| Directive::Offload {
                from: masters[b].rank,
                to: masters[i].rank,
                domains: masters[i].resident_domains().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainId;

    const SPACE: DomainSpace = DomainSpace::new(6, 1);

    fn config(max_batch: usize) -> SchedulerConfig {
        SchedulerConfig {
            rng_seed: 17,
            ..SchedulerConfig::new(max_batch, 5, SPACE)
        }
    }

    fn pool_curves(domain: u32, n: u64, first_id: u64) -> Vec<Curve> {
        (first_id..first_id + n)
            .map(|id| {
                Curve::new(id, DomainId::new(domain, 0), [domain as f64 + 0.5, 0.0, 0.0], 0.1, 10)
            })
            .collect()
    }

    /// `reports[i]` is slave i's status vector.
    fn group(reports: &[Vec<i32>]) -> GroupState {
        let mut g = GroupState::new(SPACE, 1..=reports.len());
        for (s, r) in g.slaves.iter_mut().zip(reports) {
            s.update(r);
        }
        g
    }

    fn assigned(directives: &[Directive]) -> Vec<(Rank, usize)> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Assign { slave, curves } => Some((*slave, curves.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn case1_only_feeds_slaves_with_the_domain_resident() {
        let mut g = group(&[
            vec![0; 6],
            vec![0, 0, 0, 1, 0, 0],
            vec![0; 6],
        ]);
        g.pool.extend(pool_curves(3, 25, 0));
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.case1(&mut g);
        assert_eq!(assigned(&out), vec![(2, 10)]);
        assert_eq!(g.pool.len(), 15);
        assert_eq!(g.slaves[1].sl_loaded_count, 10);
        assert!(!g.slaves[1].is_slacker());
    }

    #[test]
    fn case2_prefers_domains_resident_nowhere() {
        let mut g = group(&[vec![0; 6], vec![0, 0, 0, 1, 0, 0]]);
        g.pool.extend(pool_curves(3, 30, 0));
        g.pool.extend(pool_curves(5, 4, 100));
        g.recompute_totals();
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.case2(&mut g);
        // Slave 1 gets domain 5 (unloaded everywhere) despite domain 3 having more curves.
        match &out[0] {
            Directive::Assign { slave: 1, curves } => {
                assert_eq!(curves.len(), 4);
                assert!(curves.iter().all(|c| c.domain.domain == 5));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(g.slaves[0].domain_loaded[5]);
        assert_eq!(g.dom_loaded[5], 1);
    }

    #[test]
    fn case2_falls_back_to_a_random_resident_domain() {
        let mut g = group(&[vec![0; 6], vec![0, 0, 0, 1, 0, 0]]);
        g.pool.extend(pool_curves(3, 30, 0));
        g.recompute_totals();
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.case2(&mut g);
        // Slave 2 already has domain 3 and no curves, so it is a slacker too.
        assert_eq!(assigned(&out), vec![(1, 10), (2, 10)]);
        assert_eq!(g.dom_loaded[3], 2);
    }

    #[test]
    fn case4_threshold_gates_forced_loads() {
        let mut g = group(&[vec![0, -20, -40, 0, 0, 0], vec![0, -3, 0, 0, 0, 0]]);
        g.recompute_totals();
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.case4(&mut g, 30);
        assert_eq!(out, vec![Directive::LoadDomain { slave: 1, domain: 2 }]);
        assert!(g.slaves[0].domain_loaded[2]);

        let out = r.case4(&mut g, 0);
        assert_eq!(out, vec![Directive::LoadDomain { slave: 2, domain: 1 }]);
    }

    #[test]
    fn case4_ignores_stale_and_uninitialized_slaves() {
        let mut g = group(&[vec![0, -50, 0, 0, 0, 0]]);
        g.slaves.push(SlaveInfo::new(9, SPACE.len()));
        g.reset_updates();
        let mut r = Rebalancer::new(&config(10), 0);
        assert!(r.case4(&mut g, 0).is_empty());
    }

    #[test]
    fn case3_respects_transfer_limit_and_destination_room() {
        // Slave 1 waits on 80 curves of domain 2; slaves 2 and 3 have it resident.
        let mut g = group(&[
            vec![0, 0, -80, 0, 0, 0],
            vec![0, 0, 96, 0, 0, 0],
            vec![0, 0, 1, 0, 0, 0],
        ]);
        g.recompute_totals();
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.case3(&mut g);
        let mut moved = 0;
        for d in &out {
            match d {
                Directive::SendCurves { from: 1, to, domain: 2, count } => {
                    assert!(*count <= 50, "transfer limit is 5 batches");
                    if *to == 2 {
                        assert!(*count <= 5, "slave 2 only has room for 5");
                    }
                    moved += count;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(moved, 55);
        assert_eq!(g.slaves[0].domain_cnt[2], 25);
        assert!(g.slaves[1].sl_count <= 100 && g.slaves[2].sl_count <= 100);
    }

    #[test]
    fn case3_skips_full_destinations() {
        let mut g = group(&[vec![0, -10, 0, 0, 0, 0], vec![0, 101, 0, 0, 0, 0]]);
        let mut r = Rebalancer::new(&config(10), 0);
        assert!(r.case3(&mut g).is_empty());
    }

    #[test]
    fn hot_domain_spreads_through_assignment_alone() {
        let mut g = group(&[
            vec![0; 6],
            vec![0, 0, 0, 1, 0, 0],
            vec![0; 6],
            vec![0; 6],
        ]);
        g.pool.extend(pool_curves(3, 100, 0));
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.cycle(&mut g);

        assert!(out.iter().all(|d| matches!(d, Directive::Assign { .. })), "{out:?}");
        let mut got = assigned(&out);
        got.sort_unstable();
        assert_eq!(got, vec![(1, 10), (2, 10), (3, 10), (4, 10)]);
        assert_eq!(g.pool.len(), 60);
        assert!(g.slaves.iter().all(|s| s.domain_loaded[3]));
        assert_eq!(g.dom_loaded[3], 4);
    }

    #[test]
    fn case5_moves_from_overloaded_to_idle() {
        let mut g = group(&[vec![0, 121, 0, 0, 0, 0], vec![0; 6], vec![0; 6]]);
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.case5(&mut g, None);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Directive::SendCurves { from: 1, to, domain: 1, count: 50 } => {
                assert!(*to == 2 || *to == 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(g.slaves[0].domain_cnt[1], 70);
    }

    #[test]
    fn case5_filter_excludes_other_domains() {
        let mut g = group(&[vec![0, 121, 0, 0, 0, 0], vec![0; 6]]);
        let mut r = Rebalancer::new(&config(10), 0);
        assert!(r.case5(&mut g, Some(&[4][..])).is_empty());
    }

    #[test]
    fn case5_is_off_by_default() {
        let mut g = group(&[vec![0, 121, 0, 0, 0, 0], vec![0; 6]]);
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.cycle(&mut g);
        assert!(out.is_empty(), "{out:?}");
    }

    #[test]
    fn cycle_resets_freshness() {
        let mut g = group(&[vec![0, -4, 0, 0, 0, 0]]);
        let mut r = Rebalancer::new(&config(10), 0);
        assert_eq!(r.cycle(&mut g).len(), 1);
        assert!(g.slaves.iter().all(|s| !s.just_updated));
    }

    #[test]
    fn same_seed_same_decisions() {
        let run = || {
            let mut g = group(&[vec![0; 6], vec![0; 6], vec![0; 6]]);
            g.pool.extend(pool_curves(1, 10, 0));
            g.pool.extend(pool_curves(2, 10, 10));
            let mut r = Rebalancer::new(&config(3), 0);
            r.cycle(&mut g)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn manage_masters_pairs_busy_with_idle() {
        let mut masters = vec![
            SlaveInfo::new(0, SPACE.len()),
            SlaveInfo::new(1, SPACE.len()),
            SlaveInfo::new(2, SPACE.len()),
        ];
        masters[0].update(&[0, 50, -20, 0, 0, 0]);
        masters[1].update(&[1, 0, 0, 1, 0, 0]);
        masters[2].update(&[0, 2, 0, 0, 0, 0]);
        let mut r = Rebalancer::new(&config(10), 0);
        let out = r.manage_masters(&mut masters);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Directive::Offload { from, to: 1, domains } => {
                assert!(*from == 0 || *from == 2);
                assert_eq!(domains, &vec![0, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn manage_masters_needs_both_sides() {
        let mut masters = vec![SlaveInfo::new(0, SPACE.len()), SlaveInfo::new(1, SPACE.len())];
        masters[0].update(&[0, 5, 0, 0, 0, 0]);
        masters[1].update(&[0, 5, 0, 0, 0, 0]);
        let mut r = Rebalancer::new(&config(10), 0);
        assert!(r.manage_masters(&mut masters).is_empty());
    }

    #[test]
    fn group_status_vector_merges_pool_and_slaves() {
        let mut g = group(&[vec![1, -2, 0, 0, 0, 0], vec![0, 3, 0, 0, 0, 0]]);
        g.pool.extend(pool_curves(4, 2, 0));
        assert_eq!(g.status_vector(), vec![1, 5, 0, 0, -2, 0]);
        assert_eq!(g.curve_total(), 6);
    }
}
