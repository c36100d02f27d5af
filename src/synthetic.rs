//! A self-contained host for the binary, tests and benches.
//!
//! Domain `d` is the slab `d <= x < d + 1`. The flow is steady and uniform along x with speed
//! `0.5 + y`, so every curve moves monotonically through increasing domain indices and
//! leaves the dataset past the last slab.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::curve::{Curve, CurveId, CurveStatus, Step};
use crate::domain::{DomainId, DomainSpace};
use crate::host::{Collaborators, DomainStore, HostError, Integrator};

pub const DEFAULT_STEP_SIZE: f64 = 0.05;

fn slab_of(x: f64) -> Option<u32> {
    (x >= 0.0).then(|| x.floor() as u32)
}

/// Least-recently-used set of resident domains.
#[derive(Debug, Clone)]
pub struct LruDomainCache {
    space: DomainSpace,
    capacity: usize,
    /// Front is least recently used.
    resident: VecDeque<DomainId>,
}

impl LruDomainCache {
    pub fn new(space: DomainSpace, capacity: usize) -> Self {
        Self {
            space,
            capacity: capacity.max(1),
            resident: VecDeque::new(),
        }
    }

    pub fn with_resident(
        space: DomainSpace,
        capacity: usize,
        preload: impl IntoIterator<Item = DomainId>,
    ) -> Result<Self, HostError> {
        let mut cache = Self::new(space, capacity);
        for d in preload {
            cache.get_domain(d)?;
        }
        Ok(cache)
    }

    pub fn resident(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.resident.iter().copied()
    }
}

impl DomainStore for LruDomainCache {
    fn get_domain(&mut self, domain: DomainId) -> Result<(), HostError> {
        if !self.space.contains(domain) {
            return Err(HostError::DomainLoad {
                domain,
                reason: "outside the domain space".into(),
            });
        }
        if let Some(pos) = self.resident.iter().position(|d| *d == domain) {
            self.resident.remove(pos);
        } else if self.resident.len() == self.capacity {
            self.resident.pop_front();
        }
        self.resident.push_back(domain);
        Ok(())
    }

    fn domain_loaded(&self, domain: DomainId) -> bool {
        self.resident.contains(&domain)
    }

    fn point_in_domain(&self, point: &[f64; 3], domain: DomainId) -> bool {
        self.space.contains(domain) && slab_of(point[0]) == Some(domain.domain)
    }
}

/// Integrates through one slab per call, recording every step.
#[derive(Debug, Clone, Copy)]
pub struct UniformFlow {
    space: DomainSpace,
}

impl UniformFlow {
    pub fn new(space: DomainSpace) -> Self {
        Self { space }
    }

    fn velocity(p: &[f64; 3]) -> f64 {
        0.5 + p[1]
    }
}

impl Integrator for UniformFlow {
    fn integrate(&mut self, curve: &mut Curve) {
        loop {
            if curve.steps_taken >= curve.max_steps {
                curve.status = CurveStatus::Terminated;
                return;
            }
            curve.position[0] += Self::velocity(&curve.position) * curve.step_size;
            curve.time += curve.step_size;
            curve.steps_taken += 1;
            curve.path.push(Step {
                position: curve.position,
                time: curve.time,
            });

            match slab_of(curve.position[0]) {
                Some(d) if d == curve.domain.domain => continue,
                Some(d) if d < self.space.num_domains => {
                    curve.domain = DomainId::new(d, curve.domain.timestep);
                    curve.status = CurveStatus::OutOfBounds;
                    return;
                }
                _ => {
                    curve.status = CurveStatus::Terminated;
                    return;
                }
            }
        }
    }
}

/// Collaborators for one slave with `preload` already resident.
pub fn collaborators(
    space: DomainSpace,
    cache_capacity: usize,
    preload: impl IntoIterator<Item = DomainId>,
) -> Result<Collaborators, HostError> {
    Ok(Collaborators {
        domains: Box::new(LruDomainCache::with_resident(space, cache_capacity, preload)?),
        integrator: Box::new(UniformFlow::new(space)),
    })
}

/// `count` seeds scattered over the whole space, with ids `0..count`.
pub fn seed_curves(space: DomainSpace, count: usize, max_steps: u32, rng_seed: u64) -> Vec<Curve> {
    let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);
    (0..count as CurveId)
        .map(|id| {
            let domain = space.id(rng.random_range(0..space.len()));
            let x = domain.domain as f64 + rng.random::<f64>() * 0.5;
            let y = rng.random::<f64>();
            Curve::new(id, domain, [x, y, 0.0], DEFAULT_STEP_SIZE, max_steps)
        })
        .collect()
}

/// `count` seeds inside one domain, with ids starting at `first_id`.
pub fn seeds_in_domain(domain: DomainId, count: usize, first_id: CurveId, max_steps: u32) -> Vec<Curve> {
    (0..count as CurveId)
        .map(|i| {
            let frac = (i as f64 + 0.5) / count.max(1) as f64;
            let x = domain.domain as f64 + 0.5 * frac;
            Curve::new(
                first_id + i,
                domain,
                [x, frac, 0.0],
                DEFAULT_STEP_SIZE,
                max_steps,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACE: DomainSpace = DomainSpace::new(4, 1);

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = LruDomainCache::new(SPACE, 2);
        cache.get_domain(DomainId::new(0, 0)).unwrap();
        cache.get_domain(DomainId::new(1, 0)).unwrap();
        cache.get_domain(DomainId::new(0, 0)).unwrap();
        cache.get_domain(DomainId::new(2, 0)).unwrap();
        assert!(cache.domain_loaded(DomainId::new(0, 0)));
        assert!(!cache.domain_loaded(DomainId::new(1, 0)));
        assert!(cache.domain_loaded(DomainId::new(2, 0)));
    }

    #[test]
    fn loading_outside_the_space_fails() {
        let mut cache = LruDomainCache::new(SPACE, 2);
        assert!(cache.get_domain(DomainId::new(9, 0)).is_err());
    }

    #[test]
    fn point_membership_follows_slabs() {
        let cache = LruDomainCache::new(SPACE, 1);
        assert!(cache.point_in_domain(&[2.3, 0.1, 0.0], DomainId::new(2, 0)));
        assert!(!cache.point_in_domain(&[3.0, 0.1, 0.0], DomainId::new(2, 0)));
        assert!(!cache.point_in_domain(&[-0.5, 0.1, 0.0], DomainId::new(0, 0)));
    }

    #[test]
    fn integration_stops_at_the_slab_boundary() {
        let mut flow = UniformFlow::new(SPACE);
        let mut c = Curve::new(0, DomainId::new(1, 0), [1.2, 0.5, 0.0], 0.1, 1000);
        flow.integrate(&mut c);
        assert_eq!(c.status, CurveStatus::OutOfBounds);
        assert_eq!(c.domain, DomainId::new(2, 0));
        assert!(c.position[0] >= 2.0 && c.position[0] < 3.0);
        assert_eq!(c.path.len() as u32, c.steps_taken);
        assert!(c.path.windows(2).all(|w| w[0].position[0] < w[1].position[0]));
    }

    #[test]
    fn leaving_the_dataset_terminates() {
        let mut flow = UniformFlow::new(SPACE);
        let mut c = Curve::new(0, DomainId::new(3, 0), [3.9, 0.5, 0.0], 0.1, 1000);
        flow.integrate(&mut c);
        assert!(c.is_terminated());
    }

    #[test]
    fn step_budget_terminates() {
        let mut flow = UniformFlow::new(SPACE);
        let mut c = Curve::new(0, DomainId::new(0, 0), [0.0, 0.0, 0.0], 0.01, 3);
        flow.integrate(&mut c);
        assert!(c.is_terminated());
        assert_eq!(c.steps_taken, 3);
    }

    #[test]
    fn seeds_land_in_their_domain() {
        let cache = LruDomainCache::new(SPACE, 1);
        let seeds = seed_curves(SPACE, 200, 100, 3);
        assert_eq!(seeds.len(), 200);
        assert!(seeds.iter().all(|c| cache.point_in_domain(c.endpoint(), c.domain)));
        assert_eq!(seeds, seed_curves(SPACE, 200, 100, 3));

        let d = DomainId::new(2, 0);
        let local = seeds_in_domain(d, 10, 50, 100);
        assert_eq!(local.first().map(|c| c.id), Some(50));
        assert!(local.iter().all(|c| cache.point_in_domain(c.endpoint(), d)));
    }
}
