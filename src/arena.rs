//! Index-stable curve container.
//!
//! Keys stay valid while other curves are removed, so a scan can record keys first and
//! remove them in a second pass without invalidating anything it still has to visit.

use slab::Slab;

use crate::curve::{Curve, CurveId};
use crate::domain::{DomainId, DomainSpace};

#[derive(Debug, Default)]
pub struct CurveArena {
    slots: Slab<Curve>,
}

impl CurveArena {
    pub fn new() -> Self {
        Self { slots: Slab::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&mut self, curve: Curve) -> usize {
        self.slots.insert(curve)
    }

    pub fn extend(&mut self, curves: impl IntoIterator<Item = Curve>) {
        for c in curves {
            self.slots.insert(c);
        }
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut Curve> {
        self.slots.get_mut(key)
    }

    pub fn remove(&mut self, key: usize) -> Option<Curve> {
        self.slots.try_remove(key)
    }

    /// Snapshot of the current keys, for scans that mutate the arena.
    pub fn keys(&self) -> Vec<usize> {
        self.slots.iter().map(|(k, _)| k).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Curve> {
        self.slots.iter().map(|(_, c)| c)
    }

    pub fn ids(&self) -> impl Iterator<Item = CurveId> + '_ {
        self.iter().map(|c| c.id)
    }

    /// Remove up to `limit` curves matching `pred`, in key order.
    pub fn take_where<P>(&mut self, limit: usize, mut pred: P) -> Vec<Curve>
    where
        P: FnMut(&Curve) -> bool,
    {
        let doomed: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, c)| pred(c))
            .map(|(k, _)| k)
            .take(limit)
            .collect();
        doomed.into_iter().map(|k| self.slots.remove(k)).collect()
    }

    pub fn take_domain(&mut self, domain: DomainId, limit: usize) -> Vec<Curve> {
        self.take_where(limit, |c| c.domain == domain)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Curve> + '_ {
        self.slots.drain()
    }

    /// Number of curves per flat domain index.
    pub fn counts_by_domain(&self, space: &DomainSpace) -> Vec<u32> {
        let mut counts = vec![0u32; space.len()];
        for c in self.iter() {
            counts[space.index(c.domain)] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(id: CurveId, domain: u32) -> Curve {
        Curve::new(id, DomainId::new(domain, 0), [domain as f64 + 0.5, 0.0, 0.0], 0.1, 10)
    }

    #[test]
    fn keys_survive_removal_of_others() {
        let mut arena = CurveArena::new();
        let a = arena.insert(curve(1, 0));
        let b = arena.insert(curve(2, 1));
        let c = arena.insert(curve(3, 2));
        assert_eq!(arena.remove(b).map(|x| x.id), Some(2));
        assert_eq!(arena.get_mut(a).map(|x| x.id), Some(1));
        assert_eq!(arena.get_mut(c).map(|x| x.id), Some(3));
        assert!(arena.remove(b).is_none());
    }

    #[test]
    fn take_domain_honours_limit() {
        let mut arena = CurveArena::new();
        arena.extend((0..6).map(|i| curve(i, (i % 2) as u32)));
        let taken = arena.take_domain(DomainId::new(1, 0), 2);
        assert_eq!(taken.len(), 2);
        assert!(taken.iter().all(|c| c.domain.domain == 1));
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn counts_by_domain_matches_contents() {
        let space = DomainSpace::new(3, 1);
        let mut arena = CurveArena::new();
        arena.extend([curve(0, 0), curve(1, 2), curve(2, 2)]);
        assert_eq!(arena.counts_by_domain(&space), vec![1, 0, 2]);
    }
}
