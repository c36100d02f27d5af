use std::fmt;

/// A (spatial block, timestep) pair. Ordered domain-major, timestep-minor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DomainId {
    pub domain: u32,
    pub timestep: u32,
}

impl DomainId {
    pub const fn new(domain: u32, timestep: u32) -> Self {
        Self { domain, timestep }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.domain, self.timestep)
    }
}

/// The fixed domain totals. Identical on every rank; defines the flat index space
/// used by status vectors and per-domain counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainSpace {
    pub num_domains: u32,
    pub num_timesteps: u32,
}

impl DomainSpace {
    pub const fn new(num_domains: u32, num_timesteps: u32) -> Self {
        Self {
            num_domains,
            num_timesteps,
        }
    }

    /// `NUM_DOMAINS`: size of the flat index space.
    pub fn len(&self) -> usize {
        self.num_domains as usize * self.num_timesteps as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: DomainId) -> bool {
        id.domain < self.num_domains && id.timestep < self.num_timesteps
    }

    pub fn index(&self, id: DomainId) -> usize {
        debug_assert!(self.contains(id), "domain {id} outside {self:?}");
        id.domain as usize * self.num_timesteps as usize + id.timestep as usize
    }

    pub fn id(&self, index: usize) -> DomainId {
        let nts = self.num_timesteps as usize;
        DomainId::new((index / nts) as u32, (index % nts) as u32)
    }

    pub fn iter(&self) -> impl Iterator<Item = DomainId> + '_ {
        (0..self.len()).map(|i| self.id(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_bijective_and_order_preserving() {
        let space = DomainSpace::new(5, 3);
        assert_eq!(space.len(), 15);
        let ids: Vec<DomainId> = space.iter().collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(space.index(*id), i);
            assert_eq!(space.id(i), *id);
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, ids);
    }

    #[test]
    fn ordering_is_domain_major() {
        assert!(DomainId::new(1, 9) < DomainId::new(2, 0));
        assert!(DomainId::new(2, 0) < DomainId::new(2, 1));
    }

    #[test]
    fn contains_rejects_out_of_range() {
        let space = DomainSpace::new(2, 2);
        assert!(space.contains(DomainId::new(1, 1)));
        assert!(!space.contains(DomainId::new(2, 0)));
        assert!(!space.contains(DomainId::new(0, 2)));
    }
}
