//! Worker-group partitioning. Every rank computes the same layout independently.

use std::ops::Range;

use crate::config::ConfigError;
use crate::fabric::Rank;

/// The rank that coordinates all masters.
pub const ROOT: Rank = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master {
        slaves: Range<Rank>,
        /// Root: every other master. Others: just the root.
        peers: Vec<Rank>,
    },
    Slave { master: Rank },
}

/// Ranks `[0, num_masters)` are masters; each master owns one contiguous slave range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGroups {
    n_procs: usize,
    slave_ranges: Vec<Range<Rank>>,
}

impl WorkGroups {
    /// `work_group_size` must already be validated and clamped to `n_procs`.
    pub fn new(n_procs: usize, work_group_size: usize) -> Result<Self, ConfigError> {
        if n_procs < 2 {
            return Err(ConfigError::TooFewProcesses(n_procs));
        }
        if work_group_size < 2 {
            return Err(ConfigError::WorkGroupTooSmall(work_group_size));
        }
        let num_masters = (n_procs / work_group_size).max(1);
        let num_slaves = n_procs - num_masters;
        let base = num_slaves / num_masters;
        let extra = num_slaves % num_masters;

        let mut next = num_masters;
        let slave_ranges = (0..num_masters)
            .map(|m| {
                let n = base + usize::from(m < extra);
                let range = next..next + n;
                next += n;
                range
            })
            .collect();
        Ok(Self {
            n_procs,
            slave_ranges,
        })
    }

    pub fn num_masters(&self) -> usize {
        self.slave_ranges.len()
    }

    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    pub fn masters(&self) -> Range<Rank> {
        0..self.num_masters()
    }

    pub fn is_master(&self, rank: Rank) -> bool {
        rank < self.num_masters()
    }

    pub fn slaves_of(&self, master: Rank) -> Range<Rank> {
        self.slave_ranges[master].clone()
    }

    pub fn master_of(&self, slave: Rank) -> Option<Rank> {
        self.slave_ranges.iter().position(|r| r.contains(&slave))
    }

    /// Master first, then its slaves.
    pub fn group_members(&self, master: Rank) -> Vec<Rank> {
        std::iter::once(master).chain(self.slaves_of(master)).collect()
    }

    pub fn role(&self, rank: Rank) -> Result<Role, ConfigError> {
        if rank >= self.n_procs {
            return Err(ConfigError::RankOutOfRange {
                rank,
                n_procs: self.n_procs,
            });
        }
        if self.is_master(rank) {
            let peers = if rank == ROOT {
                (1..self.num_masters()).collect()
            } else {
                vec![ROOT]
            };
            return Ok(Role::Master {
                slaves: self.slaves_of(rank),
                peers,
            });
        }
        let master = self
            .master_of(rank)
            .ok_or(ConfigError::RankOutOfRange {
                rank,
                n_procs: self.n_procs,
            })?;
        Ok(Role::Slave { master })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_exhaustive_disjoint_and_contiguous() {
        for n_procs in 2..40 {
            for wgs in 2..=n_procs {
                let g = WorkGroups::new(n_procs, wgs).unwrap();
                let m = g.num_masters();
                assert_eq!(m, (n_procs / wgs).max(1));

                let mut next = m;
                for master in g.masters() {
                    let r = g.slaves_of(master);
                    assert_eq!(r.start, next, "contiguous ({n_procs}, {wgs})");
                    assert!(!r.is_empty(), "every group has a slave ({n_procs}, {wgs})");
                    next = r.end;
                }
                assert_eq!(next, n_procs, "exhaustive ({n_procs}, {wgs})");

                let sizes: Vec<usize> = g.masters().map(|x| g.slaves_of(x).len()).collect();
                let (lo, hi) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
                assert!(hi - lo <= 1, "remainder spread evenly");
                assert!(sizes.windows(2).all(|w| w[0] >= w[1]), "extras go to the first masters");
            }
        }
    }

    #[test]
    fn every_slave_has_exactly_one_master() {
        let g = WorkGroups::new(23, 5).unwrap();
        for rank in g.num_masters()..23 {
            let owners: Vec<Rank> = g
                .masters()
                .filter(|&m| g.slaves_of(m).contains(&rank))
                .collect();
            assert_eq!(owners.len(), 1);
            assert_eq!(g.role(rank).unwrap(), Role::Slave { master: owners[0] });
        }
    }

    #[test]
    fn root_peers_are_the_other_masters() {
        let g = WorkGroups::new(20, 4).unwrap();
        match g.role(ROOT).unwrap() {
            Role::Master { peers, .. } => assert_eq!(peers, vec![1, 2, 3, 4]),
            other => panic!("root is {other:?}"),
        }
        for m in 1..5 {
            match g.role(m).unwrap() {
                Role::Master { peers, .. } => assert_eq!(peers, vec![ROOT]),
                other => panic!("master {m} is {other:?}"),
            }
        }
    }

    #[test]
    fn single_group_when_size_exceeds_half() {
        let g = WorkGroups::new(5, 5).unwrap();
        assert_eq!(g.num_masters(), 1);
        assert_eq!(g.slaves_of(0), 1..5);
        assert_eq!(g.group_members(0), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let g = WorkGroups::new(4, 2).unwrap();
        assert!(matches!(
            g.role(4),
            Err(ConfigError::RankOutOfRange { rank: 4, n_procs: 4 })
        ));
    }
}
