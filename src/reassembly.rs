//! Collective reassembly of terminated curves from their migration fragments.
//!
//! Runs on every rank after the scheduling loops have stopped. Ids are processed in windows;
//! per window one sum-reduction tells every rank who owns each id (`rank + 1`, 0 for none)
//! and how many fragments exist for it. Fragments then travel to their owner, which waits for
//! the exact count before merging.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::curve::{Curve, CurveId, SerializeFlags};
use crate::error::SchedError;
use crate::fabric::{Channel, Fabric, Rank};
use crate::transport::Transport;

pub fn reassemble<F: Fabric>(
    transport: &mut Transport<F>,
    owned: Vec<Curve>,
    fragments: Vec<Curve>,
    total_ids: u64,
    window: usize,
) -> Result<Vec<Curve>, SchedError> {
    let rank = transport.rank();
    let window = window.max(1) as u64;

    let mut owned_by_id: BTreeMap<CurveId, Vec<Curve>> = BTreeMap::new();
    for c in owned {
        owned_by_id.entry(c.id).or_default().push(c);
    }
    let mut fragments = fragments;
    fragments.sort_by_key(|c| (c.id, c.sequence_cnt));

    let mut merged = Vec::with_capacity(owned_by_id.len());
    let mut dropped = 0usize;
    let mut rest = fragments.as_slice();
    let mut base = 0u64;
    while base < total_ids {
        let w = window.min(total_ids - base) as usize;
        let in_window = |id: CurveId| id >= base && id < base + w as u64;

        let split = rest.iter().position(|c| !in_window(c.id)).unwrap_or(rest.len());
        let (local_frags, tail) = rest.split_at(split);
        rest = tail;

        let mut reduce = vec![0i64; 2 * w];
        for id in owned_by_id.range(base..base + w as u64).map(|(id, _)| *id) {
            reduce[(id - base) as usize] += rank as i64 + 1;
        }
        for f in local_frags {
            reduce[w + (f.id - base) as usize] += 1;
        }
        transport.all_reduce_sum(&mut reduce);

        let mut outgoing: BTreeMap<Rank, Vec<Curve>> = BTreeMap::new();
        for f in local_frags {
            let owner = reduce[(f.id - base) as usize];
            if owner == 0 {
                dropped += 1;
                continue;
            }
            let owner = (owner - 1) as Rank;
            match owned_by_id.get_mut(&f.id) {
                Some(parts) if owner == rank => parts.push(f.clone()),
                _ => outgoing.entry(owner).or_default().push(f.clone()),
            }
        }
        for (dst, batch) in &outgoing {
            transport.send_curves(*dst, batch, SerializeFlags::FRAGMENT)?;
        }

        let mut expected = 0usize;
        let mut have = 0usize;
        for (id, parts) in owned_by_id.range(base..base + w as u64) {
            expected += reduce[w + (id - base) as usize] as usize;
            have += parts.len() - 1;
        }
        let mut missing = expected.saturating_sub(have);

        while missing > 0 || transport.in_flight_on(Channel::Curves) > 0 {
            transport.poll_completed_sends();
            for env in transport.receive_curves()? {
                for f in env.body {
                    let Some(parts) = owned_by_id.get_mut(&f.id).filter(|_| in_window(f.id)) else {
                        return Err(SchedError::MisroutedFragment { id: f.id, rank });
                    };
                    if missing == 0 {
                        let expected = reduce[w + (f.id - base) as usize] as usize;
                        return Err(SchedError::FragmentMismatch {
                            id: f.id,
                            rank,
                            expected,
                            found: parts.len(),
                        });
                    }
                    parts.push(f);
                    missing -= 1;
                }
            }
            std::thread::yield_now();
        }

        let ids: Vec<CurveId> = owned_by_id
            .range(base..base + w as u64)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(parts) = owned_by_id.remove(&id) else {
                continue;
            };
            let want = reduce[w + (id - base) as usize] as usize + 1;
            if parts.len() != want {
                return Err(SchedError::FragmentMismatch {
                    id,
                    rank,
                    expected: want,
                    found: parts.len(),
                });
            }
            merged.extend(Curve::merge_fragments(parts));
        }
        debug!(rank, base, window = w, "reassembly round done");
        base += w as u64;
    }

    merged.sort_by_key(|c| c.id);
    if dropped > 0 {
        debug!(rank, dropped, "dropped fragments of discarded curves");
    }
    info!(rank, curves = merged.len(), "reassembly finished");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Step;
    use crate::domain::{DomainId, DomainSpace};
    use crate::local_fabric::local_cluster;
    use std::thread;

    const SPACE: DomainSpace = DomainSpace::new(2, 1);

    fn piece(id: CurveId, seq: u32, xs: &[f64]) -> Curve {
        let mut c = Curve::new(id, DomainId::new(0, 0), [0.0; 3], 0.1, 100);
        c.sequence_cnt = seq;
        c.path = xs
            .iter()
            .map(|&x| Step {
                position: [x, 0.0, 0.0],
                time: x,
            })
            .collect();
        c
    }

    /// Runs one reassembly per rank; `inputs[r]` is `(owned, fragments)` for rank `r`.
    fn run(inputs: Vec<(Vec<Curve>, Vec<Curve>)>, total: u64, window: usize) -> Vec<Vec<Curve>> {
        let fabrics = local_cluster(inputs.len(), 8);
        let handles: Vec<_> = fabrics
            .into_iter()
            .zip(inputs)
            .map(|(f, (owned, frags))| {
                thread::spawn(move || {
                    let mut t = Transport::new(f, SPACE, 2, 1 << 16).unwrap();
                    reassemble(&mut t, owned, frags, total, window).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn fragments_from_three_ranks_merge_in_order() {
        let out = run(
            vec![
                (vec![piece(1, 2, &[5.0, 6.0])], vec![piece(0, 0, &[0.0])]),
                (vec![piece(0, 2, &[2.0])], vec![piece(1, 0, &[1.0, 2.0])]),
                (vec![], vec![piece(1, 1, &[3.0, 4.0]), piece(0, 1, &[1.0])]),
            ],
            2,
            1,
        );
        let xs = |c: &Curve| c.path.iter().map(|s| s.position[0]).collect::<Vec<_>>();
        assert_eq!(out[0].len(), 1);
        assert_eq!(xs(&out[0][0]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(out[1].len(), 1);
        assert_eq!(xs(&out[1][0]), vec![0.0, 1.0, 2.0]);
        assert!(out[2].is_empty());
    }

    #[test]
    fn ownerless_fragments_are_dropped() {
        let out = run(
            vec![
                (vec![piece(3, 1, &[2.0])], vec![piece(4, 0, &[9.0])]),
                (vec![], vec![piece(3, 0, &[1.0])]),
            ],
            5,
            2,
        );
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[0][0].path.len(), 2);
        assert!(out[1].is_empty());
    }

    #[test]
    fn curves_without_fragments_pass_through() {
        let out = run(
            vec![
                (vec![piece(0, 0, &[1.0]), piece(7, 0, &[2.0])], vec![]),
                (vec![piece(3, 0, &[3.0])], vec![]),
            ],
            8,
            3,
        );
        assert_eq!(out[0].iter().map(|c| c.id).collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(out[1].iter().map(|c| c.id).collect::<Vec<_>>(), vec![3]);
    }
}
