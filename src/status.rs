//! Compact per-domain status vectors and the coordinator-side view built from them.
//!
//! Sign convention per domain word: `count + 1` when the domain is resident,
//! `-count` when it is not. A non-resident domain with no curves encodes as 0.

pub fn encode_status(counts: &[u32], resident: &[bool]) -> Vec<i32> {
    debug_assert_eq!(counts.len(), resident.len());
    counts
        .iter()
        .zip(resident)
        .map(|(&n, &loaded)| if loaded { n as i32 + 1 } else { -(n as i32) })
        .collect()
}

pub fn decode_status(words: &[i32]) -> (Vec<u32>, Vec<bool>) {
    words
        .iter()
        .map(|&w| {
            if w > 0 {
                ((w - 1) as u32, true)
            } else {
                (w.unsigned_abs(), false)
            }
        })
        .unzip()
}

/// Suppresses reports that would repeat the last one sent.
#[derive(Debug, Default)]
pub struct StatusReporter {
    last: Option<Vec<i32>>,
    unreported_terminated: i32,
    force_next: bool,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_terminated(&mut self, n: i32) {
        self.unreported_terminated += n;
    }

    pub fn force_next(&mut self) {
        self.force_next = true;
    }

    /// Returns `(counts, terminated_delta)` if a report is due.
    pub fn prepare(&mut self, current: Vec<i32>, force: bool) -> Option<(Vec<i32>, i32)> {
        let changed = self.last.as_deref() != Some(current.as_slice());
        if !(force || self.force_next || changed || self.unreported_terminated != 0) {
            return None;
        }
        self.force_next = false;
        self.last = Some(current.clone());
        let terminated = std::mem::take(&mut self.unreported_terminated);
        Some((current, terminated))
    }
}

/// What a coordinator knows about one managed worker (a slave, or a peer master).
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveInfo {
    pub rank: usize,
    pub domain_cnt: Vec<u32>,
    pub domain_loaded: Vec<bool>,
    /// All curves held.
    pub sl_count: u32,
    /// Curves in resident domains.
    pub sl_loaded_count: u32,
    /// Curves waiting for non-resident domains.
    pub sl_oob_count: u32,
    pub dom_loaded_count: u32,
    /// A fresh report arrived this cycle.
    pub just_updated: bool,
    /// At least one report has arrived.
    pub initialized: bool,
}

/// Peer masters are tracked with the same record.
pub type MasterInfo = SlaveInfo;

impl SlaveInfo {
    pub fn new(rank: usize, num_domains: usize) -> Self {
        Self {
            rank,
            domain_cnt: vec![0; num_domains],
            domain_loaded: vec![false; num_domains],
            sl_count: 0,
            sl_loaded_count: 0,
            sl_oob_count: 0,
            dom_loaded_count: 0,
            just_updated: false,
            initialized: false,
        }
    }

    /// Replace the whole record with a fresh report.
    pub fn update(&mut self, words: &[i32]) {
        let (counts, loaded) = decode_status(words);
        self.domain_cnt = counts;
        self.domain_loaded = loaded;
        self.recompute();
        self.just_updated = true;
        self.initialized = true;
    }

    fn recompute(&mut self) {
        self.sl_count = 0;
        self.sl_loaded_count = 0;
        self.sl_oob_count = 0;
        self.dom_loaded_count = 0;
        for (&n, &loaded) in self.domain_cnt.iter().zip(&self.domain_loaded) {
            self.sl_count += n;
            if loaded {
                self.sl_loaded_count += n;
                self.dom_loaded_count += 1;
            } else {
                self.sl_oob_count += n;
            }
        }
    }

    /// Speculatively account for `n` curves pushed to this worker.
    pub fn add_sl(&mut self, dom: usize, n: u32) {
        self.domain_cnt[dom] += n;
        self.recompute();
    }

    /// Speculatively remove `n` curves this worker was told to send away.
    pub fn remove_sl(&mut self, dom: usize, n: u32) {
        self.domain_cnt[dom] = self.domain_cnt[dom].saturating_sub(n);
        self.recompute();
    }

    /// Speculatively mark a domain resident after ordering a load.
    pub fn load_dom(&mut self, dom: usize) {
        self.domain_loaded[dom] = true;
        self.recompute();
    }

    /// Slaves with nothing advanceable.
    pub fn is_slacker(&self) -> bool {
        self.initialized && self.sl_loaded_count == 0
    }

    pub fn resident_domains(&self) -> impl Iterator<Item = usize> + '_ {
        self.domain_loaded
            .iter()
            .enumerate()
            .filter(|(_, l)| **l)
            .map(|(i, _)| i)
    }

    /// Non-resident domain with the most waiting curves (lowest index on ties).
    pub fn most_waited_domain(&self) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (i, (&n, &loaded)) in self.domain_cnt.iter().zip(&self.domain_loaded).enumerate() {
            if loaded || n == 0 {
                continue;
            }
            if best.is_none_or(|(_, bn)| n > bn) {
                best = Some((i, n));
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn status_vector(&self) -> Vec<i32> {
        encode_status(&self.domain_cnt, &self.domain_loaded)
    }
}
