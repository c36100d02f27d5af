use std::time::Duration;

use tracing::info;

use crate::fabric::Rank;

/// Timing and counters for one worker, independent of its role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub total: Duration,
    pub comm: Duration,
    pub integration: Duration,
    pub idle: Duration,
    pub integrate_calls: u64,
    pub curves_terminated: u64,
    pub early_terminations: u64,
    pub curves_sent: u64,
    pub curves_received: u64,
    pub status_sent: u64,
    pub status_received: u64,
    pub rebalance_cycles: u64,
    pub stop_broadcasts: u32,
    /// Loads per flat domain index.
    pub domain_loads: Vec<u32>,
}

impl WorkerStats {
    pub fn new(num_domains: usize) -> Self {
        Self {
            domain_loads: vec![0; num_domains],
            ..Self::default()
        }
    }

    pub fn total_domain_loads(&self) -> u64 {
        self.domain_loads.iter().map(|&n| n as u64).sum()
    }

    /// Share of wall time spent integrating.
    pub fn integration_fraction(&self) -> f64 {
        if self.total.is_zero() {
            return 0.0;
        }
        self.integration.as_secs_f64() / self.total.as_secs_f64()
    }

    pub fn log_summary(&self, rank: Rank, role: &'static str) {
        info!(
            rank,
            role,
            total_ms = self.total.as_millis() as u64,
            comm_ms = self.comm.as_millis() as u64,
            integration_ms = self.integration.as_millis() as u64,
            idle_ms = self.idle.as_millis() as u64,
            integrate_calls = self.integrate_calls,
            terminated = self.curves_terminated,
            early_terminations = self.early_terminations,
            sent = self.curves_sent,
            received = self.curves_received,
            domain_loads = self.total_domain_loads(),
            rebalance_cycles = self.rebalance_cycles,
            "worker finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_of_zero_total_is_zero() {
        assert_eq!(WorkerStats::new(2).integration_fraction(), 0.0);
    }

    #[test]
    fn domain_loads_sum() {
        let mut s = WorkerStats::new(3);
        s.domain_loads[0] = 2;
        s.domain_loads[2] = 5;
        assert_eq!(s.total_domain_loads(), 7);
        s.total = Duration::from_secs(4);
        s.integration = Duration::from_secs(1);
        assert!((s.integration_fraction() - 0.25).abs() < 1e-12);
    }
}
