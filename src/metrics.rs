//! Process-wide counters. Compiled to no-ops unless the `metrics` feature is enabled.

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Transport (cumulative)
    static STATUS_SENT: AtomicU64 = AtomicU64::new(0);
    static CURVES_SENT: AtomicU64 = AtomicU64::new(0);
    static RECEIVES: AtomicU64 = AtomicU64::new(0);
    static MAILBOX_FULL: AtomicU64 = AtomicU64::new(0);
    // Scheduling (cumulative)
    static REBALANCE_CYCLES: AtomicU64 = AtomicU64::new(0);
    static DOMAIN_LOADS: AtomicU64 = AtomicU64::new(0);
    static EARLY_TERMINATIONS: AtomicU64 = AtomicU64::new(0);
    static CURVES_TERMINATED: AtomicU64 = AtomicU64::new(0);
    static IDLE_SLEEPS: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static IN_FLIGHT_MAX: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy, Debug)]
    pub struct MetricsSnapshot {
        pub status_sent: u64,
        pub curves_sent: u64,
        pub receives: u64,
        pub mailbox_full: u64,
        pub rebalance_cycles: u64,
        pub domain_loads: u64,
        pub early_terminations: u64,
        pub curves_terminated: u64,
        pub idle_sleeps: u64,
        pub in_flight_max: usize,
    }

    pub fn inc_status_sent() {
        STATUS_SENT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_curves_sent(n: usize) {
        CURVES_SENT.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_receives(n: usize) {
        RECEIVES.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_mailbox_full() {
        MAILBOX_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rebalance_cycles() {
        REBALANCE_CYCLES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_domain_loads() {
        DOMAIN_LOADS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_early_terminations() {
        EARLY_TERMINATIONS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_curves_terminated() {
        CURVES_TERMINATED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idle_sleeps() {
        IDLE_SLEEPS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_in_flight(value: usize) {
        let mut prev = IN_FLIGHT_MAX.load(Ordering::Relaxed);
        while value > prev {
            match IN_FLIGHT_MAX.compare_exchange_weak(
                prev,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            status_sent: STATUS_SENT.load(Ordering::Relaxed),
            curves_sent: CURVES_SENT.load(Ordering::Relaxed),
            receives: RECEIVES.load(Ordering::Relaxed),
            mailbox_full: MAILBOX_FULL.load(Ordering::Relaxed),
            rebalance_cycles: REBALANCE_CYCLES.load(Ordering::Relaxed),
            domain_loads: DOMAIN_LOADS.load(Ordering::Relaxed),
            early_terminations: EARLY_TERMINATIONS.load(Ordering::Relaxed),
            curves_terminated: CURVES_TERMINATED.load(Ordering::Relaxed),
            idle_sleeps: IDLE_SLEEPS.load(Ordering::Relaxed),
            in_flight_max: IN_FLIGHT_MAX.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 5;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                tracing::info!(
                    interval_secs = INTERVAL_SECS,
                    status_sent = snap.status_sent.saturating_sub(last.status_sent),
                    curves_sent = snap.curves_sent.saturating_sub(last.curves_sent),
                    receives = snap.receives.saturating_sub(last.receives),
                    mailbox_full = snap.mailbox_full.saturating_sub(last.mailbox_full),
                    rebalance_cycles = snap.rebalance_cycles.saturating_sub(last.rebalance_cycles),
                    domain_loads = snap.domain_loads.saturating_sub(last.domain_loads),
                    terminated = snap.curves_terminated.saturating_sub(last.curves_terminated),
                    early_terminations = snap.early_terminations,
                    idle_sleeps = snap.idle_sleeps.saturating_sub(last.idle_sleeps),
                    in_flight_max = snap.in_flight_max,
                    "metrics delta"
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy, Debug)]
    pub struct MetricsSnapshot {
        pub status_sent: u64,
        pub curves_sent: u64,
        pub receives: u64,
        pub mailbox_full: u64,
        pub rebalance_cycles: u64,
        pub domain_loads: u64,
        pub early_terminations: u64,
        pub curves_terminated: u64,
        pub idle_sleeps: u64,
        pub in_flight_max: usize,
    }

    pub fn inc_status_sent() {}
    pub fn add_curves_sent(_: usize) {}
    pub fn add_receives(_: usize) {}
    pub fn inc_mailbox_full() {}
    pub fn inc_rebalance_cycles() {}
    pub fn inc_domain_loads() {}
    pub fn inc_early_terminations() {}
    pub fn inc_curves_terminated() {}
    pub fn inc_idle_sleeps() {}
    pub fn update_in_flight(_: usize) {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            status_sent: 0,
            curves_sent: 0,
            receives: 0,
            mailbox_full: 0,
            rebalance_cycles: 0,
            domain_loads: 0,
            early_terminations: 0,
            curves_terminated: 0,
            idle_sleeps: 0,
            in_flight_max: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
