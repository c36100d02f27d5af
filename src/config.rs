//! Scheduler sizing and policy configuration.
//!
//! Wire-format constants live in `constants`. The factors below scale `max_batch` into the
//! thresholds and caps the rebalancing heuristics use.

use std::time::Duration;

use crate::constants::{
    CURVE_BATCH_HEADER_BYTES, CURVE_FIXED_BYTES, CURVE_LEN_PREFIX_BYTES,
    DEFAULT_MAX_CURVE_MESSAGE_BYTES, FRAME_HEADER_BYTES,
};
use crate::domain::DomainSpace;

/// Case 4 first pass: a slacker needs this many `max_batch`es of backlog to force a load.
pub const CASE4_THRESHOLD_FACTOR: usize = 3;

/// Case 3 / Case 5: a destination holding this many `max_batch`es is full.
pub const OVERLOAD_CAP_FACTOR: usize = 10;

/// Case 3 / Case 5: most curves moved by one instruction, in `max_batch`es.
pub const TRANSFER_LIMIT_FACTOR: usize = 5;

/// Most waiting curves a slave moves for one `Offload`, in `max_batch`es.
pub const OFFLOAD_CAP_FACTOR: usize = 5;

/// Receive slots kept posted per channel.
pub const DEFAULT_RECV_SLOTS: usize = 64;

/// Curve ids handled per reassembly round.
pub const DEFAULT_REASSEMBLY_WINDOW: usize = 500;

pub const DEFAULT_MAX_BATCH: usize = 10;

pub const DEFAULT_WORK_GROUP_SIZE: usize = 8;

/// Sleep when a loop finds no work.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(200);

/// Root cycles with an all-zero view but missing terminations before asking for re-reports.
pub const STALL_CYCLES_BEFORE_FORCE: u32 = 5000;

/// Per-(rank, channel) mailbox ring size for the in-process fabric.
pub const MAILBOX_CAPACITY: usize = 4096;

/// Smallest ring a multi-producer disruptor accepts.
pub const MIN_MAILBOX_CAPACITY: usize = 64;

const _: () = assert!(MAILBOX_CAPACITY.is_power_of_two(), "disruptor rings need 2^n slots");
const _: () = assert!(MIN_MAILBOX_CAPACITY.is_power_of_two(), "disruptor rings need 2^n slots");
const _: () = assert!(MAILBOX_CAPACITY >= MIN_MAILBOX_CAPACITY);
const _: () = assert!(
    CASE4_THRESHOLD_FACTOR < OVERLOAD_CAP_FACTOR,
    "case 4 threshold must stay below the overload cap"
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max batch size must be positive")]
    ZeroBatch,
    #[error("at least one receive slot per channel is required")]
    ZeroReceiveSlots,
    #[error("curve message limit of {0} bytes cannot hold a single curve")]
    CurveMessageTooSmall(usize),
    #[error("reassembly window must be positive")]
    ZeroWindow,
    #[error("work group size {0} leaves no room for a slave")]
    WorkGroupTooSmall(usize),
    #[error("{0} process(es) cannot form a master/slave group")]
    TooFewProcesses(usize),
    #[error("domain space is empty")]
    EmptyDomainSpace,
    #[error("rank {rank} outside a {n_procs}-process run")]
    RankOutOfRange { rank: usize, n_procs: usize },
}

/// Which rebalancing heuristics a master runs each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeuristicSet {
    pub case1: bool,
    pub case2: bool,
    pub case3: bool,
    pub case4: bool,
    /// Overloaded-to-idle redistribution. Off by default.
    pub case5: bool,
    pub manage_masters: bool,
}

impl Default for HeuristicSet {
    fn default() -> Self {
        Self {
            case1: true,
            case2: true,
            case3: true,
            case4: true,
            case5: false,
            manage_masters: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_batch: usize,
    pub work_group_size: usize,
    pub recv_slots: usize,
    pub max_curve_message_bytes: usize,
    pub reassembly_window: usize,
    pub idle_sleep: Duration,
    /// Seeds the tie-breaking RNG; each rank mixes in its own rank.
    pub rng_seed: u64,
    pub heuristics: HeuristicSet,
    pub space: DomainSpace,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            work_group_size: DEFAULT_WORK_GROUP_SIZE,
            recv_slots: DEFAULT_RECV_SLOTS,
            max_curve_message_bytes: DEFAULT_MAX_CURVE_MESSAGE_BYTES,
            reassembly_window: DEFAULT_REASSEMBLY_WINDOW,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            rng_seed: 0,
            heuristics: HeuristicSet::default(),
            space: DomainSpace::new(1, 1),
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_batch: usize, work_group_size: usize, space: DomainSpace) -> Self {
        Self {
            max_batch,
            work_group_size,
            space,
            ..Self::default()
        }
    }

    /// Check every size and return the group size clamped to `n_procs`.
    pub fn validate(&self, n_procs: usize) -> Result<usize, ConfigError> {
        if self.max_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        if self.recv_slots == 0 {
            return Err(ConfigError::ZeroReceiveSlots);
        }
        let smallest = FRAME_HEADER_BYTES
            + CURVE_BATCH_HEADER_BYTES
            + CURVE_LEN_PREFIX_BYTES
            + CURVE_FIXED_BYTES;
        if self.max_curve_message_bytes < smallest {
            return Err(ConfigError::CurveMessageTooSmall(
                self.max_curve_message_bytes,
            ));
        }
        if self.reassembly_window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.space.is_empty() {
            return Err(ConfigError::EmptyDomainSpace);
        }
        if n_procs < 2 {
            return Err(ConfigError::TooFewProcesses(n_procs));
        }
        if self.work_group_size < 2 {
            return Err(ConfigError::WorkGroupTooSmall(self.work_group_size));
        }
        Ok(self.work_group_size.min(n_procs))
    }

    pub fn case4_threshold(&self) -> usize {
        CASE4_THRESHOLD_FACTOR * self.max_batch
    }

    pub fn overload_cap(&self) -> usize {
        OVERLOAD_CAP_FACTOR * self.max_batch
    }

    pub fn transfer_limit(&self) -> usize {
        TRANSFER_LIMIT_FACTOR * self.max_batch
    }

    pub fn offload_cap(&self) -> usize {
        OFFLOAD_CAP_FACTOR * self.max_batch
    }
}
