use crate::config::ConfigError;
use crate::curve::CurveId;
use crate::domain::DomainId;
use crate::fabric::{Channel, Rank};
use crate::host::HostError;
use crate::protocol::DecodeError;

/// Top-level error for scheduler runs.
///
/// Only misuse (bad configuration, oversized payloads, broken algorithm invariants) and
/// collaborator failures surface here. Data inconsistencies such as a curve delivered to the
/// wrong domain are counted as early terminations and never become errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{len}-byte payload exceeds the {max}-byte limit of the {channel} channel")]
    PayloadTooLarge {
        channel: Channel,
        len: usize,
        max: usize,
    },

    #[error("malformed frame from rank {source_rank}: {error}")]
    Decode {
        source_rank: Rank,
        #[source]
        error: DecodeError,
    },

    #[error("curve {id} assigned to domain {domain} terminated early on the assignment path")]
    UnexpectedEarlyTermination { id: CurveId, domain: DomainId },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("curve {id}: expected {expected} fragments at rank {rank}, found {found}")]
    FragmentMismatch {
        id: CurveId,
        rank: Rank,
        expected: usize,
        found: usize,
    },

    #[error("fragment of curve {id} delivered to rank {rank}, which does not own it")]
    MisroutedFragment { id: CurveId, rank: Rank },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker thread for rank {rank} panicked")]
    WorkerPanicked { rank: Rank },
}
