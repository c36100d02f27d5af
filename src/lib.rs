//! Library crate for curveflow: a master/slave dynamic load-balancing scheduler for
//! distributed integral-curve computation.
//!
//! Each rank runs one `WorkerRole`. Slaves integrate curves through resident domains;
//! masters hold unassigned curves and steer their slaves with rebalancing heuristics; the
//! root master also balances between groups and decides completion. Once everything has
//! terminated, all ranks reassemble each curve from its migration fragments.
//!
//! Ranks talk through a `Fabric`. `LocalFabric` runs a whole cluster in one process on
//! disruptor rings, which is what the binary, the tests and the benches use.

pub mod arena;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod curve;
pub mod domain;
pub mod error;
pub mod fabric;
pub mod host;
pub mod local_fabric;
pub mod master;
pub mod metrics;
pub mod partition;
pub mod protocol;
pub mod reassembly;
pub mod rebalance;
pub mod slave;
pub mod stats;
pub mod status;
pub mod synthetic;
pub mod transport;
pub mod worker;

pub use config::SchedulerConfig;
pub use curve::Curve;
pub use domain::{DomainId, DomainSpace};
pub use error::SchedError;
pub use worker::{RunReport, WorkerRole};
