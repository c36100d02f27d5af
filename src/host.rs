//! Interfaces the host application provides: domain storage and integration.

use crate::curve::Curve;
use crate::domain::DomainId;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("domain {domain} could not be loaded: {reason}")]
    DomainLoad { domain: DomainId, reason: String },
}

/// Finite cache of resident domains.
pub trait DomainStore {
    /// Make `domain` resident, evicting others if the cache is full.
    fn get_domain(&mut self, domain: DomainId) -> Result<(), HostError>;

    fn domain_loaded(&self, domain: DomainId) -> bool;

    fn point_in_domain(&self, point: &[f64; 3], domain: DomainId) -> bool;
}

/// Advances a curve through one domain traversal.
///
/// On return `curve.status` is `Terminated` (criteria met or the curve left the dataset),
/// `OutOfBounds` with `curve.domain` set to the next domain, or `Active` if the traversal
/// was cut short and the curve is still inside its domain.
pub trait Integrator {
    fn integrate(&mut self, curve: &mut Curve);
}

/// The collaborators a slave needs. Masters never integrate and drop this.
pub struct Collaborators {
    pub domains: Box<dyn DomainStore + Send>,
    pub integrator: Box<dyn Integrator + Send>,
}
