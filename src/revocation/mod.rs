//! Revocation evidence: OCSP responses and CRLs for certificate chains.
//!
//! [`RevocationCollector`] gathers evidence for a chain in parallel and
//! records a gap for each certificate it cannot cover. Good answers land in
//! a process-wide [`RevocationCache`] shared by every signing run.

mod cache;
mod collector;
pub mod crl;
pub mod ocsp;

pub use cache::{EvidenceItem, EvidenceKind, RevocationCache};
pub use collector::{EvidenceEntry, EvidenceGap, RevocationCollector, RevocationEvidence};
