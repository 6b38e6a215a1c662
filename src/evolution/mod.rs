//! Schema evolution
//!
//! Unknown fields seen at the boundary become candidates; governance (or the
//! auto-threshold policy) approves them into new schema versions.

pub mod candidate;
pub mod manager;

pub use candidate::{CandidateEntry, CandidateId, CandidateRecord, FieldCandidate, ReviewStatus};
pub use manager::{EvolutionConfig, EvolutionManager, ObservationOutcome};
