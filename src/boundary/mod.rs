//! Boundary enforcement
//!
//! Keeps embodiment attributes separate from unrelated application data.

pub mod enforcer;
pub mod flatten;

pub use enforcer::{
    BoundaryEnforcer, CandidateKey, Classification, DenyList, RejectedKey, RejectionKind,
    DEFAULT_DENY_LIST,
};
pub use flatten::{flatten, normalize_key, FlatEntry};
