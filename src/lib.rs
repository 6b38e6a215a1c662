//! Embodiment attribute engine
//!
//! Keeps the attribute vocabulary used to describe a person's physical
//! embodiment, separates it from everything else a producer emits, evolves
//! the vocabulary under governance, and measures how a generated artifact
//! diverges from the description it was generated from. Secondary bias
//! analyses run as deferred jobs against stored attribute sets.

pub mod analysis;
pub mod boundary;
pub mod cli;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod evolution;
pub mod logging;
pub mod queue;
pub mod schema;
pub mod store;
pub mod types;
pub mod version;

pub use config::EngineConfig;
pub use engine::{ComparisonReport, EmbodimentEngine, EngineBuilder, IngestReport};
pub use error::{Error, ErrorCode, Result};
pub use store::Pseudonym;
pub use types::{AnalysisType, DiffId, JobId, ResultId, SetId, SourceTag};
