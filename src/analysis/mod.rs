//! Secondary bias analyses
//!
//! The interface the job queue calls out to, plus the built-in heuristic,
//! HTTP and mock implementations.

mod heuristic;
mod mock;
mod registry;
mod remote;
mod traits;

pub use heuristic::{default_rules, AttributeMatch, HeuristicAnalyzer, IndicatorRule};
pub use mock::{MockAnalyzer, MockBehavior, MockConfig};
pub use registry::{AnalysisConfig, AnalyzerKind, AnalyzerRegistry};
pub use remote::{RemoteAnalyzer, RemoteConfig};
pub use traits::{AnalysisFinding, AnalysisRequest, AnalyzerHealth, BiasAnalyzer};
