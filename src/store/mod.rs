//! Audit and persistence
//!
//! Append-only research records keyed solely by session pseudonym.

pub mod audit;
pub mod journal;
pub mod pseudonym;
pub mod records;

pub use audit::{AuditStore, JobStats, Settlement};
pub use journal::{Journal, JournalEntry, JOURNAL_FILE};
pub use pseudonym::Pseudonym;
pub use records::{AttributeSet, BiasResult, ErasureReport, RecordCounts};
