//! Error types for the embodiment engine
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Transient/permanent classification used by the job queue
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoNotFound = 203,
    Serialization = 204,

    // Schema errors (3xx)
    SchemaLoad = 300,
    SchemaValidation = 301,
    SchemaVersionConflict = 302,

    // Boundary / evolution errors (4xx)
    BoundaryViolation = 400,
    EvolutionFailed = 410,
    CandidateNotFound = 411,
    CandidateNotPending = 412,

    // Diff / store errors (5xx)
    DiffComputation = 500,
    StoreOrdering = 510,
    RecordNotFound = 511,
    ConsentWithdrawn = 520,
    InvalidPseudonym = 521,

    // Job / analysis errors (6xx)
    JobExecution = 600,
    AnalysisTimeout = 601,
    CircuitOpen = 602,
    LeaseLost = 603,
    AnalyzerMissing = 604,

    // Internal errors (9xx)
    InternalError = 900,
    NotSupported = 902,
}

impl ErrorCode {
    /// Get the string code (e.g., "E300")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Schema errors
            400..=499 => 40, // Boundary / evolution errors
            500..=599 => 50, // Diff / store errors
            600..=699 => 60, // Job / analysis errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Schema Errors
    // ─────────────────────────────────────────────────────────────

    /// Schema source could not be read or parsed
    #[error("Failed to load schema from {source_name}: {message}")]
    SchemaLoad { source_name: String, message: String },

    /// Schema document is structurally invalid
    #[error("Schema validation failed: {}", .problems.join("; "))]
    SchemaValidation { problems: Vec<String> },

    /// Proposed version does not follow the active version
    #[error("Schema version conflict: {message}")]
    SchemaVersionConflict { message: String },

    // ─────────────────────────────────────────────────────────────
    // Boundary / Evolution Errors
    // ─────────────────────────────────────────────────────────────

    /// An attribute key was refused at the boundary
    #[error("Boundary violation on '{key}': {reason}")]
    BoundaryViolation { key: String, reason: String },

    /// Candidate mutation failed
    #[error("Schema evolution failed for '{path}': {message}")]
    Evolution { path: String, message: String },

    /// Candidate does not exist
    #[error("Field candidate not found: {0}")]
    CandidateNotFound(String),

    /// Candidate already reached a terminal review status
    #[error("Field candidate '{path}' is already {status}")]
    CandidateNotPending { path: String, status: String },

    // ─────────────────────────────────────────────────────────────
    // Diff / Store Errors
    // ─────────────────────────────────────────────────────────────

    /// Diff inputs could not be compared
    #[error("Diff computation failed: {0}")]
    DiffComputation(String),

    /// Append would break the store's ordering guarantee
    #[error("Store ordering violation: {0}")]
    StoreOrdering(String),

    /// Record does not exist in the store
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Consent for the pseudonym was withdrawn
    #[error("Consent withdrawn for session {0}")]
    ConsentWithdrawn(String),

    /// Malformed session pseudonym
    #[error("Invalid pseudonym: {0}")]
    InvalidPseudonym(String),

    // ─────────────────────────────────────────────────────────────
    // Job / Analysis Errors
    // ─────────────────────────────────────────────────────────────

    /// Analysis call failed
    #[error("Analysis '{analysis}' failed: {message}")]
    JobExecution {
        analysis: String,
        message: String,
        transient: bool,
    },

    /// Analysis call exceeded its time budget
    #[error("Analysis '{analysis}' timed out after {timeout_ms}ms")]
    AnalysisTimeout { analysis: String, timeout_ms: u64 },

    /// Circuit breaker is open for the dependency
    #[error("Circuit open for '{analysis}', retry after {retry_after_ms}ms")]
    CircuitOpen { analysis: String, retry_after_ms: u64 },

    /// Worker no longer holds the lease on a job
    #[error("Lease lost on job {0}")]
    LeaseLost(String),

    /// No analyzer registered for the analysis type
    #[error("No analyzer registered for '{0}'")]
    AnalyzerMissing(String),

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::Serialization,

            Error::SchemaLoad { .. } => ErrorCode::SchemaLoad,
            Error::SchemaValidation { .. } => ErrorCode::SchemaValidation,
            Error::SchemaVersionConflict { .. } => ErrorCode::SchemaVersionConflict,

            Error::BoundaryViolation { .. } => ErrorCode::BoundaryViolation,
            Error::Evolution { .. } => ErrorCode::EvolutionFailed,
            Error::CandidateNotFound(_) => ErrorCode::CandidateNotFound,
            Error::CandidateNotPending { .. } => ErrorCode::CandidateNotPending,

            Error::DiffComputation(_) => ErrorCode::DiffComputation,
            Error::StoreOrdering(_) => ErrorCode::StoreOrdering,
            Error::NotFound(_) => ErrorCode::RecordNotFound,
            Error::ConsentWithdrawn(_) => ErrorCode::ConsentWithdrawn,
            Error::InvalidPseudonym(_) => ErrorCode::InvalidPseudonym,

            Error::JobExecution { .. } => ErrorCode::JobExecution,
            Error::AnalysisTimeout { .. } => ErrorCode::AnalysisTimeout,
            Error::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Error::LeaseLost(_) => ErrorCode::LeaseLost,
            Error::AnalyzerMissing(_) => ErrorCode::AnalyzerMissing,

            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is transient (worth retrying)
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::JobExecution { transient, .. } => *transient,
            Error::AnalysisTimeout { .. }
            | Error::CircuitOpen { .. }
            | Error::SchemaVersionConflict { .. }
            | Error::Io(_)
            | Error::IoRead { .. }
            | Error::IoWrite { .. } => true,
            _ => false,
        }
    }

    /// Check if the error is fatal (engine should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'embodiment-engine config init' to create a default configuration file."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values. Run 'embodiment-engine config validate' to see details."
            ),
            Error::SchemaLoad { .. } => Some(
                "Check that the schema source path exists and is valid TOML. The embedded fallback schema stays in use meanwhile."
            ),
            Error::SchemaValidation { .. } => Some(
                "Every [[fields]] entry needs a unique 'path' and a declared 'type'. Run 'embodiment-engine schema validate <path>'."
            ),
            Error::SchemaVersionConflict { .. } => Some(
                "Another writer registered a schema version first. Re-read the active schema and rebase the change."
            ),
            Error::StoreOrdering(_) => Some(
                "Store both attribute sets before appending a diff that references them."
            ),
            Error::ConsentWithdrawn(_) => Some(
                "Consent was withdrawn for this session; no further research data may be recorded."
            ),
            Error::CircuitOpen { .. } => Some(
                "The analysis service is failing repeatedly. Jobs will be rescheduled once the cooldown ends."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a schema load error
    pub fn schema_load(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SchemaLoad {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a transient analysis failure
    pub fn transient(analysis: impl Into<String>, message: impl Into<String>) -> Self {
        Error::JobExecution {
            analysis: analysis.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent analysis failure
    pub fn permanent(analysis: impl Into<String>, message: impl Into<String>) -> Self {
        Error::JobExecution {
            analysis: analysis.into(),
            message: message.into(),
            transient: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::SchemaLoad.as_str(), "E300");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::SchemaValidation.exit_code(), 30);
        assert_eq!(ErrorCode::BoundaryViolation.exit_code(), 40);
        assert_eq!(ErrorCode::StoreOrdering.exit_code(), 50);
        assert_eq!(ErrorCode::CircuitOpen.exit_code(), 60);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_schema_validation_display_joins_problems() {
        let err = Error::SchemaValidation {
            problems: vec!["duplicate path 'age'".into(), "field 'x' has no type".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("duplicate path 'age'"));
        assert!(msg.contains("; field 'x' has no type"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("gender_stereotype", "503").is_retryable());
        assert!(!Error::permanent("gender_stereotype", "bad input").is_retryable());
        assert!(Error::AnalysisTimeout {
            analysis: "age_stereotype".into(),
            timeout_ms: 10,
        }
        .is_retryable());
        assert!(Error::CircuitOpen {
            analysis: "age_stereotype".into(),
            retry_after_ms: 10,
        }
        .is_retryable());
        assert!(!Error::AnalyzerMissing("x".into()).is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::config_not_found("/test").is_fatal());
        assert!(!Error::schema_load("file", "missing").is_fatal());
        assert!(!Error::StoreOrdering("x".into()).is_fatal());
    }

    #[test]
    fn test_error_suggestions() {
        let err = Error::config_not_found("/test");
        assert!(err.suggestion().unwrap().contains("config init"));

        let err = Error::StoreOrdering("diff before sets".into());
        assert!(err.suggestion().unwrap().contains("attribute sets"));
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::BoundaryViolation {
            key: "user.email".into(),
            reason: "deny-listed".into(),
        };
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E400]"));
        assert!(formatted.contains("user.email"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        assert_eq!(err.code(), ErrorCode::IoNotFound);
        assert!(err.is_retryable());
    }
}
