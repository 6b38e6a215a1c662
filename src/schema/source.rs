//! Schema sources and document loading
//!
//! A source hands back raw document text; `load_schema` turns it into a
//! validated schema or a structured failure without ever erroring into the
//! caller's control flow.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::types::{
    content_checksum, AttributeSchema, AttributeType, FieldSpec, SchemaDocument, SchemaVersion,
};
use crate::error::{Error, Result};

/// Schema document compiled into the binary; also the fallback schema
pub const EMBEDDED_SCHEMA: &str = include_str!("../../config/schema/default.toml");

// ─────────────────────────────────────────────────────────────────
// Source Trait
// ─────────────────────────────────────────────────────────────────

/// An external, versioned schema document
pub trait SchemaSource: Send + Sync {
    /// Human-readable source name for logs
    fn name(&self) -> String;

    /// Read the current document content
    fn read(&self) -> Result<String>;
}

/// Schema document on disk
#[derive(Debug, Clone)]
pub struct FileSchemaSource {
    path: PathBuf,
}

impl FileSchemaSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SchemaSource for FileSchemaSource {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.path).map_err(|e| Error::IoRead {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// The document compiled into the binary
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedSchemaSource;

impl SchemaSource for EmbeddedSchemaSource {
    fn name(&self) -> String {
        "embedded".to_string()
    }

    fn read(&self) -> Result<String> {
        Ok(EMBEDDED_SCHEMA.to_string())
    }
}

/// Replaceable in-memory document; `None` simulates an unreadable source
#[derive(Debug, Default)]
pub struct InMemorySchemaSource {
    content: RwLock<Option<String>>,
}

impl InMemorySchemaSource {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: RwLock::new(Some(content.into())),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Swap the document content
    pub fn set(&self, content: Option<String>) {
        *self.content.write() = content;
    }
}

impl SchemaSource for InMemorySchemaSource {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn read(&self) -> Result<String> {
        self.content
            .read()
            .clone()
            .ok_or_else(|| Error::schema_load("memory", "source unavailable"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────

/// Outcome of loading a schema document
#[derive(Debug, Clone)]
pub enum SchemaLoad {
    Valid {
        schema: AttributeSchema,
        source_checksum: String,
    },
    Invalid {
        source_checksum: String,
        problems: Vec<String>,
    },
}

impl SchemaLoad {
    pub fn source_checksum(&self) -> &str {
        match self {
            SchemaLoad::Valid {
                source_checksum, ..
            }
            | SchemaLoad::Invalid {
                source_checksum, ..
            } => source_checksum,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, SchemaLoad::Valid { .. })
    }
}

/// Parse and validate document text
pub fn load_schema(content: &str) -> SchemaLoad {
    let source_checksum = content_checksum(content.as_bytes());
    let parsed = SchemaDocument::parse(content).map_err(|e| vec![e]);
    match parsed.and_then(|doc| {
        doc.into_schema().map_err(|e| match e {
            Error::SchemaValidation { problems } => problems,
            other => vec![other.to_string()],
        })
    }) {
        Ok(schema) => SchemaLoad::Valid {
            schema,
            source_checksum,
        },
        Err(problems) => SchemaLoad::Invalid {
            source_checksum,
            problems,
        },
    }
}

/// Read a source and validate what it returns
pub fn load_from_source(source: &dyn SchemaSource) -> Result<SchemaLoad> {
    let content = source.read()?;
    Ok(load_schema(&content))
}

/// Embedded schema used when no valid source schema exists
pub fn fallback_schema() -> AttributeSchema {
    match load_schema(EMBEDDED_SCHEMA) {
        SchemaLoad::Valid { schema, .. } => schema,
        SchemaLoad::Invalid { problems, .. } => {
            tracing::error!(
                problems = ?problems,
                "Embedded schema is invalid, using minimal schema"
            );
            minimal_schema()
        }
    }
}

fn minimal_schema() -> AttributeSchema {
    AttributeSchema::from_fields(
        SchemaVersion::new(1, 0),
        vec![
            FieldSpec::new("age", AttributeType::Text),
            FieldSpec::new("gender", AttributeType::Text),
        ],
    )
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_schema_is_valid() {
        let load = load_schema(EMBEDDED_SCHEMA);
        assert!(load.is_valid());
        let schema = fallback_schema();
        assert_eq!(schema.version(), SchemaVersion::new(1, 0));
        assert!(schema.contains("age"));
        assert!(schema.contains("clothing.items"));
    }

    #[test]
    fn test_invalid_toml_is_reported_not_raised() {
        let load = load_schema("version = [broken");
        match load {
            SchemaLoad::Invalid { problems, .. } => {
                assert!(problems[0].contains("invalid TOML"));
            }
            SchemaLoad::Valid { .. } => panic!("broken document validated"),
        }
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = load_schema(EMBEDDED_SCHEMA);
        let b = load_schema(&format!("{}\n# trailing comment\n", EMBEDDED_SCHEMA));
        assert_ne!(a.source_checksum(), b.source_checksum());
    }

    #[test]
    fn test_in_memory_source() {
        let source = InMemorySchemaSource::new("version = \"1.0\"");
        assert!(source.read().is_ok());
        source.set(None);
        assert!(source.read().is_err());
    }

    #[test]
    fn test_file_source_missing() {
        let source = FileSchemaSource::new("/nonexistent/schema.toml");
        let err = source.read().unwrap_err();
        assert!(matches!(err, Error::IoRead { .. }));
    }

    #[test]
    fn test_minimal_schema() {
        let schema = minimal_schema();
        assert_eq!(schema.fields().len(), 2);
    }
}
