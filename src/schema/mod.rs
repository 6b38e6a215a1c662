//! Attribute schema
//!
//! Versioned schema documents, typed attribute values, and the registry
//! every other component reads the active schema through.

pub mod registry;
pub mod source;
pub mod types;

pub use registry::{
    RefreshOutcome, RegistryWarning, SchemaRegistry, VersionInfo, VersionOrigin, WarningKind,
};
pub use source::{
    fallback_schema, load_schema, EmbeddedSchemaSource, FileSchemaSource, InMemorySchemaSource,
    SchemaLoad, SchemaSource, EMBEDDED_SCHEMA,
};
pub use types::{
    AttributeSchema, AttributeType, AttributeValue, FieldSpec, SchemaDocument, SchemaRecord,
    SchemaVersion, TypedAttributeMap,
};
