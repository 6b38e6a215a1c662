//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use embodiment_engine::analysis::AnalyzerRegistry;
use embodiment_engine::schema::{load_schema, AttributeSchema, SchemaLoad, SchemaRegistry};
use embodiment_engine::{EmbodimentEngine, EngineConfig, Pseudonym};

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Defaults with the journal off so nothing touches the home directory
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.journal = false;
    config
}

/// Parse a schema document that is expected to be valid
pub fn schema_from_toml(content: &str) -> AttributeSchema {
    match load_schema(content) {
        SchemaLoad::Valid { schema, .. } => schema,
        SchemaLoad::Invalid { problems, .. } => panic!("fixture schema invalid: {:?}", problems),
    }
}

/// Two-field schema: `age` and `gender`, both text
pub fn age_gender_schema() -> AttributeSchema {
    schema_from_toml(
        r#"
version = "1.0"
namespace_roots = ["age", "gender", "hair"]

[[fields]]
path = "age"
type = "text"

[[fields]]
path = "gender"
type = "text"
"#,
    )
}

pub fn engine_with(config: EngineConfig, schema: AttributeSchema) -> EmbodimentEngine {
    EmbodimentEngine::builder()
        .config(config)
        .registry(Arc::new(SchemaRegistry::with_schema(schema)))
        .build()
        .unwrap()
}

pub fn engine_with_analyzers(
    config: EngineConfig,
    schema: AttributeSchema,
    analyzers: Arc<AnalyzerRegistry>,
) -> EmbodimentEngine {
    EmbodimentEngine::builder()
        .config(config)
        .registry(Arc::new(SchemaRegistry::with_schema(schema)))
        .analyzers(analyzers)
        .build()
        .unwrap()
}

pub fn pseudonym(name: &str) -> Pseudonym {
    Pseudonym::new(name).unwrap()
}
