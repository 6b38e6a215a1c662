//! Schema registry
//!
//! Owns every schema version and the single active one. Reads are served
//! from a TTL cache that is re-validated against the source checksum; the
//! only writer is `register_version`, serialized behind a gate. A broken or
//! unreachable source never fails a reader: the last-known-good version (or
//! the embedded fallback) stays in force and a warning is recorded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::source::{fallback_schema, load_schema, EmbeddedSchemaSource, SchemaLoad, SchemaSource};
use super::types::{AttributeSchema, SchemaVersion};
use crate::error::{Error, Result};

/// Warnings kept for inspection
const MAX_WARNINGS: usize = 64;

// ─────────────────────────────────────────────────────────────────
// Warnings
// ─────────────────────────────────────────────────────────────────

/// What went wrong while serving the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    SourceUnavailable,
    ValidationFailed,
    VersionRejected,
    FallbackInUse,
}

/// Structured, non-blocking registry warning
#[derive(Debug, Clone, Serialize)]
pub struct RegistryWarning {
    pub kind: WarningKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Where a registered version came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrigin {
    Source,
    Fallback,
    Governance,
    /// Replayed from the audit journal of an earlier run
    Restored,
}

/// Summary of one registered version
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: SchemaVersion,
    pub checksum: String,
    pub active: bool,
    pub origin: VersionOrigin,
    pub field_count: usize,
    pub registered_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Internal State
// ─────────────────────────────────────────────────────────────────

struct VersionEntry {
    schema: Arc<AttributeSchema>,
    active: bool,
    origin: VersionOrigin,
    registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    versions: Vec<VersionEntry>,
    /// Checksum of the last source document inspected
    last_source_checksum: Option<String>,
}

impl RegistryState {
    fn active(&self) -> Option<&VersionEntry> {
        self.versions.iter().find(|e| e.active)
    }

    fn install(&mut self, schema: Arc<AttributeSchema>, origin: VersionOrigin) {
        // A fallback entry carrying the same version number is superseded.
        let version = schema.version();
        self.versions
            .retain(|e| !(e.origin == VersionOrigin::Fallback && e.schema.version() == version));
        for entry in &mut self.versions {
            entry.active = false;
        }
        self.versions.push(VersionEntry {
            schema,
            active: true,
            origin,
            registered_at: Utc::now(),
        });
    }
}

struct SchemaCache {
    schema: Arc<AttributeSchema>,
    validated_at: Instant,
}

/// What a refresh did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Source unchanged (or no source configured)
    Unchanged,
    /// A new version was adopted
    Adopted(SchemaVersion),
    /// The source could not be used; the active version stays in force
    Kept(SchemaVersion),
}

// ─────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────

/// Versioned schema registry with cache and fallback
pub struct SchemaRegistry {
    source: Option<Arc<dyn SchemaSource>>,
    cache_ttl: Duration,
    state: RwLock<RegistryState>,
    cache: RwLock<Option<SchemaCache>>,
    write_gate: Mutex<()>,
    refresh_gate: Mutex<()>,
    warnings: Mutex<VecDeque<RegistryWarning>>,
}

impl SchemaRegistry {
    /// Registry backed by an external source
    pub fn new(source: Arc<dyn SchemaSource>, cache_ttl: Duration) -> Self {
        Self {
            source: Some(source),
            cache_ttl,
            state: RwLock::new(RegistryState::default()),
            cache: RwLock::new(None),
            write_gate: Mutex::new(()),
            refresh_gate: Mutex::new(()),
            warnings: Mutex::new(VecDeque::new()),
        }
    }

    /// Registry serving the schema compiled into the binary
    pub fn embedded(cache_ttl: Duration) -> Self {
        Self::new(Arc::new(EmbeddedSchemaSource), cache_ttl)
    }

    /// Registry pinned to a single initial schema, with no source to poll
    pub fn with_schema(schema: AttributeSchema) -> Self {
        let registry = Self {
            source: None,
            cache_ttl: Duration::MAX,
            state: RwLock::new(RegistryState::default()),
            cache: RwLock::new(None),
            write_gate: Mutex::new(()),
            refresh_gate: Mutex::new(()),
            warnings: Mutex::new(VecDeque::new()),
        };
        let schema = Arc::new(schema);
        registry.state.write().install(schema.clone(), VersionOrigin::Source);
        registry.store_cache(schema);
        registry
    }

    /// Load the initial version from the source
    pub fn init(&self) -> RefreshOutcome {
        self.invalidate();
        let outcome = self.refresh();
        let (version, _) = self.get_active_schema();
        info!(version = %version, fallback = self.is_fallback(), "Schema registry initialized");
        outcome
    }

    /// Drop the cache so the next read re-validates the source
    pub fn invalidate(&self) {
        *self.cache.write() = None;
        self.state.write().last_source_checksum = None;
    }

    /// Active schema version; never fails
    pub fn get_active_schema(&self) -> (SchemaVersion, Arc<AttributeSchema>) {
        if let Some(cache) = self.cache.read().as_ref() {
            if cache.validated_at.elapsed() < self.cache_ttl {
                return (cache.schema.version(), cache.schema.clone());
            }
        }

        self.refresh();
        self.current_or_fallback()
    }

    /// Re-read the source and adopt a newer valid version if there is one
    pub fn refresh(&self) -> RefreshOutcome {
        // Concurrent readers with an expired cache keep serving the active version.
        let _refreshing = match self.refresh_gate.try_lock() {
            Some(guard) => guard,
            None => return RefreshOutcome::Unchanged,
        };

        let Some(source) = self.source.clone() else {
            self.touch_cache();
            return RefreshOutcome::Unchanged;
        };

        let content = match source.read() {
            Ok(content) => content,
            Err(e) => {
                self.record_warning(
                    WarningKind::SourceUnavailable,
                    format!("schema source {} unreadable: {}", source.name(), e),
                );
                return self.keep_current();
            }
        };

        let load = load_schema(&content);
        {
            let state = self.state.read();
            if state.active().is_some()
                && state.last_source_checksum.as_deref() == Some(load.source_checksum())
            {
                drop(state);
                self.touch_cache();
                return RefreshOutcome::Unchanged;
            }
        }
        self.state.write().last_source_checksum = Some(load.source_checksum().to_string());

        let schema = match load {
            SchemaLoad::Valid { schema, .. } => schema,
            SchemaLoad::Invalid { problems, .. } => {
                self.record_warning(
                    WarningKind::ValidationFailed,
                    format!("schema from {} is invalid: {}", source.name(), problems.join("; ")),
                );
                return self.keep_current();
            }
        };

        let active = self
            .state
            .read()
            .active()
            .map(|e| (e.schema.clone(), e.origin));

        match active {
            None | Some((_, VersionOrigin::Fallback)) => {
                let version = schema.version();
                let schema = Arc::new(schema);
                {
                    let _gate = self.write_gate.lock();
                    self.state.write().install(schema.clone(), VersionOrigin::Source);
                }
                self.store_cache(schema);
                info!(version = %version, source = %source.name(), "Schema loaded");
                RefreshOutcome::Adopted(version)
            }
            Some((current, _)) if schema.version() > current.version() => {
                let version = schema.version();
                match self.register(schema, Some(current.version()), VersionOrigin::Source) {
                    Ok(_) => RefreshOutcome::Adopted(version),
                    Err(e) => {
                        self.record_warning(
                            WarningKind::VersionRejected,
                            format!("schema {} from {} rejected: {}", version, source.name(), e),
                        );
                        self.touch_cache();
                        RefreshOutcome::Kept(current.version())
                    }
                }
            }
            Some((current, _)) => {
                if schema.version() == current.version()
                    && schema.checksum() != current.checksum()
                {
                    self.record_warning(
                        WarningKind::VersionRejected,
                        format!(
                            "schema {} changed content without a version bump; keeping registered copy",
                            current.version()
                        ),
                    );
                } else {
                    debug!(
                        source_version = %schema.version(),
                        active = %current.version(),
                        "Source schema is not newer than the active version"
                    );
                }
                self.touch_cache();
                RefreshOutcome::Kept(current.version())
            }
        }
    }

    /// Register a new version on top of `based_on`; the only schema writer
    pub fn register_version(
        &self,
        schema: AttributeSchema,
        based_on: Option<SchemaVersion>,
    ) -> Result<Arc<AttributeSchema>> {
        self.register(schema, based_on, VersionOrigin::Governance)
    }

    /// Re-register versions persisted by an earlier run
    ///
    /// Unknown versions join the history so `schema_at` resolves them. The
    /// newest becomes active when it supersedes the active version under the
    /// same rules `register_version` applies, or when only the fallback is in
    /// use. Returns the version made active, if any.
    pub fn restore_versions(&self, schemas: Vec<AttributeSchema>) -> Option<SchemaVersion> {
        let _gate = self.write_gate.lock();
        let mut state = self.state.write();

        let mut restored = Vec::new();
        let mut newest: Option<Arc<AttributeSchema>> = None;
        for schema in schemas {
            let version = schema.version();
            let known = state
                .versions
                .iter()
                .any(|e| e.schema.version() == version && e.origin != VersionOrigin::Fallback);
            if known || restored.contains(&version) {
                continue;
            }
            let schema = Arc::new(schema);
            if newest.as_ref().map_or(true, |n| version > n.version()) {
                newest = Some(schema.clone());
            }
            restored.push(version);
            state.versions.push(VersionEntry {
                schema,
                active: false,
                origin: VersionOrigin::Restored,
                registered_at: Utc::now(),
            });
        }
        let newest = newest?;

        let adopt = match state.active() {
            None => true,
            Some(active) if active.origin == VersionOrigin::Fallback => {
                newest.version() >= active.schema.version()
            }
            Some(active) => {
                let current = active.schema.version();
                newest.version() > current
                    && (newest.version().major != current.major
                        || newest.additive_problems(&active.schema).is_empty())
            }
        };
        if adopt {
            for entry in &mut state.versions {
                entry.active = Arc::ptr_eq(&entry.schema, &newest);
            }
        }
        state.versions.retain(|e| {
            let replaced = restored.contains(&e.schema.version());
            e.active || !(e.origin == VersionOrigin::Fallback && replaced)
        });
        drop(state);

        debug!(versions = restored.len(), "Schema versions restored");
        if !adopt {
            return None;
        }
        self.store_cache(newest.clone());
        info!(version = %newest.version(), "Restored schema version is active");
        Some(newest.version())
    }

    fn register(
        &self,
        schema: AttributeSchema,
        based_on: Option<SchemaVersion>,
        origin: VersionOrigin,
    ) -> Result<Arc<AttributeSchema>> {
        let _gate = self.write_gate.lock();

        let current = self.state.read().active().map(|e| e.schema.clone());
        let schema = match (&current, based_on) {
            (Some(active), Some(base)) if active.version() != base => {
                return Err(Error::SchemaVersionConflict {
                    message: format!(
                        "proposed schema is based on {} but {} is active",
                        base,
                        active.version()
                    ),
                });
            }
            (Some(active), None) => {
                return Err(Error::SchemaVersionConflict {
                    message: format!(
                        "proposed schema must be based on active version {}",
                        active.version()
                    ),
                });
            }
            (Some(active), Some(_)) => {
                if schema.version() <= active.version() {
                    return Err(Error::SchemaVersionConflict {
                        message: format!(
                            "proposed version {} is not newer than active {}",
                            schema.version(),
                            active.version()
                        ),
                    });
                }
                if schema.version().major == active.version().major {
                    let problems = schema.additive_problems(active);
                    if !problems.is_empty() {
                        return Err(Error::SchemaValidation { problems });
                    }
                }
                schema.rebased_on(active.version())
            }
            (None, _) => schema,
        };

        let version = schema.version();
        let schema = Arc::new(schema);
        self.state.write().install(schema.clone(), origin);
        self.store_cache(schema.clone());

        info!(
            version = %version,
            based_on = ?based_on.map(|v| v.to_string()),
            fields = schema.fields().len(),
            origin = ?origin,
            "Schema version registered"
        );
        Ok(schema)
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// Look up any registered version
    pub fn schema_at(&self, version: SchemaVersion) -> Option<Arc<AttributeSchema>> {
        self.state
            .read()
            .versions
            .iter()
            .find(|e| e.schema.version() == version)
            .map(|e| e.schema.clone())
    }

    pub fn active_version(&self) -> SchemaVersion {
        self.get_active_schema().0
    }

    /// Whether the embedded fallback is what readers currently get
    pub fn is_fallback(&self) -> bool {
        self.state
            .read()
            .active()
            .map_or(true, |e| e.origin == VersionOrigin::Fallback)
    }

    pub fn versions(&self) -> Vec<VersionInfo> {
        self.state
            .read()
            .versions
            .iter()
            .map(|e| VersionInfo {
                version: e.schema.version(),
                checksum: e.schema.checksum().to_string(),
                active: e.active,
                origin: e.origin,
                field_count: e.schema.fields().len(),
                registered_at: e.registered_at,
            })
            .collect()
    }

    /// Most recent warnings, oldest first
    pub fn recent_warnings(&self) -> Vec<RegistryWarning> {
        self.warnings.lock().iter().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────

    fn current_or_fallback(&self) -> (SchemaVersion, Arc<AttributeSchema>) {
        if let Some(entry) = self.state.read().active() {
            return (entry.schema.version(), entry.schema.clone());
        }
        self.install_fallback()
    }

    /// Keep the last-known-good version, installing the fallback if there is none
    fn keep_current(&self) -> RefreshOutcome {
        let existing = self.state.read().active().map(|e| e.schema.version());
        let version = match existing {
            Some(v) => {
                self.touch_cache();
                v
            }
            None => self.install_fallback().0,
        };
        RefreshOutcome::Kept(version)
    }

    fn install_fallback(&self) -> (SchemaVersion, Arc<AttributeSchema>) {
        let _gate = self.write_gate.lock();
        if let Some(entry) = self.state.read().active() {
            return (entry.schema.version(), entry.schema.clone());
        }
        let schema = Arc::new(fallback_schema());
        self.state.write().install(schema.clone(), VersionOrigin::Fallback);
        self.store_cache(schema.clone());
        self.record_warning(
            WarningKind::FallbackInUse,
            format!("serving embedded fallback schema {}", schema.version()),
        );
        (schema.version(), schema)
    }

    fn store_cache(&self, schema: Arc<AttributeSchema>) {
        *self.cache.write() = Some(SchemaCache {
            schema,
            validated_at: Instant::now(),
        });
    }

    fn touch_cache(&self) {
        let active = self.state.read().active().map(|e| e.schema.clone());
        if let Some(schema) = active {
            self.store_cache(schema);
        }
    }

    fn record_warning(&self, kind: WarningKind, message: String) {
        warn!(kind = ?kind, "{}", message);
        let mut warnings = self.warnings.lock();
        if warnings.len() >= MAX_WARNINGS {
            warnings.pop_front();
        }
        warnings.push_back(RegistryWarning {
            kind,
            message,
            at: Utc::now(),
        });
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("source", &self.source.as_ref().map(|s| s.name()))
            .field("cache_ttl", &self.cache_ttl)
            .field("versions", &self.state.read().versions.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source::InMemorySchemaSource;
    use crate::schema::types::{AttributeType, FieldSpec, SchemaDocument};

    const V1: &str = r#"
version = "1.0"
[[fields]]
path = "age"
type = "text"
[[fields]]
path = "gender"
type = "text"
"#;
    const V1_1: &str = r#"
version = "1.1"
[[fields]]
path = "age"
type = "text"
[[fields]]
path = "gender"
type = "text"
[[fields]]
path = "hair_color"
type = "text"
"#;
    const RETYPED_AGE: &str = r#"
version = "{version}"
[[fields]]
path = "age"
type = "number"
"#;

    fn registry(content: &str) -> (Arc<InMemorySchemaSource>, SchemaRegistry) {
        let source = Arc::new(InMemorySchemaSource::new(content));
        let registry = SchemaRegistry::new(source.clone(), Duration::ZERO);
        registry.init();
        (source, registry)
    }

    #[test]
    fn test_loads_source_schema() {
        let (_, registry) = registry(V1);
        let (version, schema) = registry.get_active_schema();
        assert_eq!(version, SchemaVersion::new(1, 0));
        assert!(schema.contains("gender"));
        assert!(!registry.is_fallback());
        assert!(registry.recent_warnings().is_empty());
    }

    #[test]
    fn test_unavailable_source_uses_fallback() {
        let source = Arc::new(InMemorySchemaSource::unavailable());
        let registry = SchemaRegistry::new(source, Duration::from_secs(60));
        let (_, schema) = registry.get_active_schema();
        assert!(registry.is_fallback());
        assert!(schema.contains("clothing.style"));

        let kinds: Vec<_> = registry.recent_warnings().iter().map(|w| w.kind).collect();
        assert!(kinds.contains(&WarningKind::SourceUnavailable));
        assert!(kinds.contains(&WarningKind::FallbackInUse));
    }

    #[test]
    fn test_corrupt_update_keeps_last_known_good() {
        let (source, registry) = registry(V1);
        source.set(Some("version = \"1.1\"\n[[fields]]\npath = \"age\"\n".into()));
        assert_eq!(registry.refresh(), RefreshOutcome::Kept(SchemaVersion::new(1, 0)));
        assert_eq!(registry.active_version(), SchemaVersion::new(1, 0));
        assert!(registry
            .recent_warnings()
            .iter()
            .any(|w| w.kind == WarningKind::ValidationFailed));
    }

    #[test]
    fn test_source_unavailable_after_load_keeps_version() {
        let (source, registry) = registry(V1);
        source.set(None);
        let (version, _) = registry.get_active_schema();
        assert_eq!(version, SchemaVersion::new(1, 0));
        assert!(!registry.is_fallback());
    }

    #[test]
    fn test_newer_source_version_is_adopted() {
        let (source, registry) = registry(V1);
        source.set(Some(V1_1.into()));
        assert_eq!(registry.refresh(), RefreshOutcome::Adopted(SchemaVersion::new(1, 1)));
        let versions = registry.versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.iter().filter(|v| v.active).count(), 1);
        assert!(registry.schema_at(SchemaVersion::new(1, 0)).is_some());
    }

    #[test]
    fn test_non_additive_minor_rejected() {
        let (source, registry) = registry(V1);
        source.set(Some(RETYPED_AGE.replace("{version}", "1.1")));
        assert_eq!(registry.refresh(), RefreshOutcome::Kept(SchemaVersion::new(1, 0)));
        assert!(registry
            .recent_warnings()
            .iter()
            .any(|w| w.kind == WarningKind::VersionRejected));
    }

    #[test]
    fn test_major_bump_may_remove_fields() {
        let (source, registry) = registry(V1);
        source.set(Some(RETYPED_AGE.replace("{version}", "2.0")));
        assert_eq!(registry.refresh(), RefreshOutcome::Adopted(SchemaVersion::new(2, 0)));
    }

    #[test]
    fn test_register_version_requires_current_base() {
        let (_, registry) = registry(V1);
        let (_, active) = registry.get_active_schema();
        let next = active
            .extended_with(vec![FieldSpec::new("hair_color", AttributeType::Text)])
            .unwrap();

        let stale = registry.register_version(next.clone(), Some(SchemaVersion::new(0, 9)));
        assert!(matches!(stale, Err(Error::SchemaVersionConflict { .. })));

        let registered = registry
            .register_version(next.clone(), Some(SchemaVersion::new(1, 0)))
            .unwrap();
        assert_eq!(registered.version(), SchemaVersion::new(1, 1));
        assert_eq!(registry.active_version(), SchemaVersion::new(1, 1));

        // Same proposal again is now stale
        assert!(registry
            .register_version(next, Some(SchemaVersion::new(1, 0)))
            .is_err());
    }

    #[test]
    fn test_restored_versions_resume_history() {
        let (_, registry) = registry(V1);
        let (_, active) = registry.get_active_schema();
        let governed = active
            .extended_with(vec![FieldSpec::new("tattoo_style", AttributeType::Text)])
            .unwrap();
        let retyped = SchemaDocument::parse(&RETYPED_AGE.replace("{version}", "1.2"))
            .unwrap()
            .into_schema()
            .unwrap();

        // Non-additive successor joins the history but never becomes active
        assert_eq!(registry.restore_versions(vec![retyped]), None);
        assert_eq!(registry.active_version(), SchemaVersion::new(1, 0));
        assert!(registry.schema_at(SchemaVersion::new(1, 2)).is_some());

        assert_eq!(
            registry.restore_versions(vec![governed.clone(), governed]),
            Some(SchemaVersion::new(1, 1))
        );
        let (version, schema) = registry.get_active_schema();
        assert_eq!(version, SchemaVersion::new(1, 1));
        assert!(schema.contains("tattoo_style"));
        assert!(registry
            .versions()
            .iter()
            .any(|v| v.active && v.origin == VersionOrigin::Restored));

        // The source still serves 1.0, which is older than the restored version
        registry.invalidate();
        assert_eq!(registry.refresh(), RefreshOutcome::Kept(SchemaVersion::new(1, 1)));
        assert_eq!(registry.active_version(), SchemaVersion::new(1, 1));
    }

    #[test]
    fn test_pinned_registry() {
        let schema = crate::schema::source::fallback_schema();
        let registry = SchemaRegistry::with_schema(schema);
        assert_eq!(registry.refresh(), RefreshOutcome::Unchanged);
        assert_eq!(registry.versions().len(), 1);
    }

    #[test]
    fn test_concurrent_readers() {
        let (_, registry) = registry(V1);
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let (v, _) = registry.get_active_schema();
                        assert_eq!(v, SchemaVersion::new(1, 0));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
