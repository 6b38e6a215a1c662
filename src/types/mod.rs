//! Shared type definitions
//!
//! Record identifiers, source tags and analysis types used across the
//! store, diff and job queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

record_id!(
    /// Stored attribute set
    SetId
);
record_id!(
    /// Stored diff result
    DiffId
);
record_id!(
    /// Deferred analysis job
    JobId
);
record_id!(
    /// Stored analysis result
    ResultId
);

// ─────────────────────────────────────────────────────────────────
// Source Tag
// ─────────────────────────────────────────────────────────────────

/// Which producer an attribute set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    /// Extracted from the free-text description
    Description,
    /// Extracted from the generated visual artifact
    Artifact,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::Description => write!(f, "description"),
            SourceTag::Artifact => write!(f, "artifact"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Analysis Types
// ─────────────────────────────────────────────────────────────────

/// Secondary analyses that can run against a stored attribute set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    GenderStereotype,
    AgeStereotype,
    CulturalStereotype,
    OccupationalStereotype,
}

impl AnalysisType {
    pub fn all() -> &'static [AnalysisType] {
        &[
            AnalysisType::GenderStereotype,
            AnalysisType::AgeStereotype,
            AnalysisType::CulturalStereotype,
            AnalysisType::OccupationalStereotype,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnalysisType::GenderStereotype => "gender_stereotype",
            AnalysisType::AgeStereotype => "age_stereotype",
            AnalysisType::CulturalStereotype => "cultural_stereotype",
            AnalysisType::OccupationalStereotype => "occupational_stereotype",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisType::all()
            .iter()
            .copied()
            .find(|t| t.name() == s.trim().to_lowercase())
            .ok_or_else(|| {
                format!(
                    "Unknown analysis type '{}'. Valid options: {}",
                    s,
                    AnalysisType::all()
                        .iter()
                        .map(|t| t.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}
