//! Session pseudonyms
//!
//! The only key research records are stored under. Callers that hold a user
//! id derive the pseudonym with a salt so the id itself never reaches the
//! store.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const MAX_LEN: usize = 128;

/// Opaque, privacy-preserving session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pseudonym(String);

impl Pseudonym {
    /// Accept an existing pseudonym after validating its shape
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_LEN {
            return Err(Error::InvalidPseudonym(format!(
                "must be 1-{} characters",
                MAX_LEN
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidPseudonym(
                "may only contain ASCII letters, digits, '-' and '_'".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// hex(SHA-256(salt || user_id))
    pub fn derive(user_id: &str, salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(user_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Pseudonym {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Pseudonym::new(value).map_err(|e| e.to_string())
    }
}

impl From<Pseudonym> for String {
    fn from(p: Pseudonym) -> Self {
        p.0
    }
}
