//! Checksum utilities for schema integrity verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::schema::FieldDef;

/// SHA256 checksum of a version's field set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum from an ordered field list
    ///
    /// Field order is significant; struct fields serialize in declaration
    /// order so the encoding is stable.
    pub fn of_fields(fields: &[FieldDef]) -> Self {
        let canonical = serde_json::to_vec(fields).unwrap_or_default();
        Self::from_bytes(&canonical)
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that a field list matches this checksum
    pub fn verify_fields(&self, fields: &[FieldDef]) -> bool {
        *self == Self::of_fields(fields)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Checksum {
    fn from(s: String) -> Self {
        Self(s)
    }
}
