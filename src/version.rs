//! Schema versions and version identifiers

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::checksum::Checksum;
use crate::schema::FieldDef;

/// Identifier of a version within one entity (semantic version)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub Version);

impl VersionId {
    /// The id given to the first version of an entity
    pub fn initial() -> Self {
        Self(Version::new(1, 0, 0))
    }

    /// Parse "1.2.3" or "v1.2.3"
    pub fn parse(version_str: &str) -> Result<Self, semver::Error> {
        let version_str = version_str.strip_prefix('v').unwrap_or(version_str);
        Ok(Self(Version::parse(version_str)?))
    }

    /// Bump major version
    pub fn bump_major(&self) -> Self {
        Self(Version::new(self.0.major + 1, 0, 0))
    }

    /// Bump minor version
    pub fn bump_minor(&self) -> Self {
        Self(Version::new(self.0.major, self.0.minor + 1, 0))
    }

    /// Bump patch version
    pub fn bump_patch(&self) -> Self {
        Self(Version::new(self.0.major, self.0.minor, self.0.patch + 1))
    }

    /// Get the tag string (e.g., "v1.2.3")
    pub fn tag_string(&self) -> String {
        format!("v{}", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionId {
    type Err = semver::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Selects a version for `resolve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    /// The published current version
    Latest,
    Exact(VersionId),
}

impl FromStr for VersionSelector {
    type Err = semver::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" {
            Ok(VersionSelector::Latest)
        } else {
            Ok(VersionSelector::Exact(VersionId::parse(s)?))
        }
    }
}

impl From<VersionId> for VersionSelector {
    fn from(id: VersionId) -> Self {
        VersionSelector::Exact(id)
    }
}

/// An immutable schema version of one entity
///
/// Never mutated once allocated; every change produces a new version whose
/// `predecessor` names the version it was derived from. The predecessor is
/// referenced by id only and is not kept alive by this link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Version id, unique per entity
    pub id: VersionId,
    /// Entity this version describes (event, endpoint, table)
    pub entity: String,
    /// Ordered field definitions
    pub fields: Vec<FieldDef>,
    /// When this version was created
    pub created_at: DateTime<Utc>,
    /// Version this one was derived from
    pub predecessor: Option<VersionId>,
    /// SHA256 fingerprint of the field set
    pub fingerprint: Checksum,
}

impl SchemaVersion {
    pub(crate) fn new(
        id: VersionId,
        entity: impl Into<String>,
        fields: Vec<FieldDef>,
        predecessor: Option<VersionId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let fingerprint = Checksum::of_fields(&fields);
        Self {
            id,
            entity: entity.into(),
            fields,
            created_at,
            predecessor,
            fingerprint,
        }
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether the version declares a field
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Verify the fingerprint matches the fields
    pub fn verify(&self) -> bool {
        self.fingerprint.verify_fields(&self.fields)
    }

    /// Unique key for this version (e.g., "users/v1.2.0")
    pub fn key(&self) -> String {
        format!("{}/{}", self.entity, self.id)
    }

    /// Field listing, one field per line
    pub fn listing(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{}\n", f.describe()))
            .collect()
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity, self.id)
    }
}
