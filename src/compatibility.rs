//! Schema compatibility checking
//!
//! Classifies every field-level difference between two versions of an entity
//! and evaluates the result against a [`CompatibilityMode`]. Checking is a
//! pure function: the set of fields already cleared for removal is passed in
//! rather than read from shared state, so identical inputs always produce an
//! identical [`Verdict`].

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::schema::{FieldDef, FieldType};
use crate::version::{SchemaVersion, VersionId};

/// Policy governing which classifications may be published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityMode {
    /// Everything allowed; each use is a policy exception
    None,
    /// New readers can read old data: no unsanctioned destructive changes
    #[default]
    Backward,
    /// Old readers can read new data: no added fields without defaults
    Forward,
    /// Both directions
    Full,
}

impl CompatibilityMode {
    fn guards_backward(self) -> bool {
        matches!(self, CompatibilityMode::Backward | CompatibilityMode::Full)
    }

    fn guards_forward(self) -> bool {
        matches!(self, CompatibilityMode::Forward | CompatibilityMode::Full)
    }
}

impl fmt::Display for CompatibilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompatibilityMode::None => "NONE",
            CompatibilityMode::Backward => "BACKWARD",
            CompatibilityMode::Forward => "FORWARD",
            CompatibilityMode::Full => "FULL",
        };
        f.write_str(name)
    }
}

impl FromStr for CompatibilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(CompatibilityMode::None),
            "BACKWARD" => Ok(CompatibilityMode::Backward),
            "FORWARD" => Ok(CompatibilityMode::Forward),
            "FULL" => Ok(CompatibilityMode::Full),
            other => Err(format!("unknown compatibility mode '{}'", other)),
        }
    }
}

/// Severity class of a field-level difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Unchanged,
    Additive,
    Destructive,
    /// Name and type unchanged, meaning changed
    SemanticBreaking,
}

impl Classification {
    /// Destructive and semantic-breaking changes share the same severity
    pub fn is_breaking(&self) -> bool {
        matches!(self, Classification::Destructive | Classification::SemanticBreaking)
    }
}

/// What structurally happened to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Unchanged,
    Added,
    Removed,
    TypeWidened,
    TypeChanged,
    NullabilityRelaxed,
    NullabilityTightened,
    DefaultChanged,
    DefaultRemoved,
    UnitChanged,
    NestedUnitChanged,
}

/// A classified difference for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub classification: Classification,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<FieldDef>,
    /// Human-readable description
    pub description: String,
}

/// Which mode rule a change violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    /// Breaking change to a field not cleared for removal
    BreakingWithoutDeprecation,
    /// Added field that old producers cannot supply
    AddedWithoutDefault,
}

/// A change the active mode does not permit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub classification: Classification,
    pub rule: ViolationRule,
    /// Operator-facing guidance
    pub message: String,
}

/// Result of a compatibility check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub entity: String,
    pub old_version: VersionId,
    pub new_version: VersionId,
    pub mode: CompatibilityMode,
    /// One entry per field present in either version
    pub changes: Vec<FieldChange>,
    /// Whether the mode permits publishing the new version
    pub allowed: bool,
    /// Every violation, not just the first
    pub violations: Vec<Violation>,
    /// Set when the check ran under `NONE`
    pub policy_exception: bool,
}

impl Verdict {
    /// Whether any field change is breaking, regardless of mode
    pub fn is_breaking(&self) -> bool {
        self.changes.iter().any(|c| c.classification.is_breaking())
    }

    /// Changes with the given classification
    pub fn changes_of(&self, classification: Classification) -> Vec<&FieldChange> {
        self.changes
            .iter()
            .filter(|c| c.classification == classification)
            .collect()
    }

    /// Classification of a single field, if it appears in either version
    pub fn classification_of(&self, field: &str) -> Option<Classification> {
        self.changes
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.classification)
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let breaking = self.changes.iter().filter(|c| c.classification.is_breaking()).count();
        let additive = self.changes_of(Classification::Additive).len();
        if self.allowed {
            format!(
                "{} {} -> {} allowed under {} ({} additive, {} breaking)",
                self.entity, self.old_version, self.new_version, self.mode, additive, breaking
            )
        } else {
            format!(
                "{} {} -> {} rejected under {}: {} violation(s)",
                self.entity,
                self.old_version,
                self.new_version,
                self.mode,
                self.violations.len()
            )
        }
    }
}

/// Compatibility checker for schema versions
#[derive(Debug, Default, Clone, Copy)]
pub struct CompatibilityChecker;

impl CompatibilityChecker {
    pub fn new() -> Self {
        Self
    }

    /// Compare two versions under a mode
    ///
    /// `cleared` names the fields whose deprecation has reached
    /// READY_FOR_REMOVAL (or beyond); breaking changes to those fields are
    /// sanctioned under BACKWARD and FULL.
    pub fn check(
        &self,
        old: &SchemaVersion,
        new: &SchemaVersion,
        mode: CompatibilityMode,
        cleared: &BTreeSet<String>,
    ) -> Verdict {
        let changes = detect_changes(&old.fields, &new.fields);

        let mut violations = Vec::new();
        for change in &changes {
            if mode.guards_backward()
                && change.classification.is_breaking()
                && !cleared.contains(&change.field)
            {
                violations.push(Violation {
                    field: change.field.clone(),
                    classification: change.classification,
                    rule: ViolationRule::BreakingWithoutDeprecation,
                    message: format!(
                        "{}; deprecate '{}' and wait for READY_FOR_REMOVAL, or add a replacement field instead",
                        change.description, change.field
                    ),
                });
            }
            if mode.guards_forward() && change.kind == ChangeKind::Added {
                let lacks_default = change.new.as_ref().map(|f| f.default.is_none()).unwrap_or(true);
                if lacks_default {
                    violations.push(Violation {
                        field: change.field.clone(),
                        classification: change.classification,
                        rule: ViolationRule::AddedWithoutDefault,
                        message: format!(
                            "field '{}' was added without a default; old producers cannot supply it",
                            change.field
                        ),
                    });
                }
            }
        }

        Verdict {
            entity: new.entity.clone(),
            old_version: old.id.clone(),
            new_version: new.id.clone(),
            mode,
            changes,
            allowed: violations.is_empty(),
            violations,
            policy_exception: mode == CompatibilityMode::None,
        }
    }
}

/// Classify one field given its old and new definitions
pub fn classify_field(old: Option<&FieldDef>, new: Option<&FieldDef>) -> (Classification, ChangeKind) {
    match (old, new) {
        (None, None) => (Classification::Unchanged, ChangeKind::Unchanged),
        (None, Some(added)) => {
            if added.is_optional() {
                (Classification::Additive, ChangeKind::Added)
            } else {
                (Classification::Destructive, ChangeKind::Added)
            }
        }
        (Some(_), None) => (Classification::Destructive, ChangeKind::Removed),
        (Some(old), Some(new)) if old == new => (Classification::Unchanged, ChangeKind::Unchanged),
        (Some(old), Some(new)) => {
            if !old.widens_to(new) {
                let kind = if !old.field_type.widens_to(&new.field_type) {
                    ChangeKind::TypeChanged
                } else if old.admits_null() && !new.admits_null() {
                    ChangeKind::NullabilityTightened
                } else {
                    ChangeKind::DefaultRemoved
                };
                return (Classification::Destructive, kind);
            }
            if old.unit != new.unit {
                return (Classification::SemanticBreaking, ChangeKind::UnitChanged);
            }
            if nested_unit_change(&old.field_type, &new.field_type).is_some() {
                return (Classification::SemanticBreaking, ChangeKind::NestedUnitChanged);
            }
            let kind = if old.field_type != new.field_type {
                ChangeKind::TypeWidened
            } else if old.admits_null() != new.admits_null() {
                ChangeKind::NullabilityRelaxed
            } else {
                ChangeKind::DefaultChanged
            };
            (Classification::Additive, kind)
        }
    }
}

/// Dotted path of a field nested inside `old` whose unit differs in `new`
fn nested_unit_change(old: &FieldType, new: &FieldType) -> Option<String> {
    match (old, new) {
        (FieldType::Record { fields: a }, FieldType::Record { fields: b }) => a.iter().find_map(|o| {
            let n = b.iter().find(|n| n.name == o.name)?;
            if o.unit != n.unit {
                Some(o.name.clone())
            } else {
                nested_unit_change(&o.field_type, &n.field_type)
                    .map(|path| format!("{}.{}", o.name, path))
            }
        }),
        (FieldType::Nullable { inner: a }, FieldType::Nullable { inner: b })
        | (FieldType::List { items: a }, FieldType::List { items: b })
        | (FieldType::Map { values: a }, FieldType::Map { values: b }) => nested_unit_change(a, b),
        (_, FieldType::Nullable { inner }) => nested_unit_change(old, inner),
        _ => None,
    }
}

/// Detect changes between two field lists
///
/// Old fields come first in their declared order, then fields present only in
/// the new list in their declared order.
fn detect_changes(old: &[FieldDef], new: &[FieldDef]) -> Vec<FieldChange> {
    let mut changes = Vec::with_capacity(old.len().max(new.len()));

    for old_field in old {
        let new_field = new.iter().find(|f| f.name == old_field.name);
        let (classification, kind) = classify_field(Some(old_field), new_field);
        changes.push(FieldChange {
            field: old_field.name.clone(),
            classification,
            kind,
            old: Some(old_field.clone()),
            new: new_field.cloned(),
            description: describe(kind, old_field, new_field),
        });
    }

    for new_field in new.iter().filter(|f| !old.iter().any(|o| o.name == f.name)) {
        let (classification, kind) = classify_field(None, Some(new_field));
        let description = if classification.is_breaking() {
            format!(
                "field '{}' was added as non-nullable without a default (breaking)",
                new_field.name
            )
        } else {
            format!("field '{}' was added", new_field.name)
        };
        changes.push(FieldChange {
            field: new_field.name.clone(),
            classification,
            kind,
            old: None,
            new: Some(new_field.clone()),
            description,
        });
    }

    changes
}

fn describe(kind: ChangeKind, old: &FieldDef, new: Option<&FieldDef>) -> String {
    let name = &old.name;
    match (kind, new) {
        (ChangeKind::Removed, _) | (_, None) => format!("field '{}' was removed", name),
        (ChangeKind::Unchanged, _) => format!("field '{}' is unchanged", name),
        (ChangeKind::TypeWidened, Some(new)) => format!(
            "field '{}' type widened from {} to {}",
            name, old.field_type, new.field_type
        ),
        (ChangeKind::TypeChanged, Some(new)) => format!(
            "field '{}' type changed incompatibly from {} to {}",
            name, old.field_type, new.field_type
        ),
        (ChangeKind::NullabilityRelaxed, _) => format!("field '{}' became nullable", name),
        (ChangeKind::NullabilityTightened, _) => format!("field '{}' is no longer nullable", name),
        (ChangeKind::DefaultChanged, _) => format!("field '{}' default changed", name),
        (ChangeKind::DefaultRemoved, _) => {
            format!("field '{}' lost its default while non-nullable", name)
        }
        (ChangeKind::UnitChanged, Some(new)) => format!(
            "field '{}' unit changed from {} to {}; meaning changes need a new field",
            name,
            old.unit.as_deref().unwrap_or("none"),
            new.unit.as_deref().unwrap_or("none")
        ),
        (ChangeKind::NestedUnitChanged, Some(new)) => format!(
            "field '{}' changes the unit of nested '{}'; meaning changes need a new field",
            name,
            nested_unit_change(&old.field_type, &new.field_type).unwrap_or_default()
        ),
        (ChangeKind::Added, _) => format!("field '{}' was added", name),
    }
}

/// Unified diff of two versions' field listings, for operator display
pub fn field_listing_diff(old: &SchemaVersion, new: &SchemaVersion) -> String {
    let old_text = old.listing();
    let new_text = new.listing();
    let diff = TextDiff::from_lines(&old_text, &new_text);
    let rendered = diff
        .unified_diff()
        .header(&old.key(), &new.key())
        .to_string();
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn version(id: &str, fields: Vec<FieldDef>) -> SchemaVersion {
        SchemaVersion::new(VersionId::parse(id).unwrap(), "users", fields, None, Utc::now())
    }

    fn base() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldType::Int32).with_default(json!(0)),
            FieldDef::new("phone_number", FieldType::String).nullable(),
        ]
    }

    #[test]
    fn test_compatible_field_addition() {
        let old = version("1.0.0", base());
        let mut fields = base();
        fields.push(FieldDef::new("email", FieldType::String).nullable().with_default(json!(null)));
        let new = version("1.1.0", fields);

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Full, &BTreeSet::new());
        assert_eq!(verdict.classification_of("email"), Some(Classification::Additive));
        assert!(verdict.allowed);
        assert!(!verdict.is_breaking());
    }

    #[test]
    fn test_required_addition_without_default_is_destructive() {
        let old = version("1.0.0", base());
        let mut fields = base();
        fields.push(FieldDef::new("tenant", FieldType::String));
        let new = version("1.1.0", fields);

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &BTreeSet::new());
        assert_eq!(verdict.classification_of("tenant"), Some(Classification::Destructive));
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_breaking_field_removal() {
        let old = version("1.0.0", base());
        let new = version("1.1.0", vec![base().remove(0)]);

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &BTreeSet::new());
        assert_eq!(verdict.classification_of("phone_number"), Some(Classification::Destructive));
        assert!(!verdict.allowed);
        assert_eq!(verdict.violations.len(), 1);
        assert_eq!(verdict.violations[0].rule, ViolationRule::BreakingWithoutDeprecation);
    }

    #[test]
    fn test_cleared_field_may_be_removed() {
        let old = version("1.0.0", base());
        let new = version("1.1.0", vec![base().remove(0)]);
        let cleared: BTreeSet<String> = ["phone_number".to_string()].into_iter().collect();

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &cleared);
        assert!(verdict.allowed);
        assert!(verdict.is_breaking());
    }

    #[test]
    fn test_widening_is_additive_and_narrowing_destructive() {
        let old = version("1.0.0", base());
        let mut widened = base();
        widened[0].field_type = FieldType::Int64;
        let new = version("1.1.0", widened.clone());
        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &BTreeSet::new());
        assert_eq!(verdict.classification_of("id"), Some(Classification::Additive));
        assert_eq!(verdict.changes[0].kind, ChangeKind::TypeWidened);

        let back = CompatibilityChecker::new().check(&new, &old, CompatibilityMode::Backward, &BTreeSet::new());
        assert_eq!(back.classification_of("id"), Some(Classification::Destructive));
        assert_eq!(back.changes[0].kind, ChangeKind::TypeChanged);
    }

    #[test]
    fn test_unit_only_change_is_semantic_breaking() {
        let old = version(
            "1.0.0",
            vec![FieldDef::new("session_duration", FieldType::Int64).with_default(json!(0)).with_unit("seconds")],
        );
        let new = version(
            "1.1.0",
            vec![FieldDef::new("session_duration", FieldType::Int64).with_default(json!(0)).with_unit("milliseconds")],
        );

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &BTreeSet::new());
        assert_eq!(
            verdict.classification_of("session_duration"),
            Some(Classification::SemanticBreaking)
        );
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_unit_change_inside_record_is_semantic_breaking() {
        let session = |unit: &str| {
            FieldDef::new(
                "session",
                FieldType::Record {
                    fields: vec![FieldDef::new("duration", FieldType::Int64)
                        .with_default(json!(0))
                        .with_unit(unit)],
                },
            )
            .nullable()
        };
        let old = version("1.0.0", vec![session("seconds")]);
        let new = version("1.1.0", vec![session("milliseconds")]);

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &BTreeSet::new());
        assert_eq!(verdict.classification_of("session"), Some(Classification::SemanticBreaking));
        assert_eq!(verdict.changes[0].kind, ChangeKind::NestedUnitChanged);
        assert!(verdict.changes[0].description.contains("'duration'"));
        assert!(!verdict.allowed);

        let listed = version("1.0.0", vec![FieldDef::new("sessions", FieldType::List {
            items: Box::new(session("seconds").field_type),
        }).nullable()]);
        let relisted = version("1.1.0", vec![FieldDef::new("sessions", FieldType::List {
            items: Box::new(session("milliseconds").field_type),
        }).nullable()]);
        let verdict = CompatibilityChecker::new().check(&listed, &relisted, CompatibilityMode::None, &BTreeSet::new());
        assert_eq!(verdict.classification_of("sessions"), Some(Classification::SemanticBreaking));
    }

    #[test]
    fn test_forward_rejects_additions_without_default() {
        let old = version("1.0.0", base());
        let mut fields = base();
        fields.push(FieldDef::new("nickname", FieldType::String).nullable());
        let new = version("1.1.0", fields);

        let backward = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward, &BTreeSet::new());
        assert!(backward.allowed);

        let forward = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Forward, &BTreeSet::new());
        assert!(!forward.allowed);
        assert_eq!(forward.violations[0].rule, ViolationRule::AddedWithoutDefault);
    }

    #[test]
    fn test_full_reports_every_violation() {
        let old = version("1.0.0", base());
        let new = version(
            "1.1.0",
            vec![
                FieldDef::new("id", FieldType::String).with_default(json!("")),
                FieldDef::new("nickname", FieldType::String).nullable(),
            ],
        );

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Full, &BTreeSet::new());
        let fields: Vec<_> = verdict.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "phone_number", "nickname"]);
    }

    #[test]
    fn test_none_mode_allows_and_flags_exception() {
        let old = version("1.0.0", base());
        let new = version("1.1.0", vec![base().remove(0)]);

        let verdict = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::None, &BTreeSet::new());
        assert!(verdict.allowed);
        assert!(verdict.policy_exception);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_check_is_deterministic() {
        let old = version("1.0.0", base());
        let mut fields = base();
        fields.push(FieldDef::new("email", FieldType::String).nullable());
        fields.remove(1);
        let new = version("1.1.0", fields);

        let checker = CompatibilityChecker::new();
        let first = checker.check(&old, &new, CompatibilityMode::Full, &BTreeSet::new());
        for _ in 0..10 {
            assert_eq!(checker.check(&old, &new, CompatibilityMode::Full, &BTreeSet::new()), first);
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("backward".parse::<CompatibilityMode>().unwrap(), CompatibilityMode::Backward);
        assert_eq!(CompatibilityMode::Full.to_string(), "FULL");
        assert!("sideways".parse::<CompatibilityMode>().is_err());
    }

    #[test]
    fn test_listing_diff_marks_removed_field() {
        let old = version("1.0.0", base());
        let new = version("1.1.0", vec![base().remove(0)]);
        let diff = field_listing_diff(&old, &new);
        assert!(diff.contains("-phone_number: string nullable"));
    }
}
