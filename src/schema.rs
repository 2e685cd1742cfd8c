//! Field definitions and the declared type system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a field
///
/// Primitive kinds are unit variants; composite kinds wrap further types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    Timestamp,
    Uuid,
    /// Explicit nullable wrapper
    Nullable { inner: Box<FieldType> },
    /// Homogeneous list
    List { items: Box<FieldType> },
    /// String-keyed map
    Map { values: Box<FieldType> },
    /// Closed set of string variants
    Enum { variants: Vec<String> },
    /// Nested record
    Record { fields: Vec<FieldDef> },
}

impl FieldType {
    pub fn nullable(inner: FieldType) -> Self {
        FieldType::Nullable { inner: Box::new(inner) }
    }

    pub fn list(items: FieldType) -> Self {
        FieldType::List { items: Box::new(items) }
    }

    pub fn map(values: FieldType) -> Self {
        FieldType::Map { values: Box::new(values) }
    }

    pub fn enumeration<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldType::Enum {
            variants: variants.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this type admits null
    pub fn is_nullable(&self) -> bool {
        matches!(self, FieldType::Nullable { .. })
    }

    /// Whether every value of `self` is readable as `target`
    ///
    /// The widening table:
    /// - `int32 -> int64`, `int32 -> float64`, `float32 -> float64`
    /// - `T -> nullable<U>` when `T` widens to `U`
    /// - element-wise for lists, maps and nullable wrappers
    /// - enums may gain variants
    /// - records may gain optional fields, existing fields widen
    ///
    /// Identity counts as widening.
    pub fn widens_to(&self, target: &FieldType) -> bool {
        if self == target {
            return true;
        }
        match (self, target) {
            (FieldType::Int32, FieldType::Int64)
            | (FieldType::Int32, FieldType::Float64)
            | (FieldType::Float32, FieldType::Float64) => true,
            (FieldType::Nullable { inner: a }, FieldType::Nullable { inner: b }) => a.widens_to(b),
            (_, FieldType::Nullable { inner }) => self.widens_to(inner),
            (FieldType::List { items: a }, FieldType::List { items: b }) => a.widens_to(b),
            (FieldType::Map { values: a }, FieldType::Map { values: b }) => a.widens_to(b),
            (FieldType::Enum { variants: a }, FieldType::Enum { variants: b }) => {
                a.iter().all(|v| b.contains(v))
            }
            (FieldType::Record { fields: a }, FieldType::Record { fields: b }) => {
                let old_widen = a.iter().all(|old| {
                    b.iter()
                        .find(|new| new.name == old.name)
                        .map(|new| old.widens_to(new))
                        .unwrap_or(false)
                });
                let added_optional = b
                    .iter()
                    .filter(|new| !a.iter().any(|old| old.name == new.name))
                    .all(FieldDef::is_optional);
                old_widen && added_optional
            }
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => write!(f, "bool"),
            FieldType::Int32 => write!(f, "int32"),
            FieldType::Int64 => write!(f, "int64"),
            FieldType::Float32 => write!(f, "float32"),
            FieldType::Float64 => write!(f, "float64"),
            FieldType::String => write!(f, "string"),
            FieldType::Bytes => write!(f, "bytes"),
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::Uuid => write!(f, "uuid"),
            FieldType::Nullable { inner } => write!(f, "nullable<{}>", inner),
            FieldType::List { items } => write!(f, "list<{}>", items),
            FieldType::Map { values } => write!(f, "map<string, {}>", values),
            FieldType::Enum { variants } => write!(f, "enum[{}]", variants.join("|")),
            FieldType::Record { fields } => {
                let names: Vec<_> = fields.iter().map(|field| field.name.as_str()).collect();
                write!(f, "record{{{}}}", names.join(", "))
            }
        }
    }
}

/// Names one field of one entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub entity: String,
    pub field: String,
}

impl FieldRef {
    pub fn new(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

/// A single field of a schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, unique within a version
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field may be absent or null
    #[serde(default)]
    pub nullable: bool,
    /// Default used when a producer omits the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Semantic unit tag, e.g. "seconds" or "milliseconds"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl FieldDef {
    /// Create a required field with no default
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            default: None,
            unit: None,
        }
    }

    /// Mark the field nullable
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Attach a default value
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Attach a semantic unit tag
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Whether null is admitted, either by flag or by a nullable wrapper type
    pub fn admits_null(&self) -> bool {
        self.nullable || self.field_type.is_nullable()
    }

    /// Whether an old producer that never sets this field still yields a valid record
    pub fn is_optional(&self) -> bool {
        self.admits_null() || self.default.is_some()
    }

    /// Field-level widening: type widens and nullability is never tightened
    pub fn widens_to(&self, other: &FieldDef) -> bool {
        let nullability_ok = !self.admits_null() || other.admits_null();
        let default_ok = self.default.is_none() || other.default.is_some() || other.admits_null();
        self.field_type.widens_to(&other.field_type) && nullability_ok && default_ok
    }

    /// One-line rendering used in listings and diffs
    pub fn describe(&self) -> String {
        let mut line = format!("{}: {}", self.name, self.field_type);
        if self.nullable {
            line.push_str(" nullable");
        }
        if let Some(default) = &self.default {
            line.push_str(&format!(" default={}", default));
        }
        if let Some(unit) = &self.unit {
            line.push_str(&format!(" unit={}", unit));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_widening_table() {
        assert!(FieldType::Int32.widens_to(&FieldType::Int64));
        assert!(FieldType::Int32.widens_to(&FieldType::Float64));
        assert!(FieldType::Float32.widens_to(&FieldType::Float64));
        assert!(!FieldType::Int64.widens_to(&FieldType::Int32));
        assert!(!FieldType::String.widens_to(&FieldType::Bytes));
    }

    #[test]
    fn test_nullable_wrapper_widens() {
        let wrapped = FieldType::nullable(FieldType::String);
        assert!(FieldType::String.widens_to(&wrapped));
        assert!(!wrapped.widens_to(&FieldType::String));
        assert!(FieldType::Int32.widens_to(&FieldType::nullable(FieldType::Int64)));
    }

    #[test]
    fn test_enum_may_only_gain_variants() {
        let small = FieldType::enumeration(["admin", "member"]);
        let large = FieldType::enumeration(["admin", "member", "guest"]);
        assert!(small.widens_to(&large));
        assert!(!large.widens_to(&small));
    }

    #[test]
    fn test_record_widening_requires_optional_additions() {
        let old = FieldType::Record {
            fields: vec![FieldDef::new("id", FieldType::Int32)],
        };
        let with_optional = FieldType::Record {
            fields: vec![
                FieldDef::new("id", FieldType::Int64),
                FieldDef::new("note", FieldType::String).nullable(),
            ],
        };
        let with_required = FieldType::Record {
            fields: vec![
                FieldDef::new("id", FieldType::Int32),
                FieldDef::new("tag", FieldType::String),
            ],
        };
        assert!(old.widens_to(&with_optional));
        assert!(!old.widens_to(&with_required));
    }

    #[test]
    fn test_field_serialization_shape() {
        let field = FieldDef::new("session_duration", FieldType::Int64)
            .with_default(json!(0))
            .with_unit("seconds");
        let value = serde_json::to_value(&field).unwrap();
        assert_eq!(value["type"]["kind"], "int64");
        assert_eq!(value["unit"], "seconds");

        let back: FieldDef = serde_json::from_value(value).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn test_tightening_nullability_is_not_widening() {
        let loose = FieldDef::new("email", FieldType::String).nullable();
        let strict = FieldDef::new("email", FieldType::String);
        assert!(strict.widens_to(&loose));
        assert!(!loose.widens_to(&strict));
    }
}
