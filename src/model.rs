//! Schema Model
//!
//! Owns every allocated [`SchemaVersion`] and the version lineage of each
//! entity. Versions are append-only: `propose` always allocates a new version
//! linked to its predecessor and never touches an existing one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use regex::Regex;

use crate::error::{EvolutionError, Result};
use crate::schema::{FieldDef, FieldType};
use crate::version::{SchemaVersion, VersionId, VersionSelector};

fn field_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

fn entity_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("static regex"))
}

/// Reject an entity name that `propose` would never accept
pub fn validate_entity_name(entity: &str) -> Result<()> {
    if entity_name_pattern().is_match(entity) {
        Ok(())
    } else {
        Err(EvolutionError::invalid_schema(entity, "malformed entity name"))
    }
}

/// Reject an (entity, field) pair that `propose` would never accept
pub fn validate_field_ref(entity: &str, field: &str) -> Result<()> {
    validate_entity_name(entity)?;
    if field_name_pattern().is_match(field) {
        Ok(())
    } else {
        Err(EvolutionError::invalid_schema(
            entity,
            format!("malformed field name '{}'", field),
        ))
    }
}

/// All versions of one entity
#[derive(Debug, Default, Clone)]
struct EntityHistory {
    versions: BTreeMap<VersionId, Arc<SchemaVersion>>,
    current: Option<VersionId>,
}

/// Versioned schema store with lineage
#[derive(Debug, Default)]
pub struct SchemaModel {
    entities: HashMap<String, EntityHistory>,
}

impl SchemaModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and allocate a new version
    ///
    /// Fails with `INVALID_SCHEMA` when field names are malformed or repeated,
    /// or when a non-nullable field carries no default. Fails with
    /// `NOT_FOUND` when the predecessor does not exist.
    pub fn propose(
        &mut self,
        entity: &str,
        fields: Vec<FieldDef>,
        predecessor: Option<&VersionId>,
        now: DateTime<Utc>,
    ) -> Result<Arc<SchemaVersion>> {
        validate_fields(entity, &fields)?;

        let known = self.entities.get(entity);
        let has_versions = known.map(|h| !h.versions.is_empty()).unwrap_or(false);
        match predecessor {
            Some(pred) if !known.map(|h| h.versions.contains_key(pred)).unwrap_or(false) => {
                return Err(EvolutionError::not_found("version", format!("{}/{}", entity, pred)));
            }
            None if has_versions => {
                return Err(EvolutionError::invalid_schema(
                    entity,
                    "entity already has versions; a predecessor is required",
                ));
            }
            _ => {}
        }

        let history = self.entities.entry(entity.to_string()).or_default();
        let id = match history.versions.keys().next_back() {
            Some(highest) => highest.bump_minor(),
            None => VersionId::initial(),
        };
        let version = Arc::new(SchemaVersion::new(
            id.clone(),
            entity,
            fields,
            predecessor.cloned(),
            now,
        ));
        history.versions.insert(id, Arc::clone(&version));
        Ok(version)
    }

    /// Look up a version; `Latest` is the published current version
    pub fn resolve(&self, entity: &str, selector: &VersionSelector) -> Result<Arc<SchemaVersion>> {
        let history = self
            .entities
            .get(entity)
            .ok_or_else(|| EvolutionError::not_found("entity", entity))?;
        let id = match selector {
            VersionSelector::Latest => history
                .current
                .as_ref()
                .ok_or_else(|| EvolutionError::not_found("published version", entity))?,
            VersionSelector::Exact(id) => id,
        };
        history
            .versions
            .get(id)
            .cloned()
            .ok_or_else(|| EvolutionError::not_found("version", format!("{}/{}", entity, id)))
    }

    /// The published current version, if any
    pub fn current(&self, entity: &str) -> Option<Arc<SchemaVersion>> {
        let history = self.entities.get(entity)?;
        history.current.as_ref().and_then(|id| history.versions.get(id).cloned())
    }

    /// Promote an allocated version to current
    pub fn set_current(&mut self, entity: &str, id: &VersionId) -> Result<()> {
        let history = self
            .entities
            .get_mut(entity)
            .ok_or_else(|| EvolutionError::not_found("entity", entity))?;
        if !history.versions.contains_key(id) {
            return Err(EvolutionError::not_found("version", format!("{}/{}", entity, id)));
        }
        history.current = Some(id.clone());
        Ok(())
    }

    /// Re-insert a previously persisted version
    ///
    /// Inserting an id that already exists with a different fingerprint is an
    /// immutability violation.
    pub fn restore(&mut self, version: SchemaVersion) -> Result<()> {
        let history = self.entities.entry(version.entity.clone()).or_default();
        if let Some(existing) = history.versions.get(&version.id) {
            if existing.fingerprint != version.fingerprint {
                return Err(EvolutionError::InvalidTransition(format!(
                    "version {} already exists with different content",
                    version.key()
                )));
            }
            return Ok(());
        }
        history.versions.insert(version.id.clone(), Arc::new(version));
        Ok(())
    }

    /// All known entity names, sorted
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entities.keys().cloned().collect();
        names.sort();
        names
    }

    /// All versions of an entity in id order
    pub fn versions(&self, entity: &str) -> Vec<Arc<SchemaVersion>> {
        self.entities
            .get(entity)
            .map(|h| h.versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ancestor chain of a version, oldest first, ending with the version itself
    pub fn lineage(&self, entity: &str, id: &VersionId) -> Result<Vec<VersionId>> {
        let (graph, index) = self.lineage_graph(entity)?;
        let mut node = *index
            .get(id)
            .ok_or_else(|| EvolutionError::not_found("version", format!("{}/{}", entity, id)))?;

        let mut chain = vec![graph[node].clone()];
        while let Some(parent) = graph.neighbors_directed(node, Direction::Incoming).next() {
            chain.push(graph[parent].clone());
            node = parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Every version derived, directly or transitively, from `id`
    pub fn descendants(&self, entity: &str, id: &VersionId) -> Result<Vec<VersionId>> {
        let (graph, index) = self.lineage_graph(entity)?;
        let start = *index
            .get(id)
            .ok_or_else(|| EvolutionError::not_found("version", format!("{}/{}", entity, id)))?;

        let mut found = Vec::new();
        let mut dfs = Dfs::new(&graph, start);
        while let Some(node) = dfs.next(&graph) {
            if node != start {
                found.push(graph[node].clone());
            }
        }
        found.sort();
        Ok(found)
    }

    fn lineage_graph(
        &self,
        entity: &str,
    ) -> Result<(DiGraph<VersionId, ()>, HashMap<VersionId, NodeIndex>)> {
        let history = self
            .entities
            .get(entity)
            .ok_or_else(|| EvolutionError::not_found("entity", entity))?;

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in history.versions.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }
        for version in history.versions.values() {
            if let Some(pred) = &version.predecessor {
                if let (Some(&from), Some(&to)) = (index.get(pred), index.get(&version.id)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Ok((graph, index))
    }
}

fn validate_fields(entity: &str, fields: &[FieldDef]) -> Result<()> {
    validate_entity_name(entity)?;
    if fields.is_empty() {
        return Err(EvolutionError::invalid_schema(entity, "a schema needs at least one field"));
    }
    validate_names(entity, fields)?;

    for field in fields {
        if !field.admits_null() && field.default.is_none() {
            return Err(EvolutionError::invalid_schema(
                entity,
                format!(
                    "field '{}' is non-nullable without a default; add a default or make it nullable",
                    field.name
                ),
            ));
        }
        if !field.admits_null() && field.default == Some(serde_json::Value::Null) {
            return Err(EvolutionError::invalid_schema(
                entity,
                format!("field '{}' is non-nullable but defaults to null", field.name),
            ));
        }
    }
    Ok(())
}

fn validate_names(entity: &str, fields: &[FieldDef]) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        if !field_name_pattern().is_match(&field.name) {
            return Err(EvolutionError::invalid_schema(
                entity,
                format!("malformed field name '{}'", field.name),
            ));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(EvolutionError::invalid_schema(
                entity,
                format!("duplicate field name '{}'", field.name),
            ));
        }
        if let Some(nested) = nested_fields(&field.field_type) {
            validate_names(entity, nested)?;
        }
    }
    Ok(())
}

fn nested_fields(field_type: &FieldType) -> Option<&[FieldDef]> {
    match field_type {
        FieldType::Record { fields } => Some(fields),
        FieldType::Nullable { inner } => nested_fields(inner),
        FieldType::List { items } => nested_fields(items),
        FieldType::Map { values } => nested_fields(values),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users_v1() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldType::Int64).with_default(json!(0)),
            FieldDef::new("phone_number", FieldType::String).nullable(),
        ]
    }

    #[test]
    fn test_field_refs_cannot_leave_their_directory() {
        assert!(validate_field_ref("users", "phone_number").is_ok());
        assert!(validate_field_ref("billing.v2-accounts", "id").is_ok());
        for (entity, field) in [("../../escaped", "pwn"), ("users", "../x"), ("users/a", "id"), ("", "id")] {
            assert_eq!(validate_field_ref(entity, field).unwrap_err().code(), "INVALID_SCHEMA");
        }
    }

    #[test]
    fn test_first_version_is_initial() {
        let mut model = SchemaModel::new();
        let v1 = model.propose("users", users_v1(), None, Utc::now()).unwrap();
        assert_eq!(v1.id, VersionId::initial());
        assert!(v1.predecessor.is_none());
    }

    #[test]
    fn test_propose_links_predecessor_and_never_mutates() {
        let mut model = SchemaModel::new();
        let v1 = model.propose("users", users_v1(), None, Utc::now()).unwrap();
        let mut fields = users_v1();
        fields.push(FieldDef::new("email", FieldType::String).nullable());
        let v2 = model.propose("users", fields, Some(&v1.id), Utc::now()).unwrap();

        assert_eq!(v2.id.to_string(), "v1.1.0");
        assert_eq!(v2.predecessor.as_ref(), Some(&v1.id));
        let reread = model.resolve("users", &VersionSelector::Exact(v1.id.clone())).unwrap();
        assert_eq!(reread.fields.len(), 2);
    }

    #[test]
    fn test_duplicate_field_names_rejected() {
        let mut model = SchemaModel::new();
        let mut fields = users_v1();
        fields.push(FieldDef::new("id", FieldType::Int32).nullable());
        let err = model.propose("users", fields, None, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
    }

    #[test]
    fn test_required_field_without_default_rejected() {
        let mut model = SchemaModel::new();
        let fields = vec![FieldDef::new("id", FieldType::Int64)];
        let err = model.propose("users", fields, None, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
    }

    #[test]
    fn test_nullable_wrapper_counts_as_nullable() {
        let mut model = SchemaModel::new();
        let fields = vec![FieldDef::new("nickname", FieldType::nullable(FieldType::String))];
        assert!(model.propose("users", fields, None, Utc::now()).is_ok());
    }

    #[test]
    fn test_unknown_predecessor_not_found() {
        let mut model = SchemaModel::new();
        let missing = VersionId::parse("4.0.0").unwrap();
        let err = model
            .propose("users", users_v1(), Some(&missing), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_latest_requires_published_version() {
        let mut model = SchemaModel::new();
        let v1 = model.propose("users", users_v1(), None, Utc::now()).unwrap();
        assert!(model.resolve("users", &VersionSelector::Latest).is_err());
        model.set_current("users", &v1.id).unwrap();
        assert_eq!(model.resolve("users", &VersionSelector::Latest).unwrap().id, v1.id);
        assert_eq!(
            model.resolve("orders", &VersionSelector::Latest).unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn test_lineage_and_descendants() {
        let mut model = SchemaModel::new();
        let v1 = model.propose("users", users_v1(), None, Utc::now()).unwrap();
        let v2 = model.propose("users", users_v1(), Some(&v1.id), Utc::now()).unwrap();
        let v3 = model.propose("users", users_v1(), Some(&v2.id), Utc::now()).unwrap();
        let branch = model.propose("users", users_v1(), Some(&v1.id), Utc::now()).unwrap();

        let chain = model.lineage("users", &v3.id).unwrap();
        assert_eq!(chain, vec![v1.id.clone(), v2.id.clone(), v3.id.clone()]);

        let below = model.descendants("users", &v1.id).unwrap();
        assert_eq!(below, vec![v2.id.clone(), v3.id.clone(), branch.id.clone()]);
    }

    #[test]
    fn test_restore_rejects_conflicting_content() {
        let mut model = SchemaModel::new();
        let v1 = model.propose("users", users_v1(), None, Utc::now()).unwrap();
        let mut tampered = (*v1).clone();
        tampered.fields.pop();
        tampered.fingerprint = crate::checksum::Checksum::of_fields(&tampered.fields);
        assert!(model.restore(tampered).is_err());
        assert!(model.restore((*v1).clone()).is_ok());
    }
}
