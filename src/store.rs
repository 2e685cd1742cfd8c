//! Persisted state
//!
//! Everything the registry owns is written through a [`StateStore`] so that it
//! can be rebuilt after a restart. Versions are write-once; deprecation
//! records and plans are rewritten only on explicit state-machine
//! transitions.
//!
//! On-disk layout of [`FsStore`]:
//!
//! ```text
//! versions/<entity>/v<semver>.json
//! heads/<entity>.json
//! modes/<entity>.json
//! deprecations/<entity>/<field>.json
//! plans/<id>.json
//! usage/<entity>/<field>.jsonl
//! archive/deprecations/<entity>/<field>@<removed_at>.json
//! ```
//!
//! Usage samples are appended to line-delimited files and are not committed
//! to git.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{Commit, Repository, Signature};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use walkdir::WalkDir;

use crate::compatibility::CompatibilityMode;
use crate::deprecation::DeprecationRecord;
use crate::error::{EvolutionError, Result};
use crate::migration::{MigrationPlan, PlanId};
use crate::schema::FieldRef;
use crate::version::{SchemaVersion, VersionId};

/// Everything a store holds, as loaded at startup
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub versions: Vec<SchemaVersion>,
    pub heads: BTreeMap<String, VersionId>,
    pub modes: BTreeMap<String, CompatibilityMode>,
    pub records: Vec<DeprecationRecord>,
    pub plans: Vec<MigrationPlan>,
    pub accesses: Vec<(FieldRef, DateTime<Utc>)>,
}

/// Durable backing for registry state
pub trait StateStore: Send + Sync {
    /// Persist a version; rewriting an id with different content fails
    fn save_version(&self, version: &SchemaVersion) -> Result<()>;

    /// Record which version is current for an entity
    fn save_head(&self, entity: &str, id: &VersionId) -> Result<()>;

    fn save_mode(&self, entity: &str, mode: CompatibilityMode) -> Result<()>;

    fn save_record(&self, record: &DeprecationRecord) -> Result<()>;

    /// Move a record out of the live set
    fn archive_record(&self, record: &DeprecationRecord) -> Result<()>;

    fn save_plan(&self, plan: &MigrationPlan) -> Result<()>;

    /// Append one ingested access
    fn record_access(&self, key: &FieldRef, at: DateTime<Utc>) -> Result<()>;

    /// Drop accesses older than `cutoff`
    fn prune_accesses(&self, cutoff: DateTime<Utc>) -> Result<()>;

    fn load(&self) -> Result<Snapshot>;
}

fn immutability_violation(version: &SchemaVersion) -> EvolutionError {
    EvolutionError::InvalidTransition(format!(
        "version {} is immutable and already stored with different content",
        version.key()
    ))
}

#[derive(Debug, Default)]
struct MemoryState {
    versions: BTreeMap<(String, VersionId), SchemaVersion>,
    heads: BTreeMap<String, VersionId>,
    modes: BTreeMap<String, CompatibilityMode>,
    records: BTreeMap<FieldRef, DeprecationRecord>,
    archived: Vec<DeprecationRecord>,
    plans: BTreeMap<PlanId, MigrationPlan>,
    accesses: BTreeSet<(FieldRef, DateTime<Utc>)>,
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records moved out by retention
    pub fn archived(&self) -> Vec<DeprecationRecord> {
        self.state.lock().archived.clone()
    }
}

impl StateStore for MemoryStore {
    fn save_version(&self, version: &SchemaVersion) -> Result<()> {
        let mut state = self.state.lock();
        let key = (version.entity.clone(), version.id.clone());
        if let Some(existing) = state.versions.get(&key) {
            if existing.fingerprint != version.fingerprint {
                return Err(immutability_violation(version));
            }
            return Ok(());
        }
        state.versions.insert(key, version.clone());
        Ok(())
    }

    fn save_head(&self, entity: &str, id: &VersionId) -> Result<()> {
        self.state.lock().heads.insert(entity.to_string(), id.clone());
        Ok(())
    }

    fn save_mode(&self, entity: &str, mode: CompatibilityMode) -> Result<()> {
        self.state.lock().modes.insert(entity.to_string(), mode);
        Ok(())
    }

    fn save_record(&self, record: &DeprecationRecord) -> Result<()> {
        self.state.lock().records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn archive_record(&self, record: &DeprecationRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.records.remove(&record.key);
        state.archived.push(record.clone());
        Ok(())
    }

    fn save_plan(&self, plan: &MigrationPlan) -> Result<()> {
        self.state.lock().plans.insert(plan.id, plan.clone());
        Ok(())
    }

    fn record_access(&self, key: &FieldRef, at: DateTime<Utc>) -> Result<()> {
        self.state.lock().accesses.insert((key.clone(), at));
        Ok(())
    }

    fn prune_accesses(&self, cutoff: DateTime<Utc>) -> Result<()> {
        self.state.lock().accesses.retain(|(_, at)| *at >= cutoff);
        Ok(())
    }

    fn load(&self) -> Result<Snapshot> {
        let state = self.state.lock();
        Ok(Snapshot {
            versions: state.versions.values().cloned().collect(),
            heads: state.heads.clone(),
            modes: state.modes.clone(),
            records: state.records.values().cloned().collect(),
            plans: state.plans.values().cloned().collect(),
            accesses: state.accesses.iter().cloned().collect(),
        })
    }
}

/// JSON files under a root directory, optionally committed to git
pub struct FsStore {
    root: PathBuf,
    repo: Option<Mutex<Repository>>,
    author: String,
}

impl std::fmt::Debug for FsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStore")
            .field("root", &self.root)
            .field("git", &self.repo.is_some())
            .finish()
    }
}

impl FsStore {
    /// Open (or create) a store rooted at `path`
    pub fn open(path: impl AsRef<Path>, git_commits: bool, author: Option<&str>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        for dir in ["versions", "heads", "modes", "deprecations", "plans", "usage", "archive"] {
            fs::create_dir_all(root.join(dir))?;
        }

        let repo = if git_commits {
            let repo = match Repository::open(&root) {
                Ok(repo) => repo,
                Err(_) => Repository::init(&root)?,
            };
            let ignore = root.join(".gitignore");
            if !ignore.exists() {
                fs::write(&ignore, "usage/\n")?;
            }
            Some(Mutex::new(repo))
        } else {
            None
        };

        Ok(Self {
            root,
            repo,
            author: author.unwrap_or("Schema Evolution").to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_path(&self, entity: &str, id: &VersionId) -> PathBuf {
        self.root
            .join("versions")
            .join(entity)
            .join(format!("{}.json", id))
    }

    fn record_path(&self, key: &FieldRef) -> PathBuf {
        self.root
            .join("deprecations")
            .join(&key.entity)
            .join(format!("{}.json", key.field))
    }

    fn usage_path(&self, key: &FieldRef) -> PathBuf {
        self.root
            .join("usage")
            .join(&key.entity)
            .join(format!("{}.jsonl", key.field))
    }

    fn read_usage(&self) -> Result<Vec<(FieldRef, DateTime<Utc>)>> {
        let mut accesses = Vec::new();
        for entry in WalkDir::new(self.root.join("usage")).min_depth(2).max_depth(2).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                EvolutionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map(|e| e != "jsonl").unwrap_or(true) {
                continue;
            }
            let entity = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str());
            let field = path.file_stem().and_then(|s| s.to_str());
            let (Some(entity), Some(field)) = (entity, field) else {
                continue;
            };
            let key = FieldRef::new(entity, field);
            for line in BufReader::new(fs::File::open(path)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                accesses.push((key.clone(), serde_json::from_str(&line)?));
            }
        }
        Ok(accesses)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T, summary: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content)?;
        self.git_commit(summary)
    }

    fn git_commit(&self, summary: &str) -> Result<()> {
        let Some(repo) = &self.repo else {
            return Ok(());
        };
        let repo = repo.lock();

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let oid = index.write_tree()?;
        let tree = repo.find_tree(oid)?;
        let sig = Signature::now(&self.author, "schemas@evolution.local")?;

        let parent_commit: Option<Commit<'_>> = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&Commit> = parent_commit.iter().collect();

        repo.commit(Some("HEAD"), &sig, &sig, summary, &tree, &parents)?;
        tracing::debug!(summary, "state committed");
        Ok(())
    }

    fn read_dir_json<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let base = self.root.join(dir);
        let mut items = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                EvolutionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let content = fs::read_to_string(path)?;
            items.push(serde_json::from_str(&content)?);
        }
        Ok(items)
    }

    /// Files named after their entity: `heads/<entity>.json`, `modes/<entity>.json`
    fn read_keyed<T: DeserializeOwned>(&self, dir: &str) -> Result<BTreeMap<String, T>> {
        let mut items = BTreeMap::new();
        for entry in WalkDir::new(self.root.join(dir)).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                EvolutionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Some(entity) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = fs::read_to_string(path)?;
            items.insert(entity.to_string(), serde_json::from_str(&content)?);
        }
        Ok(items)
    }
}

impl StateStore for FsStore {
    fn save_version(&self, version: &SchemaVersion) -> Result<()> {
        let path = self.version_path(&version.entity, &version.id);
        if path.exists() {
            let stored: SchemaVersion = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if stored.fingerprint != version.fingerprint {
                return Err(immutability_violation(version));
            }
            return Ok(());
        }
        self.write_json(&path, version, &format!("Add {}", version.key()))
    }

    fn save_head(&self, entity: &str, id: &VersionId) -> Result<()> {
        let path = self.root.join("heads").join(format!("{}.json", entity));
        self.write_json(&path, id, &format!("Publish {}/{}", entity, id))
    }

    fn save_mode(&self, entity: &str, mode: CompatibilityMode) -> Result<()> {
        let path = self.root.join("modes").join(format!("{}.json", entity));
        self.write_json(&path, &mode, &format!("Set {} mode to {}", entity, mode))
    }

    fn save_record(&self, record: &DeprecationRecord) -> Result<()> {
        let path = self.record_path(&record.key);
        self.write_json(&path, record, &format!("{} {}", record.key, record.state))
    }

    fn archive_record(&self, record: &DeprecationRecord) -> Result<()> {
        let live = self.record_path(&record.key);
        let stamp = record
            .removed_at
            .unwrap_or(record.announced_at)
            .format("%Y%m%dT%H%M%SZ");
        let archived = self
            .root
            .join("archive")
            .join("deprecations")
            .join(&record.key.entity)
            .join(format!("{}@{}.json", record.key.field, stamp));
        if live.exists() {
            fs::remove_file(&live)?;
        }
        self.write_json(&archived, record, &format!("Archive {}", record.key))
    }

    fn save_plan(&self, plan: &MigrationPlan) -> Result<()> {
        let path = self.root.join("plans").join(format!("{}.json", plan.id));
        self.write_json(&path, plan, &format!("Plan {} for {} ({:?})", plan.id, plan.entity, plan.status))
    }

    fn record_access(&self, key: &FieldRef, at: DateTime<Utc>) -> Result<()> {
        let path = self.usage_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(&at)?)?;
        Ok(())
    }

    fn prune_accesses(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let mut by_field: BTreeMap<FieldRef, Vec<DateTime<Utc>>> = BTreeMap::new();
        for (key, at) in self.read_usage()? {
            by_field.entry(key).or_default().push(at);
        }
        for (key, samples) in by_field {
            let kept: Vec<String> = samples
                .into_iter()
                .filter(|at| *at >= cutoff)
                .map(|at| serde_json::to_string(&at))
                .collect::<std::result::Result<_, _>>()?;
            let path = self.usage_path(&key);
            if kept.is_empty() {
                fs::remove_file(&path)?;
            } else {
                fs::write(&path, format!("{}\n", kept.join("\n")))?;
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<Snapshot> {
        let versions: Vec<SchemaVersion> = self.read_dir_json("versions")?;
        for version in &versions {
            if !version.verify() {
                return Err(EvolutionError::InvalidTransition(format!(
                    "stored version {} fails its fingerprint check",
                    version.key()
                )));
            }
        }
        let snapshot = Snapshot {
            versions,
            heads: self.read_keyed("heads")?,
            modes: self.read_keyed("modes")?,
            records: self.read_dir_json("deprecations")?,
            plans: self.read_dir_json("plans")?,
            accesses: self.read_usage()?,
        };
        tracing::info!(
            root = %self.root.display(),
            versions = snapshot.versions.len(),
            records = snapshot.records.len(),
            plans = snapshot.plans.len(),
            "state loaded"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn version(fields: Vec<FieldDef>) -> SchemaVersion {
        SchemaVersion::new(VersionId::initial(), "users", fields, None, Utc::now())
    }

    #[test]
    fn test_create_store() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path(), false, None).unwrap();
        assert!(store.root().join("versions").is_dir());
        assert!(store.load().unwrap().versions.is_empty());
    }

    #[test]
    fn test_version_round_trip() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path(), false, None).unwrap();
        let v1 = version(vec![FieldDef::new("id", FieldType::Int64).nullable()]);
        store.save_version(&v1).unwrap();
        store.save_head("users", &v1.id).unwrap();
        store.save_mode("users", CompatibilityMode::Full).unwrap();

        let snapshot = FsStore::open(dir.path(), false, None).unwrap().load().unwrap();
        assert_eq!(snapshot.versions.len(), 1);
        assert_eq!(snapshot.versions[0].fingerprint, v1.fingerprint);
        assert_eq!(snapshot.heads.get("users"), Some(&v1.id));
        assert_eq!(snapshot.modes.get("users"), Some(&CompatibilityMode::Full));
    }

    #[test]
    fn test_immutability() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path(), false, None).unwrap();
        let v1 = version(vec![FieldDef::new("id", FieldType::Int64).nullable()]);
        store.save_version(&v1).unwrap();
        store.save_version(&v1).unwrap();

        let altered = version(vec![FieldDef::new("id", FieldType::String).nullable()]);
        let err = store.save_version(&altered).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        let memory = MemoryStore::new();
        memory.save_version(&v1).unwrap();
        assert!(memory.save_version(&altered).is_err());
    }

    #[test]
    fn test_git_commits() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path(), true, Some("tester")).unwrap();
        let v1 = version(vec![FieldDef::new("id", FieldType::Int64).nullable()]);
        store.save_version(&v1).unwrap();
        store.save_mode("users", CompatibilityMode::Backward).unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.author().name(), Some("tester"));
        assert_eq!(head.parent_count(), 1);
    }

    #[test]
    fn test_usage_round_trip_and_prune() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path(), false, None).unwrap();
        let key = FieldRef::new("users", "phone_number");
        let now = Utc::now();
        store.record_access(&key, now - chrono::Duration::days(40)).unwrap();
        store.record_access(&key, now).unwrap();
        assert_eq!(store.load().unwrap().accesses.len(), 2);

        store.prune_accesses(now - chrono::Duration::days(30)).unwrap();
        let accesses = store.load().unwrap().accesses;
        assert_eq!(accesses, vec![(key, now)]);
    }
}
