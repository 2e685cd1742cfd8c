//! Schema Registry
//!
//! Coordination façade over the schema model, compatibility checker,
//! deprecation tracker, usage monitor and migration orchestrator. Every
//! request against one entity runs inside that entity's exclusive section so
//! that checks and publishes on the same entity never interleave; requests on
//! different entities proceed in parallel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::compatibility::{ChangeKind, CompatibilityChecker, CompatibilityMode, Verdict};
use crate::config::EvolutionConfig;
use crate::deprecation::{DeprecationRecord, LifecyclePolicy, LifecycleTracker};
use crate::error::{EvolutionError, Result};
use crate::events::{EventKind, EventSink, LifecycleEvent, TracingSink};
use crate::migration::{MigrationOrchestrator, MigrationPlan, PlanId, ProposedChange, StepId, StepResult};
use crate::model::{validate_entity_name, validate_field_ref, SchemaModel};
use crate::schema::{FieldDef, FieldRef};
use crate::store::{MemoryStore, StateStore};
use crate::sweep::SweepReport;
use crate::usage::UsageMonitor;
use crate::version::{SchemaVersion, VersionId, VersionSelector};

/// Result of a successful publish
#[derive(Debug, Clone)]
pub struct Published {
    pub version: Arc<SchemaVersion>,
    /// Absent for the first version of an entity
    pub verdict: Option<Verdict>,
}

/// A non-terminal deprecation with its remaining time
#[derive(Debug, Clone, Serialize)]
pub struct DeprecationStatus {
    pub record: DeprecationRecord,
    /// Negative once the deadline has passed
    pub remaining_secs: i64,
}

impl DeprecationStatus {
    pub fn remaining(&self) -> Duration {
        Duration::seconds(self.remaining_secs)
    }
}

/// Everything known about one entity
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub entity: String,
    pub mode: CompatibilityMode,
    pub current: Option<VersionId>,
    pub versions: Vec<VersionId>,
    pub deprecations: Vec<DeprecationRecord>,
    pub plans: Vec<MigrationPlan>,
}

/// The main schema registry
pub struct SchemaRegistry {
    model: RwLock<SchemaModel>,
    modes: DashMap<String, CompatibilityMode>,
    default_mode: CompatibilityMode,
    entity_locks: DashMap<String, Arc<Mutex<()>>>,
    tracker: RwLock<LifecycleTracker>,
    usage: UsageMonitor,
    orchestrator: Mutex<MigrationOrchestrator>,
    checker: CompatibilityChecker,
    policy: LifecyclePolicy,
    author: Option<String>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    sweep_guard: Mutex<()>,
    sweeps: AtomicU64,
}

impl SchemaRegistry {
    /// Open a registry, rebuilding in-memory state from `store`
    pub fn open(
        config: &EvolutionConfig,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let snapshot = store.load()?;

        let mut model = SchemaModel::new();
        for version in snapshot.versions {
            model.restore(version)?;
        }
        for (entity, id) in &snapshot.heads {
            model.set_current(entity, id)?;
        }

        let mut tracker = LifecycleTracker::new();
        for record in snapshot.records {
            tracker.restore(record);
        }

        let mut orchestrator = MigrationOrchestrator::new();
        for plan in snapshot.plans {
            orchestrator.restore(plan);
        }

        let usage = UsageMonitor::new();
        for (key, at) in &snapshot.accesses {
            usage.record_access(key, *at);
        }

        Ok(Self {
            model: RwLock::new(model),
            modes: snapshot.modes.into_iter().collect(),
            default_mode: config.registry.default_mode,
            entity_locks: DashMap::new(),
            tracker: RwLock::new(tracker),
            usage,
            orchestrator: Mutex::new(orchestrator),
            checker: CompatibilityChecker::new(),
            policy: config.lifecycle_policy(),
            author: config.registry.default_author.clone(),
            sink,
            clock,
            store,
            sweep_guard: Mutex::new(()),
            sweeps: AtomicU64::new(0),
        })
    }

    /// Registry backed by memory, logging events, on the wall clock
    pub fn in_memory(config: &EvolutionConfig) -> Result<Self> {
        Self::open(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(TracingSink),
            Arc::new(SystemClock),
        )
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn entity_lock(&self, entity: &str) -> Arc<Mutex<()>> {
        self.entity_locks
            .entry(entity.to_string())
            .or_default()
            .clone()
    }

    fn emit(&self, event: &LifecycleEvent) {
        self.sink.emit(event);
    }

    fn actor<'a>(&'a self, actor: Option<&'a str>) -> Option<&'a str> {
        actor.or(self.author.as_deref())
    }

    // ---------------------------------------------------------------------
    // Schema versions
    // ---------------------------------------------------------------------

    /// Allocate a new (unpublished) version derived from the current one
    pub fn propose(&self, entity: &str, fields: Vec<FieldDef>) -> Result<Arc<SchemaVersion>> {
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();
        self.propose_locked(entity, fields)
    }

    fn propose_locked(&self, entity: &str, fields: Vec<FieldDef>) -> Result<Arc<SchemaVersion>> {
        let now = self.clock.now();
        let version = {
            let mut model = self.model.write();
            let predecessor = model
                .current(entity)
                .map(|v| v.id.clone())
                .or_else(|| model.versions(entity).last().map(|v| v.id.clone()));
            model.propose(entity, fields, predecessor.as_ref(), now)?
        };
        self.store.save_version(&version)?;
        tracing::debug!(version = %version.key(), "version proposed");
        Ok(version)
    }

    /// Propose a version and make it current if the entity's mode allows it
    ///
    /// A rejection fails with `INCOMPATIBLE_CHANGE` carrying the full verdict.
    /// Publishing a schema that drops a field already READY_FOR_REMOVAL
    /// completes that field's deprecation.
    pub fn publish(&self, entity: &str, fields: Vec<FieldDef>) -> Result<Published> {
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        let previous = self.model.read().current(entity);
        let version = self.propose_locked(entity, fields)?;
        let now = self.clock.now();

        let verdict = match &previous {
            None => None,
            Some(old) => {
                let mode = self.get_mode(entity);
                let cleared = self.tracker.read().cleared_fields(entity);
                let verdict = self.checker.check(old, &version, mode, &cleared);
                if !verdict.allowed {
                    tracing::warn!(
                        entity,
                        version = %version.id,
                        violations = verdict.violations.len(),
                        "publish rejected: {}",
                        verdict.summary()
                    );
                    return Err(EvolutionError::IncompatibleChange {
                        entity: entity.to_string(),
                        verdict: Box::new(verdict),
                    });
                }
                if verdict.policy_exception {
                    self.emit(&LifecycleEvent::new(
                        EventKind::PolicyException,
                        entity,
                        None,
                        now,
                        format!("{} published under NONE: {}", version.key(), verdict.summary()),
                    ));
                }
                Some(verdict)
            }
        };

        if let Some(verdict) = &verdict {
            self.retire_readded_fields(entity, verdict)?;
        }
        self.model.write().set_current(entity, &version.id)?;
        self.store.save_head(entity, &version.id)?;
        tracing::info!(
            version = %version.key(),
            breaking = verdict.as_ref().map(Verdict::is_breaking).unwrap_or(false),
            "version published"
        );

        if let Some(verdict) = &verdict {
            self.complete_dropped_fields(entity, verdict, now)?;
        }

        Ok(Published { version, verdict })
    }

    fn complete_dropped_fields(&self, entity: &str, verdict: &Verdict, now: DateTime<Utc>) -> Result<()> {
        let mut tracker = self.tracker.write();
        for change in verdict.changes.iter().filter(|c| c.kind == ChangeKind::Removed) {
            let key = FieldRef::new(entity, change.field.clone());
            let cleared = tracker.get(&key).map(|r| r.is_cleared()).unwrap_or(false);
            if !cleared {
                continue;
            }
            if let Some(event) = tracker.contract_executed(&key, now)? {
                if let Some(record) = tracker.get(&key) {
                    self.store.save_record(record)?;
                }
                self.emit(&event);
            }
        }
        Ok(())
    }

    /// A field that comes back after its removal starts a fresh lifecycle
    fn retire_readded_fields(&self, entity: &str, verdict: &Verdict) -> Result<()> {
        let mut tracker = self.tracker.write();
        for change in verdict.changes.iter().filter(|c| c.kind == ChangeKind::Added) {
            let key = FieldRef::new(entity, change.field.clone());
            let Some(record) = tracker.retire(&key) else { continue };
            if let Err(e) = self.store.archive_record(&record) {
                tracker.restore(record);
                return Err(e);
            }
            tracing::info!(field = %key, "removed field re-added; deprecation record archived");
        }
        Ok(())
    }

    /// Compare two stored versions under the entity's current mode
    pub fn check_compatibility(
        &self,
        entity: &str,
        old: &VersionSelector,
        new: &VersionSelector,
    ) -> Result<Verdict> {
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        let (old, new) = {
            let model = self.model.read();
            (model.resolve(entity, old)?, model.resolve(entity, new)?)
        };
        let cleared = self.tracker.read().cleared_fields(entity);
        Ok(self.checker.check(&old, &new, self.get_mode(entity), &cleared))
    }

    pub fn resolve(&self, entity: &str, selector: &VersionSelector) -> Result<Arc<SchemaVersion>> {
        self.model.read().resolve(entity, selector)
    }

    pub fn versions(&self, entity: &str) -> Vec<Arc<SchemaVersion>> {
        self.model.read().versions(entity)
    }

    pub fn entities(&self) -> Vec<String> {
        self.model.read().entities()
    }

    pub fn lineage(&self, entity: &str, id: &VersionId) -> Result<Vec<VersionId>> {
        self.model.read().lineage(entity, id)
    }

    pub fn descendants(&self, entity: &str, id: &VersionId) -> Result<Vec<VersionId>> {
        self.model.read().descendants(entity, id)
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    pub fn get_mode(&self, entity: &str) -> CompatibilityMode {
        self.modes
            .get(entity)
            .map(|m| *m.value())
            .unwrap_or(self.default_mode)
    }

    pub fn set_mode(&self, entity: &str, mode: CompatibilityMode) -> Result<()> {
        validate_entity_name(entity)?;
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        self.store.save_mode(entity, mode)?;
        let previous = self.modes.insert(entity.to_string(), mode);
        tracing::info!(
            entity,
            from = %previous.unwrap_or(self.default_mode),
            to = %mode,
            "compatibility mode changed"
        );
        Ok(())
    }

    /// All non-terminal deprecations with time remaining, soonest first
    pub fn list_deprecations(&self) -> Vec<DeprecationStatus> {
        let now = self.clock.now();
        let mut listed: Vec<_> = self
            .tracker
            .read()
            .records()
            .filter(|r| !r.is_terminal())
            .map(|r| DeprecationStatus {
                record: r.clone(),
                remaining_secs: r.time_to_deadline(now).num_seconds(),
            })
            .collect();
        listed.sort_by_key(|s| s.record.deadline);
        listed
    }

    /// Replace the deadline of an ANNOUNCED deprecation (audited)
    pub fn force_extend(
        &self,
        entity: &str,
        field: &str,
        new_deadline: DateTime<Utc>,
        actor: Option<&str>,
    ) -> Result<DeprecationRecord> {
        validate_field_ref(entity, field)?;
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        let key = FieldRef::new(entity, field);
        let record = self.tracker.write().force_extend(
            &key,
            new_deadline,
            self.actor(actor),
            self.clock.now(),
        )?;
        self.store.save_record(&record)?;
        tracing::info!(field = %key, deadline = %new_deadline, actor = ?self.actor(actor), "deadline extended");
        Ok(record)
    }

    // ---------------------------------------------------------------------
    // Deprecation lifecycle
    // ---------------------------------------------------------------------

    /// Announce deprecation of a field of the current version
    ///
    /// Without an explicit deadline the configured overlap period applies.
    pub fn deprecate(
        &self,
        entity: &str,
        field: &str,
        deadline: Option<DateTime<Utc>>,
        replacement: Option<String>,
        actor: Option<&str>,
    ) -> Result<DeprecationRecord> {
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        let current = self
            .model
            .read()
            .current(entity)
            .ok_or_else(|| EvolutionError::not_found("published version", entity))?;
        if !current.has_field(field) {
            return Err(EvolutionError::not_found("field", format!("{}.{}", entity, field)));
        }

        let now = self.clock.now();
        let deadline = deadline.unwrap_or(now + self.policy.overlap_period);
        let (record, event) = self.tracker.write().deprecate(
            FieldRef::new(entity, field),
            deadline,
            replacement,
            self.actor(actor),
            now,
        )?;
        self.store.save_record(&record)?;
        self.emit(&event);
        Ok(record)
    }

    pub fn deprecation(&self, entity: &str, field: &str) -> Option<DeprecationRecord> {
        validate_field_ref(entity, field).ok()?;
        self.tracker.read().get(&FieldRef::new(entity, field)).cloned()
    }

    /// Ingest one access observation
    ///
    /// Returns `false` for a duplicate delivery, which changes nothing. The
    /// sample is persisted before it counts, so a delivery that failed to
    /// persist can be retried.
    pub fn record_access(&self, entity: &str, field: &str, at: DateTime<Utc>) -> Result<bool> {
        validate_field_ref(entity, field)?;
        let key = FieldRef::new(entity, field);
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        if self.usage.contains(&key, at) {
            tracing::debug!(field = %key, %at, "duplicate access delivery ignored");
            return Ok(false);
        }
        self.store.record_access(&key, at)?;
        self.usage.record_access(&key, at);

        let mut tracker = self.tracker.write();
        let event = tracker.observe_access(&key, at, &self.usage, &self.policy, self.clock.now());
        if let Some(record) = tracker.get(&key) {
            self.store.save_record(record)?;
        }
        drop(tracker);
        if let Some(event) = event {
            self.emit(&event);
        }
        Ok(true)
    }

    /// Whether trailing-window usage of a field is within `threshold`
    pub fn is_below_threshold(&self, entity: &str, field: &str, window: Duration, threshold: usize) -> bool {
        self.usage
            .is_below_threshold(&FieldRef::new(entity, field), window, threshold, self.clock.now())
    }

    /// Run one deadline sweep
    ///
    /// Returns `None` when another sweep is already running. A failure on one
    /// record is logged and retried on the next tick; it never stops the
    /// sweep of other records.
    pub fn sweep_tick(&self) -> Option<SweepReport> {
        let Some(_sweep) = self.sweep_guard.try_lock() else {
            tracing::debug!("sweep already running; tick skipped");
            return None;
        };
        let now = self.clock.now();
        let mut report = SweepReport {
            at: Some(now),
            ..SweepReport::default()
        };

        let announced = self.tracker.read().announced();
        for key in announced {
            let lock = self.entity_lock(&key.entity);
            let _guard = lock.lock();

            report.evaluated += 1;
            let mut tracker = self.tracker.write();
            let event = match tracker.evaluate(&key, &self.usage, &self.policy, now) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(field = %key, error = %e, "sweep evaluation failed");
                    report.failures += 1;
                    continue;
                }
            };
            let Some(event) = event else { continue };

            if let Some(record) = tracker.get(&key) {
                if let Err(e) = self.store.save_record(record) {
                    tracing::warn!(field = %key, error = %e, "failed to persist sweep transition");
                    report.failures += 1;
                }
            }
            drop(tracker);

            match event.kind {
                EventKind::DeadlineApproaching => report.approaching += 1,
                EventKind::ReadyForRemoval => report.ready += 1,
                EventKind::Escalation => report.escalated += 1,
                _ => {}
            }
            self.emit(&event);
        }

        let cutoff = now - self.policy.usage_window;
        report.pruned = self.usage.prune_before(cutoff);
        if let Err(e) = self.store.prune_accesses(cutoff) {
            tracing::warn!(error = %e, "failed to prune stored usage");
            report.failures += 1;
        }

        let expired = self.tracker.write().purge_removed(self.policy.retention, now);
        for record in &expired {
            match self.store.archive_record(record) {
                Ok(()) => report.archived += 1,
                Err(e) => {
                    tracing::warn!(field = %record.key, error = %e, "failed to archive record");
                    report.failures += 1;
                    self.tracker.write().restore(record.clone());
                }
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        Some(report)
    }

    /// Completed sweep ticks since the registry was opened
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // Migrations
    // ---------------------------------------------------------------------

    /// Build an expand / migrate / contract plan for a change to the current version
    pub fn plan_migration(&self, entity: &str, change: ProposedChange) -> Result<MigrationPlan> {
        let lock = self.entity_lock(entity);
        let _guard = lock.lock();

        let current = self
            .model
            .read()
            .current(entity)
            .ok_or_else(|| EvolutionError::not_found("published version", entity))?;
        let retired = change.retired_field().map(|f| FieldRef::new(entity, f));
        let plan = self.orchestrator.lock().plan(change, &current, self.clock.now())?;
        self.store.save_plan(&plan)?;

        if let Some(key) = retired {
            let mut tracker = self.tracker.write();
            let live = tracker.get(&key).map(|r| !r.is_terminal()).unwrap_or(false);
            if live {
                tracker.attach_plan(&key, plan.id)?;
                if let Some(record) = tracker.get(&key) {
                    self.store.save_record(record)?;
                }
            }
        }

        tracing::info!(plan = plan.id, entity, steps = plan.steps.len(), "migration planned");
        Ok(plan)
    }

    /// Apply an executor report and return the plan's current state
    ///
    /// CONTRACT steps are gated on the retired field being READY_FOR_REMOVAL;
    /// a blocked gate emits GATE_BLOCKED and leaves the plan untouched.
    pub fn advance_migration(&self, plan_id: PlanId, step_id: StepId, result: StepResult) -> Result<MigrationPlan> {
        let entity = self
            .orchestrator
            .lock()
            .get(plan_id)
            .map(|p| p.entity.clone())
            .ok_or_else(|| EvolutionError::not_found("plan", plan_id.to_string()))?;
        let lock = self.entity_lock(&entity);
        let _guard = lock.lock();

        let now = self.clock.now();
        let outcome = {
            let tracker = self.tracker.read();
            self.orchestrator
                .lock()
                .advance(plan_id, step_id, result, |key| tracker.removal_gate(key, now), now)
        };

        let advance = match outcome {
            Ok(advance) => advance,
            Err(err) => {
                if let EvolutionError::GateBlocked { entity, field, reason } = &err {
                    self.emit(&LifecycleEvent::new(
                        EventKind::GateBlocked,
                        entity,
                        Some(field.as_str()),
                        now,
                        format!("plan {} step {}: {}", plan_id, step_id, reason),
                    ));
                }
                return Err(err);
            }
        };

        if advance.changed {
            self.store.save_plan(&advance.plan)?;
            tracing::info!(plan = plan_id, step = step_id, status = ?advance.plan.status, "migration advanced");
        }

        if let Some(key) = &advance.removed {
            let mut tracker = self.tracker.write();
            if let Some(event) = tracker.contract_executed(key, now)? {
                if let Some(record) = tracker.get(key) {
                    self.store.save_record(record)?;
                }
                drop(tracker);
                self.emit(&event);
            }
        }

        Ok(advance.plan)
    }

    /// Cancel a plan that has not yet contracted
    pub fn cancel_migration(&self, plan_id: PlanId) -> Result<MigrationPlan> {
        let entity = self
            .orchestrator
            .lock()
            .get(plan_id)
            .map(|p| p.entity.clone())
            .ok_or_else(|| EvolutionError::not_found("plan", plan_id.to_string()))?;
        let lock = self.entity_lock(&entity);
        let _guard = lock.lock();

        let plan = self.orchestrator.lock().cancel(plan_id, self.clock.now())?;
        self.store.save_plan(&plan)?;
        tracing::info!(plan = plan_id, "migration cancelled");
        Ok(plan)
    }

    pub fn plan(&self, plan_id: PlanId) -> Option<MigrationPlan> {
        self.orchestrator.lock().get(plan_id).cloned()
    }

    pub fn plans(&self, entity: &str) -> Vec<MigrationPlan> {
        self.orchestrator
            .lock()
            .plans_for(entity)
            .into_iter()
            .cloned()
            .collect()
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    pub fn get_status(&self, entity: &str) -> Result<EntityStatus> {
        let (current, versions) = {
            let model = self.model.read();
            let versions = model.versions(entity);
            if versions.is_empty() {
                return Err(EvolutionError::not_found("entity", entity));
            }
            (
                model.current(entity).map(|v| v.id.clone()),
                versions.iter().map(|v| v.id.clone()).collect(),
            )
        };
        let deprecations = self
            .tracker
            .read()
            .for_entity(entity)
            .into_iter()
            .cloned()
            .collect();

        Ok(EntityStatus {
            entity: entity.to_string(),
            mode: self.get_mode(entity),
            current,
            versions,
            deprecations,
            plans: self.plans(entity),
        })
    }

    /// Overview of every entity
    pub fn overview(&self) -> BTreeMap<String, EntityStatus> {
        self.entities()
            .into_iter()
            .filter_map(|entity| self.get_status(&entity).ok().map(|s| (entity, s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemorySink;
    use crate::schema::FieldType;
    use serde_json::json;

    fn registry() -> (SchemaRegistry, Arc<MemorySink>, Arc<ManualClock>) {
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = SchemaRegistry::open(
            &EvolutionConfig::default(),
            Arc::new(MemoryStore::new()),
            sink.clone(),
            clock.clone(),
        )
        .unwrap();
        (registry, sink, clock)
    }

    fn users_v1() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldType::Int64).with_default(json!(0)),
            FieldDef::new("phone_number", FieldType::String).nullable(),
        ]
    }

    #[test]
    fn test_first_publish_has_no_verdict() {
        let (registry, _, _) = registry();
        let published = registry.publish("users", users_v1()).unwrap();
        assert!(published.verdict.is_none());
        assert_eq!(published.version.id, VersionId::initial());
        assert_eq!(
            registry.resolve("users", &VersionSelector::Latest).unwrap().id,
            VersionId::initial()
        );
    }

    #[test]
    fn test_propose_does_not_publish() {
        let (registry, _, _) = registry();
        registry.publish("users", users_v1()).unwrap();
        let proposed = registry.propose("users", users_v1()).unwrap();
        assert_eq!(proposed.id.to_string(), "v1.1.0");
        assert_eq!(
            registry.resolve("users", &VersionSelector::Latest).unwrap().id,
            VersionId::initial()
        );
    }

    #[test]
    fn test_deprecate_requires_existing_field() {
        let (registry, _, _) = registry();
        registry.publish("users", users_v1()).unwrap();
        let err = registry.deprecate("users", "missing", None, None, None).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = registry.deprecate("orders", "id", None, None, None).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_deprecate_defaults_to_overlap_period() {
        let (registry, sink, clock) = registry();
        registry.publish("users", users_v1()).unwrap();
        let record = registry
            .deprecate("users", "phone_number", None, None, Some("ops"))
            .unwrap();
        assert_eq!(record.deadline, clock.now() + Duration::days(14));
        assert_eq!(sink.kinds(), vec![EventKind::Announced]);

        let err = registry
            .deprecate("users", "phone_number", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_DEPRECATED");
    }

    #[test]
    fn test_mode_none_is_policy_exception() {
        let (registry, sink, _) = registry();
        registry.publish("users", users_v1()).unwrap();
        registry.set_mode("users", CompatibilityMode::None).unwrap();

        let published = registry
            .publish("users", vec![FieldDef::new("id", FieldType::Int64).with_default(json!(0))])
            .unwrap();
        assert!(published.verdict.unwrap().policy_exception);
        assert_eq!(sink.count(EventKind::PolicyException), 1);
    }

    #[test]
    fn test_list_deprecations_sorted_by_deadline() {
        let (registry, _, clock) = registry();
        registry.publish("users", users_v1()).unwrap();
        let now = clock.now();
        registry
            .deprecate("users", "phone_number", Some(now + Duration::days(20)), None, None)
            .unwrap();
        registry
            .deprecate("users", "id", Some(now + Duration::days(2)), None, None)
            .unwrap();

        let listed = registry.list_deprecations();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].record.key.field, "id");
        assert_eq!(listed[0].remaining(), Duration::days(2));
    }

    #[test]
    fn test_overlapping_sweeps_are_rejected() {
        let (registry, _, _) = registry();
        let guard = registry.sweep_guard.lock();
        assert!(registry.sweep_tick().is_none());
        drop(guard);
        assert!(registry.sweep_tick().is_some());
    }

    /// Memory store whose next access write fails
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_access: std::sync::atomic::AtomicBool,
    }

    impl StateStore for FlakyStore {
        fn save_version(&self, version: &SchemaVersion) -> Result<()> {
            self.inner.save_version(version)
        }
        fn save_head(&self, entity: &str, id: &VersionId) -> Result<()> {
            self.inner.save_head(entity, id)
        }
        fn save_mode(&self, entity: &str, mode: CompatibilityMode) -> Result<()> {
            self.inner.save_mode(entity, mode)
        }
        fn save_record(&self, record: &DeprecationRecord) -> Result<()> {
            self.inner.save_record(record)
        }
        fn archive_record(&self, record: &DeprecationRecord) -> Result<()> {
            self.inner.archive_record(record)
        }
        fn save_plan(&self, plan: &MigrationPlan) -> Result<()> {
            self.inner.save_plan(plan)
        }
        fn record_access(&self, key: &FieldRef, at: DateTime<Utc>) -> Result<()> {
            if self.fail_next_access.swap(false, Ordering::SeqCst) {
                return Err(EvolutionError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.record_access(key, at)
        }
        fn prune_accesses(&self, cutoff: DateTime<Utc>) -> Result<()> {
            self.inner.prune_accesses(cutoff)
        }
        fn load(&self) -> Result<crate::store::Snapshot> {
            self.inner.load()
        }
    }

    #[test]
    fn test_failed_access_write_can_be_redelivered() {
        let store = Arc::new(FlakyStore::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = SchemaRegistry::open(
            &EvolutionConfig::default(),
            store.clone(),
            Arc::new(MemorySink::new()),
            clock.clone(),
        )
        .unwrap();
        registry.publish("users", users_v1()).unwrap();

        let at = clock.now();
        store.fail_next_access.store(true, Ordering::SeqCst);
        assert!(registry.record_access("users", "phone_number", at).is_err());
        assert!(registry.is_below_threshold("users", "phone_number", Duration::days(1), 0));

        assert!(registry.record_access("users", "phone_number", at).unwrap());
        assert!(!registry.record_access("users", "phone_number", at).unwrap());
        assert_eq!(store.load().unwrap().accesses.len(), 1);
    }

    #[test]
    fn test_malformed_names_are_rejected() {
        let (registry, _, clock) = registry();
        let err = registry.record_access("../../escaped", "pwn", clock.now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
        let err = registry.set_mode("../modes", CompatibilityMode::None).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
        let err = registry
            .force_extend("users", "a/b", clock.now() + Duration::days(1), None)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
        assert!(registry.deprecation("users", "..").is_none());
    }

    #[test]
    fn test_cancel_waits_for_entity_lock() {
        let (registry, _, _) = registry();
        registry.publish("users", users_v1()).unwrap();
        let plan = registry
            .plan_migration("users", ProposedChange::RemoveField { field: "phone_number".into() })
            .unwrap();

        let lock = registry.entity_lock("users");
        let guard = lock.lock();
        let registry = &registry;
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|s| {
            s.spawn(move || {
                let status = registry.cancel_migration(plan.id).map(|p| p.status).map_err(|e| e.code());
                tx.send(status).unwrap();
            });
            assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());
            drop(guard);
            assert_eq!(rx.recv().unwrap().unwrap(), crate::migration::PlanStatus::Cancelled);
        });
    }

    #[test]
    fn test_status_of_unknown_entity() {
        let (registry, _, _) = registry();
        assert_eq!(registry.get_status("ghost").unwrap_err().code(), "NOT_FOUND");
    }
}
