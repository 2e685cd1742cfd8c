//! Migration Plan Orchestrator
//!
//! Turns a proposed change into an ordered expand / migrate / contract plan
//! and tracks execution reported back by external executors. Plans are plain
//! data (an arena of steps with explicit dependency edges) so they survive
//! restarts; every `advance` re-checks ordering and gates against the stored
//! plan instead of relying on in-process control flow.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EvolutionError, Result};
use crate::schema::{FieldDef, FieldRef};
use crate::version::SchemaVersion;

pub type PlanId = u64;
pub type StepId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Expand,
    Migrate,
    Contract,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Expand => "EXPAND",
            Phase::Migrate => "MIGRATE",
            Phase::Contract => "CONTRACT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Active,
    Completed,
    Cancelled,
}

/// A change a producer wants to make to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ProposedChange {
    AddField { field: FieldDef },
    RemoveField { field: String },
    RenameField { from: String, to: String },
    /// Replace a field with one of a different type
    RetypeField { field: String, replacement: FieldDef },
    /// Replace a field whose meaning (unit) changes
    ChangeUnit { field: String, replacement: FieldDef },
}

impl ProposedChange {
    /// Field whose removal the plan's contract phase performs, if any
    pub fn retired_field(&self) -> Option<&str> {
        match self {
            ProposedChange::AddField { .. } => None,
            ProposedChange::RemoveField { field } => Some(field),
            ProposedChange::RenameField { from, .. } => Some(from),
            ProposedChange::RetypeField { field, .. } | ProposedChange::ChangeUnit { field, .. } => {
                Some(field)
            }
        }
    }

    /// Field the plan introduces, if any
    pub fn introduced_field(&self) -> Option<&str> {
        match self {
            ProposedChange::AddField { field } => Some(&field.name),
            ProposedChange::RemoveField { .. } => None,
            ProposedChange::RenameField { to, .. } => Some(to),
            ProposedChange::RetypeField { replacement, .. }
            | ProposedChange::ChangeUnit { replacement, .. } => Some(&replacement.name),
        }
    }
}

/// Instruction for the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    AddField { field: FieldDef },
    EnableDualWrite { from: String, to: String },
    /// Producers stop writing the field; it must tolerate absence
    StopWrites { field: String },
    /// Populate `target` until `condition` holds for every record
    Backfill {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        condition: String,
    },
    /// Consumers read `to` instead of `from` (or nothing when `to` is absent)
    SwitchReads {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    DropField { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: StepId,
    pub phase: Phase,
    pub action: StepAction,
    pub description: String,
    pub status: StepStatus,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Deprecated field that must be READY_FOR_REMOVAL before this step runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<FieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Executor report for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepResult {
    Started,
    Succeeded {
        #[serde(default)]
        rows: Option<u64>,
    },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: PlanId,
    pub entity: String,
    pub change: ProposedChange,
    pub steps: Vec<MigrationStep>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn step(&self, id: StepId) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn steps_in(&self, phase: Phase) -> Vec<&MigrationStep> {
        self.steps.iter().filter(|s| s.phase == phase).collect()
    }

    /// Whether any CONTRACT step has completed
    pub fn contract_started(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.phase == Phase::Contract && s.status == StepStatus::Done)
    }

    /// Steps whose ordering and dependencies are satisfied and that are not done
    pub fn runnable(&self) -> Vec<StepId> {
        if self.status != PlanStatus::Active {
            return Vec::new();
        }
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Done)
            .filter(|s| self.earlier_phases_done(s.phase) && self.pending_dependencies(s).is_empty())
            .map(|s| s.id)
            .collect()
    }

    /// Step ids in an order compatible with every dependency edge
    pub fn execution_order(&self) -> Result<Vec<StepId>> {
        let mut graph = DiGraph::<StepId, ()>::new();
        let index: HashMap<StepId, _> = self
            .steps
            .iter()
            .map(|s| (s.id, graph.add_node(s.id)))
            .collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                let from = index.get(dep).ok_or_else(|| {
                    EvolutionError::InvalidTransition(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    ))
                })?;
                graph.add_edge(*from, index[&step.id], ());
            }
        }
        let order = toposort(&graph, None).map_err(|cycle| {
            EvolutionError::InvalidTransition(format!(
                "plan {} has a dependency cycle through step {}",
                self.id, graph[cycle.node_id()]
            ))
        })?;
        Ok(order.into_iter().map(|n| graph[n]).collect())
    }

    fn earlier_phases_done(&self, phase: Phase) -> bool {
        self.steps
            .iter()
            .filter(|s| s.phase < phase)
            .all(|s| s.status == StepStatus::Done)
    }

    fn pending_dependencies(&self, step: &MigrationStep) -> Vec<StepId> {
        step.depends_on
            .iter()
            .copied()
            .filter(|dep| self.step(*dep).map(|d| d.status != StepStatus::Done).unwrap_or(true))
            .collect()
    }
}

/// Outcome of an `advance` call
#[derive(Debug, Clone)]
pub struct Advance {
    pub plan: MigrationPlan,
    /// False when the report was a replay of an already applied result
    pub changed: bool,
    /// Set when a gated CONTRACT step just completed
    pub removed: Option<FieldRef>,
}

/// Owns every migration plan
#[derive(Debug, Default)]
pub struct MigrationOrchestrator {
    plans: BTreeMap<PlanId, MigrationPlan>,
    next_id: PlanId,
}

impl MigrationOrchestrator {
    pub fn new() -> Self {
        Self {
            plans: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Build and register the plan for a change against the current version
    pub fn plan(
        &mut self,
        change: ProposedChange,
        current: &SchemaVersion,
        now: DateTime<Utc>,
    ) -> Result<MigrationPlan> {
        let steps = build_steps(&change, current)?;
        let id = self.next_id.max(1);
        let plan = MigrationPlan {
            id,
            entity: current.entity.clone(),
            change,
            steps,
            status: PlanStatus::Active,
            created_at: now,
            updated_at: now,
        };
        plan.execution_order()?;
        self.next_id = id + 1;
        self.plans.insert(id, plan.clone());
        Ok(plan)
    }

    pub fn get(&self, id: PlanId) -> Option<&MigrationPlan> {
        self.plans.get(&id)
    }

    pub fn plans(&self) -> impl Iterator<Item = &MigrationPlan> {
        self.plans.values()
    }

    pub fn plans_for(&self, entity: &str) -> Vec<&MigrationPlan> {
        self.plans.values().filter(|p| p.entity == entity).collect()
    }

    /// Apply an executor report to one step
    ///
    /// `gate` is consulted for CONTRACT steps; a blocked gate fails with
    /// `GATE_BLOCKED` and leaves the plan untouched. Replaying a success for a
    /// step that is already done is a no-op.
    pub fn advance<G>(
        &mut self,
        plan_id: PlanId,
        step_id: StepId,
        result: StepResult,
        gate: G,
        now: DateTime<Utc>,
    ) -> Result<Advance>
    where
        G: Fn(&FieldRef) -> std::result::Result<(), String>,
    {
        let plan = self
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| EvolutionError::not_found("plan", plan_id.to_string()))?;
        let step = plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| EvolutionError::not_found("step", format!("{}/{}", plan_id, step_id)))?;

        match (&step.status, &result) {
            (StepStatus::Done, StepResult::Succeeded { .. })
            | (StepStatus::InProgress, StepResult::Started) => {
                return Ok(Advance {
                    plan: plan.clone(),
                    changed: false,
                    removed: None,
                });
            }
            (StepStatus::Done, _) => {
                return Err(EvolutionError::StepNotReady {
                    plan: plan_id,
                    step: step_id,
                    reason: "step already completed".to_string(),
                });
            }
            _ => {}
        }

        if plan.status == PlanStatus::Cancelled {
            return Err(EvolutionError::StepNotReady {
                plan: plan_id,
                step: step_id,
                reason: "plan was cancelled".to_string(),
            });
        }
        if !plan.earlier_phases_done(step.phase) {
            return Err(EvolutionError::StepNotReady {
                plan: plan_id,
                step: step_id,
                reason: format!("earlier phases must complete before {}", step.phase),
            });
        }
        let pending = plan.pending_dependencies(&step);
        if !pending.is_empty() {
            return Err(EvolutionError::DependencyUnsatisfied {
                plan: plan_id,
                step: step_id,
                pending,
            });
        }
        let attempting = !matches!(result, StepResult::Failed { .. });
        if step.phase == Phase::Contract && attempting {
            if let Some(field) = &step.gate {
                if let Err(reason) = gate(field) {
                    return Err(EvolutionError::GateBlocked {
                        entity: field.entity.clone(),
                        field: field.field.clone(),
                        reason,
                    });
                }
            }
        }

        let target = plan
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| EvolutionError::not_found("step", format!("{}/{}", plan_id, step_id)))?;
        let mut removed = None;
        match result {
            StepResult::Started => target.status = StepStatus::InProgress,
            StepResult::Succeeded { rows } => {
                target.status = StepStatus::Done;
                target.rows_affected = rows;
                target.last_error = None;
                if target.phase == Phase::Contract {
                    removed = target.gate.clone();
                }
            }
            StepResult::Failed { reason } => {
                target.status = StepStatus::Failed;
                target.last_error = Some(reason);
            }
        }
        target.updated_at = Some(now);
        plan.updated_at = now;
        if plan.steps.iter().all(|s| s.status == StepStatus::Done) {
            plan.status = PlanStatus::Completed;
        }

        Ok(Advance {
            plan: plan.clone(),
            changed: true,
            removed,
        })
    }

    /// Cancel a plan; rejected once any CONTRACT step has completed
    pub fn cancel(&mut self, plan_id: PlanId, now: DateTime<Utc>) -> Result<MigrationPlan> {
        let plan = self
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| EvolutionError::not_found("plan", plan_id.to_string()))?;
        if plan.contract_started() {
            return Err(EvolutionError::CancelRejected {
                plan: plan_id,
                reason: "a CONTRACT step already completed; destructive steps cannot be reversed".to_string(),
            });
        }
        if plan.status == PlanStatus::Completed {
            return Err(EvolutionError::CancelRejected {
                plan: plan_id,
                reason: "the plan already completed".to_string(),
            });
        }
        if plan.status != PlanStatus::Cancelled {
            plan.status = PlanStatus::Cancelled;
            plan.updated_at = now;
        }
        Ok(plan.clone())
    }

    /// Re-insert a persisted plan
    pub fn restore(&mut self, plan: MigrationPlan) {
        self.next_id = self.next_id.max(plan.id + 1);
        self.plans.insert(plan.id, plan);
    }
}

fn build_steps(change: &ProposedChange, current: &SchemaVersion) -> Result<Vec<MigrationStep>> {
    let entity = current.entity.as_str();
    let require = |name: &str| {
        current
            .field(name)
            .cloned()
            .ok_or_else(|| EvolutionError::not_found("field", format!("{}.{}", entity, name)))
    };
    let require_absent = |name: &str| {
        if current.has_field(name) {
            Err(EvolutionError::invalid_schema(
                entity,
                format!("field '{}' already exists", name),
            ))
        } else {
            Ok(())
        }
    };

    let mut builder = StepBuilder::default();
    match change {
        ProposedChange::AddField { field } => {
            require_absent(&field.name)?;
            let add = builder.push(
                Phase::Expand,
                StepAction::AddField { field: field.clone() },
                format!("add field '{}' ({})", field.name, field.field_type),
                &[],
                None,
            );
            if let Some(default) = &field.default {
                builder.push(
                    Phase::Migrate,
                    StepAction::Backfill {
                        target: field.name.clone(),
                        source: None,
                        condition: format!("{} IS NOT NULL", field.name),
                    },
                    format!("backfill '{}' with default {}", field.name, default),
                    &[add],
                    None,
                );
            }
        }
        ProposedChange::RemoveField { field } => {
            require(field.as_str())?;
            let gate = FieldRef::new(entity, field.clone());
            let stop = builder.push(
                Phase::Expand,
                StepAction::StopWrites { field: field.clone() },
                format!("producers stop writing '{}'", field),
                &[],
                None,
            );
            let reads = builder.push(
                Phase::Migrate,
                StepAction::SwitchReads { from: field.clone(), to: None },
                format!("consumers stop reading '{}'", field),
                &[stop],
                None,
            );
            builder.push(
                Phase::Contract,
                StepAction::DropField { field: field.clone() },
                format!("drop field '{}'", field),
                &[reads],
                Some(gate),
            );
        }
        ProposedChange::RenameField { from, to } => {
            let old = require(from.as_str())?;
            require_absent(to.as_str())?;
            let mut renamed = old.clone();
            renamed.name = to.clone();
            replace_steps(&mut builder, entity, &old, renamed, "copy");
        }
        ProposedChange::RetypeField { field, replacement }
        | ProposedChange::ChangeUnit { field, replacement } => {
            let old = require(field.as_str())?;
            require_absent(&replacement.name)?;
            let how = if matches!(change, ProposedChange::ChangeUnit { .. }) {
                "convert units of"
            } else {
                "convert"
            };
            replace_steps(&mut builder, entity, &old, replacement.clone(), how);
        }
    }
    Ok(builder.steps)
}

/// Expand / migrate / contract sequence for replacing `old` with `new`
fn replace_steps(builder: &mut StepBuilder, entity: &str, old: &FieldDef, new: FieldDef, how: &str) {
    let (from, to) = (old.name.clone(), new.name.clone());
    let add = builder.push(
        Phase::Expand,
        StepAction::AddField { field: new.clone() },
        format!("add field '{}' ({})", to, new.field_type),
        &[],
        None,
    );
    let dual = builder.push(
        Phase::Expand,
        StepAction::EnableDualWrite { from: from.clone(), to: to.clone() },
        format!("producers write both '{}' and '{}'", from, to),
        &[add],
        None,
    );
    let backfill = builder.push(
        Phase::Migrate,
        StepAction::Backfill {
            target: to.clone(),
            source: Some(from.clone()),
            condition: format!("{} IS NOT NULL OR {} IS NULL", to, from),
        },
        format!("backfill '{}' from '{}' ({})", to, from, how),
        &[dual],
        None,
    );
    let reads = builder.push(
        Phase::Migrate,
        StepAction::SwitchReads { from: from.clone(), to: Some(to.clone()) },
        format!("consumers read '{}' instead of '{}'", to, from),
        &[backfill],
        None,
    );
    builder.push(
        Phase::Contract,
        StepAction::DropField { field: from.clone() },
        format!("drop field '{}'", from),
        &[reads],
        Some(FieldRef::new(entity, from)),
    );
}

#[derive(Default)]
struct StepBuilder {
    steps: Vec<MigrationStep>,
}

impl StepBuilder {
    fn push(
        &mut self,
        phase: Phase,
        action: StepAction,
        description: String,
        depends_on: &[StepId],
        gate: Option<FieldRef>,
    ) -> StepId {
        let id = self.steps.len() as StepId + 1;
        self.steps.push(MigrationStep {
            id,
            phase,
            action,
            description,
            status: StepStatus::Pending,
            depends_on: depends_on.to_vec(),
            gate,
            rows_affected: None,
            last_error: None,
            updated_at: None,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::version::VersionId;
    use serde_json::json;

    fn users() -> SchemaVersion {
        SchemaVersion::new(
            VersionId::initial(),
            "users",
            vec![
                FieldDef::new("id", FieldType::Int64).with_default(json!(0)),
                FieldDef::new("old_name", FieldType::String).nullable(),
            ],
            None,
            Utc::now(),
        )
    }

    fn open(_: &FieldRef) -> std::result::Result<(), String> {
        Ok(())
    }

    fn closed(_: &FieldRef) -> std::result::Result<(), String> {
        Err("deadline not reached".to_string())
    }

    fn rename() -> ProposedChange {
        ProposedChange::RenameField {
            from: "old_name".into(),
            to: "new_name".into(),
        }
    }

    #[test]
    fn test_rename_plan_shape() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();

        let phases: Vec<_> = plan.steps.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![Phase::Expand, Phase::Expand, Phase::Migrate, Phase::Migrate, Phase::Contract]
        );
        assert!(matches!(&plan.steps[0].action, StepAction::AddField { field } if field.name == "new_name"));
        assert!(matches!(
            &plan.steps[2].action,
            StepAction::Backfill { target, source: Some(source), .. } if target == "new_name" && source == "old_name"
        ));
        assert!(matches!(&plan.steps[3].action, StepAction::SwitchReads { .. }));
        assert!(matches!(&plan.steps[4].action, StepAction::DropField { field } if field == "old_name"));
        assert_eq!(plan.steps[4].gate, Some(FieldRef::new("users", "old_name")));
        assert_eq!(plan.execution_order().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rename_to_existing_field_rejected() {
        let mut orchestrator = MigrationOrchestrator::new();
        let change = ProposedChange::RenameField {
            from: "old_name".into(),
            to: "id".into(),
        };
        assert_eq!(
            orchestrator.plan(change, &users(), Utc::now()).unwrap_err().code(),
            "INVALID_SCHEMA"
        );
    }

    #[test]
    fn test_phase_order_enforced() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        let err = orchestrator
            .advance(plan.id, 3, StepResult::Started, open, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "STEP_NOT_READY");
    }

    #[test]
    fn test_dependency_enforced_within_phase() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        let err = orchestrator
            .advance(plan.id, 2, StepResult::Started, open, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "DEPENDENCY_UNSATISFIED");
    }

    fn run_to_contract(orchestrator: &mut MigrationOrchestrator, id: PlanId) {
        for step in 1..=4 {
            orchestrator
                .advance(id, step, StepResult::Succeeded { rows: Some(10) }, open, Utc::now())
                .unwrap();
        }
    }

    #[test]
    fn test_gate_blocked_leaves_plan_unchanged() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        run_to_contract(&mut orchestrator, plan.id);
        let before = orchestrator.get(plan.id).unwrap().clone();

        let err = orchestrator
            .advance(plan.id, 5, StepResult::Succeeded { rows: None }, closed, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "GATE_BLOCKED");
        assert_eq!(orchestrator.get(plan.id).unwrap(), &before);
    }

    #[test]
    fn test_contract_completes_plan_and_reports_removal() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        run_to_contract(&mut orchestrator, plan.id);

        let advance = orchestrator
            .advance(plan.id, 5, StepResult::Succeeded { rows: None }, open, Utc::now())
            .unwrap();
        assert_eq!(advance.plan.status, PlanStatus::Completed);
        assert_eq!(advance.removed, Some(FieldRef::new("users", "old_name")));
    }

    #[test]
    fn test_replayed_success_is_noop() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        let first = orchestrator
            .advance(plan.id, 1, StepResult::Succeeded { rows: Some(3) }, open, Utc::now())
            .unwrap();
        let again = orchestrator
            .advance(plan.id, 1, StepResult::Succeeded { rows: Some(3) }, open, Utc::now())
            .unwrap();
        assert!(first.changed);
        assert!(!again.changed);
        assert_eq!(first.plan, again.plan);
    }

    #[test]
    fn test_failed_step_can_be_retried() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        let failed = orchestrator
            .advance(plan.id, 1, StepResult::Failed { reason: "lock timeout".into() }, open, Utc::now())
            .unwrap();
        assert_eq!(failed.plan.steps[0].status, StepStatus::Failed);
        assert_eq!(failed.plan.steps[0].last_error.as_deref(), Some("lock timeout"));
        assert!(failed.plan.runnable().contains(&1));

        let retried = orchestrator
            .advance(plan.id, 1, StepResult::Succeeded { rows: None }, open, Utc::now())
            .unwrap();
        assert_eq!(retried.plan.steps[0].status, StepStatus::Done);
    }

    #[test]
    fn test_cancel_rules() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        run_to_contract(&mut orchestrator, plan.id);
        let cancelled = orchestrator.cancel(plan.id, Utc::now()).unwrap();
        assert_eq!(cancelled.status, PlanStatus::Cancelled);
        assert_eq!(
            orchestrator
                .advance(plan.id, 5, StepResult::Started, open, Utc::now())
                .unwrap_err()
                .code(),
            "STEP_NOT_READY"
        );

        let second = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();
        run_to_contract(&mut orchestrator, second.id);
        orchestrator
            .advance(second.id, 5, StepResult::Succeeded { rows: None }, open, Utc::now())
            .unwrap();
        assert_eq!(
            orchestrator.cancel(second.id, Utc::now()).unwrap_err().code(),
            "CANCEL_REJECTED"
        );
    }

    #[test]
    fn test_completed_plan_cannot_be_cancelled() {
        let mut orchestrator = MigrationOrchestrator::new();
        let change = ProposedChange::AddField {
            field: FieldDef::new("nickname", FieldType::String).nullable(),
        };
        let plan = orchestrator.plan(change, &users(), Utc::now()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        let done = orchestrator
            .advance(plan.id, 1, StepResult::Succeeded { rows: None }, open, Utc::now())
            .unwrap();
        assert_eq!(done.plan.status, PlanStatus::Completed);

        assert_eq!(
            orchestrator.cancel(plan.id, Utc::now()).unwrap_err().code(),
            "CANCEL_REJECTED"
        );
        assert_eq!(orchestrator.get(plan.id).unwrap().status, PlanStatus::Completed);
    }

    #[test]
    fn test_removal_plan_is_gated() {
        let mut orchestrator = MigrationOrchestrator::new();
        let change = ProposedChange::RemoveField { field: "old_name".into() };
        let plan = orchestrator.plan(change, &users(), Utc::now()).unwrap();
        let contract = plan.steps_in(Phase::Contract);
        assert_eq!(contract.len(), 1);
        assert_eq!(contract[0].gate, Some(FieldRef::new("users", "old_name")));
    }

    #[test]
    fn test_restore_keeps_ids_unique() {
        let mut orchestrator = MigrationOrchestrator::new();
        let plan = orchestrator.plan(rename(), &users(), Utc::now()).unwrap();

        let mut reloaded = MigrationOrchestrator::new();
        reloaded.restore(plan.clone());
        let next = reloaded.plan(rename(), &users(), Utc::now()).unwrap();
        assert_eq!(next.id, plan.id + 1);
    }
}
