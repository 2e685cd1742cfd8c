//! Deprecation Lifecycle Tracker
//!
//! One [`DeprecationRecord`] per deprecated field. A field without a record is
//! ACTIVE. Records move through
//!
//! ```text
//! ANNOUNCED ──deadline passed + usage below threshold──▶ READY_FOR_REMOVAL ──contract executed──▶ REMOVED
//!     ▲  └──force extend──┘                                    │
//!     └───────────── usage after deadline (auto-extend) ───────┘
//! ```
//!
//! All transitions go through this module. They are pure functions of the
//! record, the ingested usage counters, the policy and the supplied `now`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EvolutionError, Result};
use crate::events::{EventKind, LifecycleEvent};
use crate::schema::FieldRef;
use crate::usage::UsageMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeprecationState {
    Announced,
    ReadyForRemoval,
    /// Terminal
    Removed,
}

impl fmt::Display for DeprecationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeprecationState::Announced => "ANNOUNCED",
            DeprecationState::ReadyForRemoval => "READY_FOR_REMOVAL",
            DeprecationState::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}

/// Tunables for lifecycle transitions
///
/// The overlap period and usage threshold are organisational choices and are
/// always supplied from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Default announcement-to-deadline span
    pub overlap_period: Duration,
    /// Trailing window for usage counting
    pub usage_window: Duration,
    /// Accesses tolerated within the window
    pub usage_threshold: usize,
    /// How far a deadline moves when usage appears after it
    pub deadline_extension: Duration,
    /// Lead time for DEADLINE_APPROACHING
    pub approaching_warning: Duration,
    /// How long REMOVED records are kept before archiving
    pub retention: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            overlap_period: Duration::days(14),
            usage_window: Duration::days(7),
            usage_threshold: 0,
            deadline_extension: Duration::days(7),
            approaching_warning: Duration::days(3),
            retention: Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub detail: String,
}

/// Deprecation state of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprecationRecord {
    pub key: FieldRef,
    pub state: DeprecationState,
    pub announced_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Field that supersedes this one, for rename/retype flows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usage_at: Option<DateTime<Utc>>,
    /// Access count in the trailing window at the last observation
    #[serde(default)]
    pub last_usage_count: usize,
    /// Migration plan scheduled to remove the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<u64>,
    /// Deadline for which DEADLINE_APPROACHING was already emitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warned_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

impl DeprecationRecord {
    pub fn is_terminal(&self) -> bool {
        self.state == DeprecationState::Removed
    }

    /// Whether removal of the field is sanctioned
    pub fn is_cleared(&self) -> bool {
        matches!(
            self.state,
            DeprecationState::ReadyForRemoval | DeprecationState::Removed
        )
    }

    /// Time left until the deadline (negative once passed)
    pub fn time_to_deadline(&self, now: DateTime<Utc>) -> Duration {
        self.deadline - now
    }

    fn audit(&mut self, at: DateTime<Utc>, action: &str, actor: Option<&str>, detail: String) {
        self.audit.push(AuditEntry {
            at,
            action: action.to_string(),
            actor: actor.map(String::from),
            detail,
        });
    }

    fn event(&self, kind: EventKind, at: DateTime<Utc>, detail: String) -> LifecycleEvent {
        LifecycleEvent::new(kind, &self.key.entity, Some(&self.key.field), at, detail)
    }
}

/// Owns every deprecation record
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    records: BTreeMap<FieldRef, DeprecationRecord>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// ACTIVE → ANNOUNCED
    ///
    /// Fails with `ALREADY_DEPRECATED` while a non-terminal record exists. A
    /// REMOVED record is replaced, so a field re-added later can be
    /// deprecated again.
    pub fn deprecate(
        &mut self,
        key: FieldRef,
        deadline: DateTime<Utc>,
        replacement: Option<String>,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(DeprecationRecord, LifecycleEvent)> {
        if let Some(existing) = self.records.get(&key) {
            if !existing.is_terminal() {
                return Err(EvolutionError::AlreadyDeprecated {
                    entity: key.entity,
                    field: key.field,
                });
            }
        }
        if deadline <= now {
            return Err(EvolutionError::InvalidTransition(format!(
                "deadline {} for {} is not in the future",
                deadline, key
            )));
        }

        let mut record = DeprecationRecord {
            key: key.clone(),
            state: DeprecationState::Announced,
            announced_at: now,
            deadline,
            replacement,
            last_usage_at: None,
            last_usage_count: 0,
            plan_id: None,
            warned_for: None,
            removed_at: None,
            audit: Vec::new(),
        };
        let detail = match &record.replacement {
            Some(r) => format!("deprecated until {}; use '{}' instead", deadline, r),
            None => format!("deprecated until {}; scheduled for removal", deadline),
        };
        record.audit(now, "deprecate", actor, detail.clone());
        let event = record.event(EventKind::Announced, now, detail);
        self.records.insert(key, record.clone());
        Ok((record, event))
    }

    pub fn get(&self, key: &FieldRef) -> Option<&DeprecationRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &DeprecationRecord> {
        self.records.values()
    }

    /// Records of one entity
    pub fn for_entity(&self, entity: &str) -> Vec<&DeprecationRecord> {
        self.records
            .values()
            .filter(|r| r.key.entity == entity)
            .collect()
    }

    /// Keys of every ANNOUNCED record
    pub fn announced(&self) -> Vec<FieldRef> {
        self.records
            .values()
            .filter(|r| r.state == DeprecationState::Announced)
            .map(|r| r.key.clone())
            .collect()
    }

    /// Fields of an entity whose removal is sanctioned
    pub fn cleared_fields(&self, entity: &str) -> BTreeSet<String> {
        self.records
            .values()
            .filter(|r| r.key.entity == entity && r.is_cleared())
            .map(|r| r.key.field.clone())
            .collect()
    }

    /// Gate check for a contract step; `Err` carries the blocking reason
    pub fn removal_gate(&self, key: &FieldRef, now: DateTime<Utc>) -> std::result::Result<(), String> {
        match self.records.get(key) {
            None => Err(format!("{} has no deprecation record", key)),
            Some(r) if r.is_cleared() => Ok(()),
            Some(r) if now < r.deadline => Err(format!(
                "deadline {} not reached ({} remaining)",
                r.deadline,
                humanize(r.time_to_deadline(now))
            )),
            Some(r) => Err(format!(
                "deadline passed but removal not yet cleared ({} recent access(es))",
                r.last_usage_count
            )),
        }
    }

    /// ANNOUNCED → ANNOUNCED with a new deadline
    pub fn force_extend(
        &mut self,
        key: &FieldRef,
        new_deadline: DateTime<Utc>,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeprecationRecord> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| EvolutionError::not_found("deprecation", key.to_string()))?;
        if record.state != DeprecationState::Announced {
            return Err(EvolutionError::InvalidTransition(format!(
                "cannot extend {} in state {}",
                key, record.state
            )));
        }
        if new_deadline <= now {
            return Err(EvolutionError::InvalidTransition(format!(
                "new deadline {} for {} is not in the future",
                new_deadline, key
            )));
        }
        let old = record.deadline;
        record.deadline = new_deadline;
        record.audit(
            now,
            "force_extend",
            actor,
            format!("deadline {} -> {}", old, new_deadline),
        );
        Ok(record.clone())
    }

    /// Deadline sweep transition for one ANNOUNCED record
    ///
    /// Before the deadline the record stays ANNOUNCED whatever the usage
    /// (emitting DEADLINE_APPROACHING once inside the warning lead time). Any
    /// access observed after the deadline pushes the deadline out and
    /// escalates, whatever the threshold. Otherwise the record becomes
    /// READY_FOR_REMOVAL once trailing-window usage is within the threshold.
    pub fn evaluate(
        &mut self,
        key: &FieldRef,
        usage: &UsageMonitor,
        policy: &LifecyclePolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<LifecycleEvent>> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| EvolutionError::not_found("deprecation", key.to_string()))?;
        if record.state != DeprecationState::Announced {
            return Ok(None);
        }

        record.last_usage_count = usage.count_in_window(key, policy.usage_window, now);
        if let Some(last) = usage.last_access(key, now) {
            record.last_usage_at = Some(record.last_usage_at.map_or(last, |prev| prev.max(last)));
        }

        if now < record.deadline {
            let within_warning = record.time_to_deadline(now) <= policy.approaching_warning;
            if within_warning && record.warned_for != Some(record.deadline) {
                record.warned_for = Some(record.deadline);
                let detail = format!(
                    "removal deadline {} in {}",
                    record.deadline,
                    humanize(record.time_to_deadline(now))
                );
                return Ok(Some(record.event(EventKind::DeadlineApproaching, now, detail)));
            }
            return Ok(None);
        }

        let after_deadline = usage.count_between(key, record.deadline, now);
        if after_deadline > 0 {
            return Ok(Some(extend_after_spike(record, after_deadline, policy, now)));
        }

        if record.last_usage_count <= policy.usage_threshold {
            record.state = DeprecationState::ReadyForRemoval;
            let detail = format!(
                "deadline {} passed with {} access(es) in the trailing window",
                record.deadline, record.last_usage_count
            );
            record.audit(now, "ready_for_removal", None, detail.clone());
            return Ok(Some(record.event(EventKind::ReadyForRemoval, now, detail)));
        }
        Ok(None)
    }

    /// Fold one ingested access into the matching record, if any
    ///
    /// A READY_FOR_REMOVAL record whose field is used after its deadline
    /// re-enters ANNOUNCED with an extended deadline.
    pub fn observe_access(
        &mut self,
        key: &FieldRef,
        at: DateTime<Utc>,
        usage: &UsageMonitor,
        policy: &LifecyclePolicy,
        now: DateTime<Utc>,
    ) -> Option<LifecycleEvent> {
        let record = self.records.get_mut(key)?;
        record.last_usage_at = Some(record.last_usage_at.map_or(at, |prev| prev.max(at)));
        record.last_usage_count = usage.count_in_window(key, policy.usage_window, now.max(at));

        match record.state {
            DeprecationState::Removed => {
                tracing::warn!(field = %key, %at, "access reported for a removed field");
                None
            }
            DeprecationState::ReadyForRemoval if at > record.deadline => {
                let after_deadline = usage.count_between(key, record.deadline, now.max(at));
                Some(extend_after_spike(record, after_deadline, policy, now))
            }
            _ => None,
        }
    }

    /// READY_FOR_REMOVAL → REMOVED
    ///
    /// Idempotent on an already REMOVED record (returns `None`).
    pub fn contract_executed(&mut self, key: &FieldRef, now: DateTime<Utc>) -> Result<Option<LifecycleEvent>> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| EvolutionError::not_found("deprecation", key.to_string()))?;
        match record.state {
            DeprecationState::Removed => Ok(None),
            DeprecationState::Announced => Err(EvolutionError::InvalidTransition(format!(
                "{} is still ANNOUNCED; removal requires READY_FOR_REMOVAL",
                key
            ))),
            DeprecationState::ReadyForRemoval => {
                record.state = DeprecationState::Removed;
                record.removed_at = Some(now);
                let detail = "old structure removed".to_string();
                record.audit(now, "removed", None, detail.clone());
                Ok(Some(record.event(EventKind::Removed, now, detail)))
            }
        }
    }

    /// Link a record to the plan that will remove its field
    pub fn attach_plan(&mut self, key: &FieldRef, plan_id: u64) -> Result<()> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| EvolutionError::not_found("deprecation", key.to_string()))?;
        record.plan_id = Some(plan_id);
        Ok(())
    }

    /// Take REMOVED records whose retention has expired out of the tracker
    pub fn purge_removed(&mut self, retention: Duration, now: DateTime<Utc>) -> Vec<DeprecationRecord> {
        let expired: Vec<FieldRef> = self
            .records
            .values()
            .filter(|r| {
                r.is_terminal()
                    && r.removed_at.map(|at| at + retention <= now).unwrap_or(false)
            })
            .map(|r| r.key.clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| self.records.remove(key))
            .collect()
    }

    /// Take a REMOVED record out of the tracker
    ///
    /// Used when the field reappears in a published schema; any later removal
    /// has to go through a fresh deprecation.
    pub fn retire(&mut self, key: &FieldRef) -> Option<DeprecationRecord> {
        match self.records.get(key) {
            Some(record) if record.is_terminal() => self.records.remove(key),
            _ => None,
        }
    }

    /// Re-insert a persisted record
    pub fn restore(&mut self, record: DeprecationRecord) {
        self.records.insert(record.key.clone(), record);
    }
}

fn extend_after_spike(
    record: &mut DeprecationRecord,
    after_deadline: usize,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> LifecycleEvent {
    let old = record.deadline;
    record.state = DeprecationState::Announced;
    record.deadline = now + policy.deadline_extension;
    let detail = format!(
        "{} access(es) after deadline {}; deadline extended to {}",
        after_deadline, old, record.deadline
    );
    record.audit(now, "auto_extend", None, detail.clone());
    record.event(EventKind::Escalation, now, detail)
}

/// Compact rendering of a duration, e.g. "3d 4h"
pub fn humanize(duration: Duration) -> String {
    let negative = duration < Duration::zero();
    let secs = duration.num_seconds().abs();
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3_600, (secs % 3_600) / 60);
    let body = if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    };
    if negative {
        format!("-{}", body)
    } else {
        body
    }
}
