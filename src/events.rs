//! Lifecycle events
//!
//! The engine emits structured events; delivering them to people (chat,
//! email) is the job of whatever [`EventSink`] the registry is built with.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Announced,
    DeadlineApproaching,
    ReadyForRemoval,
    Removed,
    GateBlocked,
    PolicyException,
    /// Usage observed after the deadline; deadline was pushed out
    Escalation,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Announced => "ANNOUNCED",
            EventKind::DeadlineApproaching => "DEADLINE_APPROACHING",
            EventKind::ReadyForRemoval => "READY_FOR_REMOVAL",
            EventKind::Removed => "REMOVED",
            EventKind::GateBlocked => "GATE_BLOCKED",
            EventKind::PolicyException => "POLICY_EXCEPTION",
            EventKind::Escalation => "ESCALATION",
        };
        f.write_str(name)
    }
}

/// A structured lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub at: DateTime<Utc>,
    pub detail: String,
}

impl LifecycleEvent {
    pub fn new(
        kind: EventKind,
        entity: impl Into<String>,
        field: Option<&str>,
        at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            field: field.map(String::from),
            at,
            detail: detail.into(),
        }
    }
}

/// Receives lifecycle events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        match event.kind {
            EventKind::GateBlocked | EventKind::PolicyException | EventKind::Escalation => {
                tracing::warn!(
                    kind = %event.kind,
                    entity = %event.entity,
                    field = event.field.as_deref().unwrap_or("-"),
                    at = %event.at,
                    "{}",
                    event.detail
                );
            }
            _ => {
                tracing::info!(
                    kind = %event.kind,
                    entity = %event.entity,
                    field = event.field.as_deref().unwrap_or("-"),
                    at = %event.at,
                    "{}",
                    event.detail
                );
            }
        }
    }
}

/// Keeps events in memory, for tests and in-process tooling
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}
