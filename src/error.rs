//! Error types for the evolution engine

use thiserror::Error;

use crate::compatibility::Verdict;

/// Result type for evolution operations
pub type Result<T> = std::result::Result<T, EvolutionError>;

/// Schema evolution errors
///
/// Every variant maps to a stable code (see [`EvolutionError::code`]) so that
/// tooling can render operator guidance without parsing messages.
#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error("Invalid schema for {entity}: {reason}")]
    InvalidSchema { entity: String, reason: String },

    #[error("Incompatible change to {entity}: {} violation(s) under {}", .verdict.violations.len(), .verdict.mode)]
    IncompatibleChange { entity: String, verdict: Box<Verdict> },

    #[error("Field {entity}.{field} is already deprecated")]
    AlreadyDeprecated { entity: String, field: String },

    #[error("Not found: {kind} {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Gate blocked for {entity}.{field}: {reason}")]
    GateBlocked { entity: String, field: String, reason: String },

    #[error("Step {step} of plan {plan} is not ready: {reason}")]
    StepNotReady { plan: u64, step: u32, reason: String },

    #[error("Step {step} of plan {plan} depends on unfinished step(s) {pending:?}")]
    DependencyUnsatisfied { plan: u64, step: u32, pending: Vec<u32> },

    #[error("Plan {plan} cannot be cancelled: {reason}")]
    CancelRejected { plan: u64, reason: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl EvolutionError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EvolutionError::InvalidSchema { .. } => "INVALID_SCHEMA",
            EvolutionError::IncompatibleChange { .. } => "INCOMPATIBLE_CHANGE",
            EvolutionError::AlreadyDeprecated { .. } => "ALREADY_DEPRECATED",
            EvolutionError::NotFound { .. } => "NOT_FOUND",
            EvolutionError::GateBlocked { .. } => "GATE_BLOCKED",
            EvolutionError::StepNotReady { .. } => "STEP_NOT_READY",
            EvolutionError::DependencyUnsatisfied { .. } => "DEPENDENCY_UNSATISFIED",
            EvolutionError::CancelRejected { .. } => "CANCEL_REJECTED",
            EvolutionError::InvalidTransition(_) => "INVALID_TRANSITION",
            EvolutionError::Config(_) => "CONFIG",
            EvolutionError::Io(_) | EvolutionError::Git(_) => "STORAGE",
            EvolutionError::Json(_) | EvolutionError::Semver(_) => "ENCODING",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvolutionError::GateBlocked { .. } | EvolutionError::Io(_))
    }

    /// The verdict behind an `INCOMPATIBLE_CHANGE`, if any
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            EvolutionError::IncompatibleChange { verdict, .. } => Some(verdict.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        EvolutionError::NotFound { kind, key: key.into() }
    }

    pub(crate) fn invalid_schema(entity: &str, reason: impl Into<String>) -> Self {
        EvolutionError::InvalidSchema {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}
