//! Schema Evolution Engine
//!
//! Versioned schemas with compatibility checking, deprecation lifecycles
//! gated on observed usage, and expand / migrate / contract migration plans.
//!
//! ## Features
//!
//! - **Immutable Versions**: every change produces a new version with a SHA256 fingerprint
//! - **Compatibility Checking**: field-level classification against NONE / BACKWARD / FORWARD / FULL
//! - **Deprecation Lifecycle**: ANNOUNCED → READY_FOR_REMOVAL → REMOVED, driven by deadlines and usage
//! - **Migration Plans**: destructive changes become gated expand / migrate / contract steps
//! - **Durable State**: JSON files, optionally committed to git
//!
//! ## Architecture
//!
//! ```text
//! SchemaModel ──▶ CompatibilityChecker ──▶ SchemaRegistry
//!                                              │
//!                     LifecycleTracker ◀──▶ UsageMonitor
//!                            │
//!                   MigrationOrchestrator ──▶ executor ──▶ advance_migration
//! ```

pub mod checksum;
pub mod clock;
pub mod compatibility;
pub mod config;
pub mod deprecation;
pub mod error;
pub mod events;
pub mod migration;
pub mod model;
pub mod registry;
pub mod schema;
pub mod store;
pub mod sweep;
pub mod usage;
pub mod version;

pub use checksum::Checksum;
pub use clock::{Clock, ManualClock, SystemClock};
pub use compatibility::{
    field_listing_diff, Classification, CompatibilityChecker, CompatibilityMode, Verdict, Violation,
};
pub use config::EvolutionConfig;
pub use deprecation::{DeprecationRecord, DeprecationState, LifecyclePolicy};
pub use error::{EvolutionError, Result};
pub use events::{EventKind, EventSink, LifecycleEvent, MemorySink, TracingSink};
pub use migration::{MigrationPlan, Phase, PlanStatus, ProposedChange, StepResult, StepStatus};
pub use registry::{DeprecationStatus, EntityStatus, Published, SchemaRegistry};
pub use schema::{FieldDef, FieldRef, FieldType};
pub use store::{FsStore, MemoryStore, StateStore};
pub use sweep::{SweepReport, Sweeper};
pub use usage::UsageMonitor;
pub use version::{SchemaVersion, VersionId, VersionSelector};
