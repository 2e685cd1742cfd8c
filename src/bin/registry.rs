//! Schema Evolution CLI
//!
//! Commands for publishing schemas, managing deprecations and driving
//! migration plans against a file-backed state directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use schema_evolution::compatibility::ChangeKind;
use schema_evolution::deprecation::humanize;
use schema_evolution::{
    field_listing_diff, CompatibilityMode, EvolutionConfig, EvolutionError, FieldDef, FsStore,
    ProposedChange, SchemaRegistry, StepResult, SystemClock, TracingSink, Verdict, VersionId,
    VersionSelector,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-evolution")]
#[command(about = "Schema compatibility checking and deprecation lifecycle engine")]
struct Cli {
    /// Path to a config file (layered over evolution.toml and EVOLUTION__* variables)
    #[arg(short, long)]
    config: Option<String>,

    /// State directory (overrides registry.path)
    #[arg(short, long)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a state directory and write a default config
    Init {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Allocate a new version without publishing it
    Propose {
        entity: String,
        /// JSON file with the field list
        #[arg(short, long)]
        fields: PathBuf,
    },

    /// Propose and publish a version, checked against the entity's mode
    Publish {
        entity: String,
        /// JSON file with the field list
        #[arg(short, long)]
        fields: PathBuf,
    },

    /// Compare two stored versions
    Check {
        entity: String,
        /// Old version (e.g. "v1.0.0" or "latest")
        old: String,
        /// New version
        new: String,
    },

    /// Show a version's fields
    Show {
        entity: String,
        #[arg(default_value = "latest")]
        version: String,
    },

    /// Ancestor chain of a version
    Lineage {
        entity: String,
        #[arg(default_value = "latest")]
        version: String,
    },

    /// Get or set an entity's compatibility mode
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },

    /// Announce deprecation of a field
    Deprecate {
        entity: String,
        field: String,
        /// Deadline (RFC 3339); defaults to the configured overlap period
        #[arg(long, conflicts_with = "in_days")]
        deadline: Option<DateTime<Utc>>,
        /// Deadline as days from now
        #[arg(long)]
        in_days: Option<i64>,
        /// Field that replaces this one
        #[arg(long)]
        replacement: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Replace the deadline of an announced deprecation
    Extend {
        entity: String,
        field: String,
        /// New deadline (RFC 3339)
        #[arg(long)]
        deadline: DateTime<Utc>,
        #[arg(long)]
        actor: Option<String>,
    },

    /// List active deprecations with time remaining
    Deprecations,

    /// Ingest one field access
    RecordAccess {
        entity: String,
        field: String,
        /// Access time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Run one deadline sweep
    Sweep,

    /// Plan a migration
    Plan {
        entity: String,
        /// JSON file describing the change
        #[arg(long)]
        change: PathBuf,
    },

    /// Report a step result from an executor
    Advance {
        plan: u64,
        step: u32,
        #[command(subcommand)]
        result: AdvanceResult,
    },

    /// Cancel a migration plan
    Cancel { plan: u64 },

    /// Show entity status
    Status {
        /// Entity (all entities when omitted)
        entity: Option<String>,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    Get { entity: String },
    Set { entity: String, mode: CompatibilityMode },
}

#[derive(Subcommand)]
enum AdvanceResult {
    Started,
    Succeeded {
        #[arg(long)]
        rows: Option<u64>,
    },
    Failed {
        #[arg(long)]
        reason: String,
    },
}

impl From<AdvanceResult> for StepResult {
    fn from(result: AdvanceResult) -> Self {
        match result {
            AdvanceResult::Started => StepResult::Started,
            AdvanceResult::Succeeded { rows } => StepResult::Succeeded { rows },
            AdvanceResult::Failed { reason } => StepResult::Failed { reason },
        }
    }
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        if let Some(verdict) = e.downcast_ref::<EvolutionError>().and_then(EvolutionError::verdict) {
            print_verdict(verdict);
        }
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn open_registry(config: &EvolutionConfig) -> Result<SchemaRegistry> {
    let root = config.registry_path();
    let store = FsStore::open(
        &root,
        config.registry.git_commits,
        config.registry.default_author.as_deref(),
    )
    .with_context(|| format!("opening state directory {}", root.display()))?;
    let registry = SchemaRegistry::open(
        config,
        Arc::new(store),
        Arc::new(TracingSink),
        Arc::new(SystemClock),
    )?;
    Ok(registry)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn selector(version: &str) -> Result<VersionSelector> {
    version
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid version '{}': {}", version, e))
}

fn print_verdict(verdict: &Verdict) {
    let marker = if verdict.allowed { "✅" } else { "❌" };
    println!(
        "{} {} {} -> {} under {}",
        marker, verdict.entity, verdict.old_version, verdict.new_version, verdict.mode
    );
    for change in verdict.changes.iter().filter(|c| c.kind != ChangeKind::Unchanged) {
        println!("   {:?} {}: {}", change.classification, change.field, change.description);
    }
    for violation in &verdict.violations {
        println!("   └─ {}: {}", violation.field, violation.message);
    }
    if verdict.policy_exception {
        println!("⚠️  Published under NONE; recorded as a policy exception");
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = EvolutionConfig::load_from(cli.config.as_deref())?;
    if let Some(path) = &cli.registry {
        config.registry.path = path.clone();
    }

    match cli.command {
        Commands::Init { path } => {
            println!("📦 Initializing state directory at {:?}", path);
            FsStore::open(&path, config.registry.git_commits, config.registry.default_author.as_deref())?;
            let config_path = path.join("evolution.toml");
            if !config_path.exists() {
                let mut initial = config.clone();
                initial.registry.path = PathBuf::from(".");
                initial.save(&config_path.to_string_lossy())?;
            }
            println!("✅ Initialized at {:?}", path);
            Ok(())
        }

        Commands::Propose { entity, fields } => {
            let registry = open_registry(&config)?;
            let fields: Vec<FieldDef> = read_json(&fields)?;
            let version = registry.propose(&entity, fields)?;
            println!("📝 Proposed {} ({})", version.key(), version.fingerprint);
            Ok(())
        }

        Commands::Publish { entity, fields } => {
            let registry = open_registry(&config)?;
            let fields: Vec<FieldDef> = read_json(&fields)?;
            let published = registry.publish(&entity, fields)?;
            if let Some(verdict) = &published.verdict {
                print_verdict(verdict);
            }
            println!("🚀 Published {}", published.version.key());
            Ok(())
        }

        Commands::Check { entity, old, new } => {
            let registry = open_registry(&config)?;
            let (old, new) = (selector(&old)?, selector(&new)?);
            let verdict = registry.check_compatibility(&entity, &old, &new)?;
            print_verdict(&verdict);
            let old_version = registry.resolve(&entity, &old)?;
            let new_version = registry.resolve(&entity, &new)?;
            let diff = field_listing_diff(&old_version, &new_version);
            if !diff.is_empty() {
                println!();
                print!("{}", diff);
            }
            if !verdict.allowed {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Show { entity, version } => {
            let registry = open_registry(&config)?;
            let version = registry.resolve(&entity, &selector(&version)?)?;
            println!("📦 Version: {}", version.key());
            println!("📅 Created: {}", version.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("🔒 Fingerprint: {}", version.fingerprint);
            if let Some(predecessor) = &version.predecessor {
                println!("↩️  Predecessor: {}", predecessor);
            }
            println!();
            print!("{}", version.listing());
            Ok(())
        }

        Commands::Lineage { entity, version } => {
            let registry = open_registry(&config)?;
            let id = registry.resolve(&entity, &selector(&version)?)?.id.clone();
            let chain: Vec<String> = registry.lineage(&entity, &id)?.iter().map(VersionId::to_string).collect();
            println!("{}", chain.join(" -> "));
            let descendants = registry.descendants(&entity, &id)?;
            if !descendants.is_empty() {
                let names: Vec<String> = descendants.iter().map(VersionId::to_string).collect();
                println!("Derived: {}", names.join(", "));
            }
            Ok(())
        }

        Commands::Mode { action } => {
            let registry = open_registry(&config)?;
            match action {
                ModeAction::Get { entity } => println!("{}: {}", entity, registry.get_mode(&entity)),
                ModeAction::Set { entity, mode } => {
                    registry.set_mode(&entity, mode)?;
                    println!("✅ {} mode set to {}", entity, mode);
                }
            }
            Ok(())
        }

        Commands::Deprecate { entity, field, deadline, in_days, replacement, actor } => {
            let registry = open_registry(&config)?;
            let deadline = deadline.or_else(|| in_days.map(|days| registry.now() + Duration::days(days)));
            let record = registry.deprecate(&entity, &field, deadline, replacement, actor.as_deref())?;
            println!("📣 {} deprecated; removal deadline {}", record.key, record.deadline);
            Ok(())
        }

        Commands::Extend { entity, field, deadline, actor } => {
            let registry = open_registry(&config)?;
            let record = registry.force_extend(&entity, &field, deadline, actor.as_deref())?;
            println!("⏳ {} deadline is now {}", record.key, record.deadline);
            Ok(())
        }

        Commands::Deprecations => {
            let registry = open_registry(&config)?;
            let listed = registry.list_deprecations();
            if listed.is_empty() {
                println!("No active deprecations.");
            }
            for status in listed {
                let record = &status.record;
                let replacement = record
                    .replacement
                    .as_deref()
                    .map(|r| format!(" -> {}", r))
                    .unwrap_or_default();
                println!(
                    "  {}{} [{}] deadline {} ({}), {} recent access(es)",
                    record.key,
                    replacement,
                    record.state,
                    record.deadline.format("%Y-%m-%d %H:%M"),
                    humanize(status.remaining()),
                    record.last_usage_count
                );
            }
            Ok(())
        }

        Commands::RecordAccess { entity, field, at } => {
            let registry = open_registry(&config)?;
            let at = at.unwrap_or_else(Utc::now);
            if registry.record_access(&entity, &field, at)? {
                println!("✅ Recorded access to {}.{} at {}", entity, field, at);
            } else {
                println!("Duplicate access ignored");
            }
            Ok(())
        }

        Commands::Sweep => {
            let registry = open_registry(&config)?;
            let Some(report) = registry.sweep_tick() else {
                bail!("another sweep is running");
            };
            println!("🧹 Sweep at {}", registry.now().format("%Y-%m-%d %H:%M:%S"));
            println!("  Evaluated: {}", report.evaluated);
            println!("  Approaching deadline: {}", report.approaching);
            println!("  Ready for removal: {}", report.ready);
            println!("  Escalated: {}", report.escalated);
            println!("  Archived: {}", report.archived);
            if report.failures > 0 {
                println!("  ⚠️  Failures: {} (retried next sweep)", report.failures);
            }
            Ok(())
        }

        Commands::Plan { entity, change } => {
            let registry = open_registry(&config)?;
            let change: ProposedChange = read_json(&change)?;
            let plan = registry.plan_migration(&entity, change)?;
            println!("🗺️  Plan {} for {}", plan.id, plan.entity);
            for step in &plan.steps {
                let gate = step
                    .gate
                    .as_ref()
                    .map(|g| format!(" (gated on {})", g))
                    .unwrap_or_default();
                println!("  {}. [{}] {}{}", step.id, step.phase, step.description, gate);
            }
            Ok(())
        }

        Commands::Advance { plan, step, result } => {
            let registry = open_registry(&config)?;
            let plan = registry.advance_migration(plan, step, result.into())?;
            println!("Plan {} is {:?}", plan.id, plan.status);
            for step in &plan.steps {
                println!("  {}. [{}] {:?} {}", step.id, step.phase, step.status, step.description);
            }
            Ok(())
        }

        Commands::Cancel { plan } => {
            let registry = open_registry(&config)?;
            let plan = registry.cancel_migration(plan)?;
            println!("🛑 Plan {} cancelled", plan.id);
            Ok(())
        }

        Commands::Status { entity } => {
            let registry = open_registry(&config)?;
            let statuses = match entity {
                Some(entity) => vec![registry.get_status(&entity)?],
                None => registry.overview().into_values().collect(),
            };
            if statuses.is_empty() {
                println!("No entities registered yet.");
            }
            for status in statuses {
                let current = status
                    .current
                    .as_ref()
                    .map(VersionId::to_string)
                    .unwrap_or_else(|| "unpublished".to_string());
                println!("📊 {} ({}), current {}", status.entity, status.mode, current);
                println!("  Versions: {}", status.versions.len());
                for record in &status.deprecations {
                    println!("  {} [{}] deadline {}", record.key.field, record.state, record.deadline);
                }
                for plan in &status.plans {
                    println!("  Plan {} {:?}", plan.id, plan.status);
                }
            }
            Ok(())
        }
    }
}
