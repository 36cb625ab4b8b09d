/*
 * Codescan Engine - Dependency-Driven Rule Scheduler
 *
 * Makes many independently authored, mutually dependent inspection rules
 * composable and repeatable over a legacy source corpus.
 *
 * Architecture:
 * - Tag Store (concurrent per-artifact property bag)
 * - Entity Graph (identity-stable registry keyed by fully-qualified name)
 * - Rule Descriptors (explicit requires/need/produces metadata)
 * - Dependency Graph Builder (petgraph, cycle detection before execution)
 * - Scheduler/Executor (layered stages, rayon worker pool, stage barriers)
 *
 * Rules themselves, the source parser, and report formatting are external
 * collaborators; the engine only schedules, isolates, and accumulates.
 */

pub mod artifact;
pub mod config;
pub mod entity;
pub mod error;
pub mod executor;
pub mod graph;
pub mod rule;
pub mod store;

// Re-exports
pub use artifact::{Artifact, ArtifactId};
pub use config::EngineConfig;
pub use entity::{Entity, EntityGraph};
pub use error::{EngineError, Result};
pub use executor::{
    CancelFlag, Engine, ItemFailure, ItemState, RunResult, RunSummary, StageMetrics,
};
pub use graph::{EdgeReason, ExecutionPlan, PlanWarning};
pub use rule::{Rule, RuleDescriptor, RuleDescriptorBuilder, RuleError, RuleSet, StoreView};
pub use store::{TagStore, TagValue};
