//! Scheduler/Executor - stage-by-stage execution over a worker pool
//!
//! Executes the validated [`ExecutionPlan`] one stage at a time. Within a
//! stage, the (rule x artifact) cross product runs on a bounded rayon pool;
//! the pool join is the stage barrier that makes dependency edges binding:
//! every tag a stage-k rule produces is fully visible to stage k+1.
//!
//! Failure isolation: an error or panic inside `applies`/`decorate` marks
//! only that (rule, artifact) item FAILED and is recorded on the result.
//! Sibling items, the rest of the stage, and later stages all proceed.

use rayon::prelude::*;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, ArtifactId};
use crate::config::EngineConfig;
use crate::entity::EntityGraph;
use crate::error::{EngineError, Result};
use crate::graph::{ExecutionPlan, PlanWarning};
use crate::rule::{Rule, RuleSet, StoreView};
use crate::store::TagStore;

/// Per-(rule, artifact) work item state machine:
/// `Pending -> Running -> {Completed, Skipped, Failed}`. `Failed` is
/// terminal; there are no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Skipped | ItemState::Failed
        )
    }
}

/// One recorded per-item failure, queryable after the run.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub rule: String,
    pub artifact: ArtifactId,
    pub message: String,
}

/// Counters for one executed stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageMetrics {
    pub items: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Run-level cancellation signal. Setting it stops dispatch at the next
/// stage boundary; in-flight items in the current stage finish.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final result of a run: best-effort tag/property state plus the explicit
/// failure list. Never a silent partial result - cancellation and early
/// halts are marked.
#[derive(Debug)]
pub struct RunResult {
    store: TagStore,
    entities: EntityGraph,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<PlanWarning>,
    pub stage_metrics: Vec<StageMetrics>,
    pub cancelled: bool,
    pub halted_early: bool,
    pub duration_ms: u64,
}

impl RunResult {
    /// Read-only tag store (all artifacts with their final tag maps).
    pub fn store(&self) -> &TagStore {
        &self.store
    }

    /// Read-only entity graph (all entities with their final properties).
    pub fn entities(&self) -> &EntityGraph {
        &self.entities
    }

    pub fn summary(&self) -> RunSummary {
        let mut completed = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for stage in &self.stage_metrics {
            completed += stage.completed;
            skipped += stage.skipped;
            failed += stage.failed;
        }
        RunSummary {
            artifacts: self.store.artifact_count(),
            entities: self.entities.len(),
            stages_run: self.stage_metrics.len(),
            completed,
            skipped,
            failed,
            cancelled: self.cancelled,
            halted_early: self.halted_early,
            duration_ms: self.duration_ms,
            failures: self.failures.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Serializable run snapshot for the external exporter.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub artifacts: usize,
    pub entities: usize,
    pub stages_run: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub halted_early: bool,
    pub duration_ms: u64,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<PlanWarning>,
}

struct ItemOutcome {
    state: ItemState,
    message: Option<String>,
}

/// The inspection engine: a registered rule set plus configuration.
pub struct Engine {
    rules: RuleSet,
    config: EngineConfig,
}

impl Engine {
    pub fn new(rules: RuleSet) -> Self {
        Self::with_config(rules, EngineConfig::default())
    }

    pub fn with_config(rules: RuleSet, config: EngineConfig) -> Self {
        Self { rules, config }
    }

    /// Build and validate the execution plan without running anything.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        let plan = ExecutionPlan::build(&self.rules)?;

        if self.config.unsatisfied_requires_fatal {
            if let Some(warning) = plan.warnings().first() {
                return Err(EngineError::UnsatisfiedRequires {
                    rule: warning.rule.clone(),
                    tag: warning.tag.clone(),
                });
            }
        }

        Ok(plan)
    }

    /// Run every applicable (rule, artifact) pair, stage by stage.
    pub fn run(&self, corpus: &[Artifact]) -> Result<RunResult> {
        self.run_with_cancel(corpus, &CancelFlag::new())
    }

    pub fn run_with_cancel(&self, corpus: &[Artifact], cancel: &CancelFlag) -> Result<RunResult> {
        let plan = self.plan()?;

        info!(
            rules = self.rules.len(),
            artifacts = corpus.len(),
            stages = plan.stage_count(),
            "starting inspection run"
        );
        info!("execution plan:\n{}", plan.render());

        let store = TagStore::new();
        for artifact in corpus {
            store.register(&artifact.id);
        }
        let entities = EntityGraph::new();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads)
            .build()
            .map_err(EngineError::internal)?;

        let start = Instant::now();
        let mut failures = Vec::new();
        let mut stage_metrics = Vec::new();
        let mut cancelled = false;
        let mut halted_early = false;

        for (stage_idx, stage) in plan.stages().iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(stage = stage_idx + 1, "run cancelled at stage boundary");
                cancelled = true;
                break;
            }

            let stage_start = Instant::now();

            // Deterministic item enumeration: plan order x corpus order
            let items: Vec<(usize, &Artifact)> = stage
                .iter()
                .flat_map(|&rule_idx| corpus.iter().map(move |artifact| (rule_idx, artifact)))
                .collect();

            debug!(
                stage = stage_idx + 1,
                rules = stage.len(),
                items = items.len(),
                "stage dispatch"
            );

            let view = StoreView::new(&store, &entities);
            let outcomes: Vec<(usize, &Artifact, ItemOutcome)> = pool.install(|| {
                items
                    .par_iter()
                    .map(|&(rule_idx, artifact)| {
                        let outcome = run_item(self.rules.rule(rule_idx), artifact, &view);
                        (rule_idx, artifact, outcome)
                    })
                    .collect()
            });
            // The pool join above is the stage barrier: every item reached a
            // terminal state before the next stage starts.

            let mut metrics = StageMetrics {
                items: outcomes.len(),
                ..Default::default()
            };

            for (rule_idx, artifact, outcome) in outcomes {
                match outcome.state {
                    ItemState::Completed => metrics.completed += 1,
                    ItemState::Skipped => metrics.skipped += 1,
                    ItemState::Failed => {
                        metrics.failed += 1;
                        let rule = self.rules.descriptors()[rule_idx].name.clone();
                        let message = outcome.message.unwrap_or_default();
                        error!(
                            rule = %rule,
                            artifact = %artifact.id,
                            "rule failed: {message}"
                        );
                        failures.push(ItemFailure {
                            rule,
                            artifact: artifact.id.clone(),
                            message,
                        });
                    }
                    ItemState::Pending | ItemState::Running => {
                        // The barrier guarantees terminal states only
                        return Err(EngineError::Internal(format!(
                            "non-terminal item state after stage {} barrier",
                            stage_idx + 1
                        )));
                    }
                }
            }

            metrics.duration_ms = stage_start.elapsed().as_millis() as u64;
            info!(
                stage = stage_idx + 1,
                completed = metrics.completed,
                skipped = metrics.skipped,
                failed = metrics.failed,
                duration_ms = metrics.duration_ms,
                "stage complete"
            );

            let had_failures = metrics.failed > 0;
            stage_metrics.push(metrics);

            if self.config.fail_fast && had_failures {
                warn!(
                    stage = stage_idx + 1,
                    "fail-fast: halting before next stage"
                );
                halted_early = true;
                break;
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            duration_ms,
            failures = failures.len(),
            cancelled,
            "inspection run finished"
        );

        Ok(RunResult {
            store,
            entities,
            failures,
            warnings: plan.warnings().to_vec(),
            stage_metrics,
            cancelled,
            halted_early,
            duration_ms,
        })
    }
}

/// Drive one (rule, artifact) item through its state machine. Errors and
/// panics in `applies` or `decorate` terminate only this item.
fn run_item(rule: &Arc<dyn Rule>, artifact: &Artifact, view: &StoreView<'_>) -> ItemOutcome {
    let applies = catch_unwind(AssertUnwindSafe(|| rule.applies(artifact, view)));

    match applies {
        Err(panic) => ItemOutcome {
            state: ItemState::Failed,
            message: Some(format!("applies panicked: {}", panic_message(&panic))),
        },
        Ok(false) => ItemOutcome {
            state: ItemState::Skipped,
            message: None,
        },
        Ok(true) => match catch_unwind(AssertUnwindSafe(|| rule.decorate(artifact, view))) {
            Err(panic) => ItemOutcome {
                state: ItemState::Failed,
                message: Some(format!("decorate panicked: {}", panic_message(&panic))),
            },
            Ok(Err(e)) => ItemOutcome {
                state: ItemState::Failed,
                message: Some(e.to_string()),
            },
            Ok(Ok(())) => ItemOutcome {
                state: ItemState::Completed,
                message: None,
            },
        },
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
