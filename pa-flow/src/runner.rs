//! CaseRunner – the run boundary around a [`Pipeline`].
//!
//! A run owns a fresh [`Context`] and [`CaseStore`]. Whatever happens inside the
//! pipeline (every stage completes, a stage halts quietly, a stage raises, or a
//! stage panics) the runner:
//!
//! 1. records the outcome and the elapsed time into the case results,
//! 2. flushes the case store to the repository exactly once,
//! 3. hands back a [`RunReport`] with the accumulated results.
//!
//! Runs never share state. Hosts that process several cases at once create
//! one run per case; the only shared piece is the repository.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    case_store::CaseStore,
    context::Context,
    error::{FlowError, Result},
    pipeline::{Pipeline, PipelineStatus},
    storage::CaseRepository,
};

/// Step name used for the run bookkeeping entry
pub const RUN_SUMMARY_STEP: &str = "run_summary";

/// Reject caller-supplied case ids that cannot be used as a single path
/// segment in storage locations.
pub fn check_case_id(case_id: &str) -> Result<()> {
    let trimmed = case_id.trim();
    if trimmed == "."
        || trimmed.contains("..")
        || trimmed.contains(['/', '\\'])
        || trimmed.chars().any(char::is_control)
    {
        return Err(FlowError::ContextError(format!(
            "Invalid case id: {:?}",
            case_id
        )));
    }
    Ok(())
}

/// Final state of a case run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stopped { stage_id: String, reason: String },
    Failed { stage_id: Option<String>, error: String },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Stopped { .. } => "stopped",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}

/// What a caller gets back once a run is over
#[derive(Debug, Clone)]
pub struct RunReport {
    pub case_id: String,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
    pub results: Map<String, Value>,
    /// Whether the teardown flush wrote a document
    pub flushed: bool,
}

/// High-level helper that orchestrates _prepare → execute → record → flush_.
#[derive(Clone)]
pub struct CaseRunner {
    pipeline: Arc<Pipeline>,
    repository: Arc<dyn CaseRepository>,
}

impl CaseRunner {
    pub fn new(pipeline: Arc<Pipeline>, repository: Arc<dyn CaseRepository>) -> Self {
        Self {
            pipeline,
            repository,
        }
    }

    pub fn repository(&self) -> Arc<dyn CaseRepository> {
        self.repository.clone()
    }

    /// Create the per-run state for a case, generating an id when none is given
    pub fn start_case(&self, case_id: Option<String>) -> (Context, CaseStore) {
        let case_id = case_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = Context::new(case_id.clone());
        let store = CaseStore::new(case_id, self.repository.clone());
        (context, store)
    }

    /// Execute the pipeline for the case owned by `context` / `store`.
    ///
    /// Never returns an error: failures are part of the [`RunReport`].
    pub async fn run(&self, context: Context, store: CaseStore) -> RunReport {
        let case_id = context.case_id().to_string();
        let start = Instant::now();
        info!(case_id = %case_id, pipeline = %self.pipeline.id, "Case processing started");

        let pipeline = self.pipeline.clone();
        let task_context = context.clone();
        let task_store = store.clone();
        let handle =
            tokio::spawn(async move { pipeline.execute(&task_context, &task_store).await });

        let outcome = match handle.await {
            Ok(Ok(PipelineStatus::Completed)) => RunOutcome::Completed,
            Ok(Ok(PipelineStatus::Halted { stage_id, reason })) => {
                RunOutcome::Stopped { stage_id, reason }
            }
            Ok(Err(stage_error)) => {
                error!(
                    case_id = %case_id,
                    stage_id = %stage_error.stage_id,
                    error = %stage_error.error,
                    "Case processing failed"
                );
                RunOutcome::Failed {
                    stage_id: Some(stage_error.stage_id),
                    error: stage_error.error.to_string(),
                }
            }
            Err(join_error) => {
                error!(case_id = %case_id, error = %join_error, "Case processing aborted");
                RunOutcome::Failed {
                    stage_id: None,
                    error: join_error.to_string(),
                }
            }
        };

        let elapsed = start.elapsed();
        store.log(run_summary(&outcome, elapsed), None, RUN_SUMMARY_STEP);

        let flushed = match store.flush().await {
            Ok(flushed) => flushed,
            Err(e) => {
                warn!(case_id = %case_id, error = %e, "Failed to store case results");
                false
            }
        };

        info!(
            case_id = %case_id,
            status = outcome.label(),
            execution_time = elapsed.as_secs_f64(),
            "Case processing finished"
        );

        RunReport {
            case_id,
            outcome,
            elapsed,
            results: store.results(),
            flushed,
        }
    }
}

fn run_summary(outcome: &RunOutcome, elapsed: Duration) -> Value {
    let mut summary = json!({
        "run_status": outcome.label(),
        "execution_time_seconds": (elapsed.as_secs_f64() * 100.0).round() / 100.0,
    });
    match outcome {
        RunOutcome::Completed => {}
        RunOutcome::Stopped { stage_id, reason } => {
            summary["stopped_at"] = json!(stage_id);
            summary["stop_reason"] = json!(reason);
        }
        RunOutcome::Failed { stage_id, error } => {
            summary["failed_at"] = json!(stage_id);
            summary["error"] = json!(error);
        }
    }
    summary
}
