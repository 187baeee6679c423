use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    case_store::CaseStore,
    context::Context,
    error::{FlowError, Result},
    stage::{NextAction, Stage, StageResult},
};

/// Ordered sequence of stages executed one after another
pub struct Pipeline {
    pub id: String,
    stages: Vec<Arc<dyn Stage>>,
}

/// How a pipeline execution ended, when no stage raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Every stage ran and asked to continue
    Completed,
    /// A stage asked to stop quietly
    Halted { stage_id: String, reason: String },
}

/// A stage error annotated with the stage that raised it
#[derive(Debug)]
pub struct StageError {
    pub stage_id: String,
    pub error: FlowError,
}

impl Pipeline {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stages: Vec::new(),
        }
    }

    /// Append a stage to the end of the pipeline
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn get_stage(&self, stage_id: &str) -> Option<Arc<dyn Stage>> {
        self.stages.iter().find(|s| s.id() == stage_id).cloned()
    }

    /// Run every stage in order until one halts or raises
    pub async fn execute(
        &self,
        context: &Context,
        store: &CaseStore,
    ) -> std::result::Result<PipelineStatus, StageError> {
        for stage in &self.stages {
            let result = self
                .execute_single_stage(stage.as_ref(), context, store)
                .await
                .map_err(|error| StageError {
                    stage_id: stage.id().to_string(),
                    error,
                })?;

            match result.next_action {
                NextAction::Continue => continue,
                NextAction::Halt(reason) => {
                    info!(
                        case_id = %context.case_id(),
                        stage_id = %result.stage_id,
                        reason = %reason,
                        "Pipeline halted"
                    );
                    return Ok(PipelineStatus::Halted {
                        stage_id: result.stage_id,
                        reason,
                    });
                }
            }
        }
        Ok(PipelineStatus::Completed)
    }

    /// Execute one stage by id, without following on to the next stage
    pub async fn execute_stage(
        &self,
        stage_id: &str,
        context: &Context,
        store: &CaseStore,
    ) -> Result<StageResult> {
        let stage = self
            .get_stage(stage_id)
            .ok_or_else(|| FlowError::StageNotFound(stage_id.to_string()))?;
        self.execute_single_stage(stage.as_ref(), context, store).await
    }

    async fn execute_single_stage(
        &self,
        stage: &dyn Stage,
        context: &Context,
        store: &CaseStore,
    ) -> Result<StageResult> {
        debug!(case_id = %context.case_id(), stage_id = %stage.id(), "Running stage");
        let mut result = stage.run(context, store).await?;

        // Track which stage generated the result
        result.stage_id = stage.id().to_string();

        if let Some(message) = &result.status_message {
            info!(case_id = %context.case_id(), stage_id = %result.stage_id, "{}", message);
        }
        Ok(result)
    }
}

/// Builder for creating pipelines
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            pipeline: Pipeline::new(id),
        }
    }

    pub fn add_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.pipeline.add_stage(stage);
        self
    }

    pub fn build(self) -> Pipeline {
        self.pipeline
    }
}
