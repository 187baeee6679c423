use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{case_store::CaseStore, context::Context, error::Result};

/// Result of a stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Next action to take
    pub next_action: NextAction,
    /// Short human-readable progress note
    pub status_message: Option<String>,
    /// Id of the stage that produced this result, filled in by the pipeline
    #[serde(default)]
    pub stage_id: String,
}

impl StageResult {
    pub fn new(next_action: NextAction) -> Self {
        Self {
            next_action,
            status_message: None,
            stage_id: String::new(),
        }
    }

    pub fn new_with_status(next_action: NextAction, status_message: impl Into<String>) -> Self {
        Self {
            next_action,
            status_message: Some(status_message.into()),
            stage_id: String::new(),
        }
    }

    pub fn proceed(status_message: impl Into<String>) -> Self {
        Self::new_with_status(NextAction::Continue, status_message)
    }

    /// Stop the run quietly; this is not an error
    pub fn halt(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new_with_status(NextAction::Halt(reason.clone()), reason)
    }
}

/// Defines what should happen after a stage completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextAction {
    /// Run the next stage in order
    Continue,
    /// Stop the run without raising
    Halt(String),
}

/// Core trait that every pipeline stage implements
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique identifier for this stage
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Execute the stage. Outputs for the next stages go into `context`;
    /// outputs that must be persisted go into `store`.
    async fn run(&self, context: &Context, store: &CaseStore) -> Result<StageResult>;
}
