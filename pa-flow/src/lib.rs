pub mod case_store;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod storage;

// Re-export commonly used types
pub use case_store::{CASE_ID_FIELD, CaseEntry, CaseStore, ConversationTurn, TurnRole};
pub use context::Context;
pub use error::{FlowError, Result};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStatus, StageError};
pub use runner::{CaseRunner, RUN_SUMMARY_STEP, RunOutcome, RunReport, check_case_id};
pub use stage::{NextAction, Stage, StageResult};
pub use storage::{CaseQuery, CaseRepository, InMemoryCaseRepository, PostgresCaseRepository};
