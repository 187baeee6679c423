// Prior authorization pipeline stages
pub mod determination;
pub mod extraction;
pub mod ingest;
pub mod policy_materialization;
pub mod policy_retrieval;

// Shared modules
pub mod keys;

pub use determination::DeterminationStage;
pub use extraction::ExtractionStage;
pub use ingest::IngestStage;
pub use policy_materialization::PolicyMaterializationStage;
pub use policy_retrieval::PolicyRetrievalStage;
