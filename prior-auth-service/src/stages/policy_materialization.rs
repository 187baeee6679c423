use async_trait::async_trait;
use pa_flow::{CaseStore, Context, Result, Stage, StageResult};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    backends::{BlobStore, DocumentAnalyzer, DocumentInput, LAYOUT_MODEL, OutputFormat},
    stages::keys::{self, context_keys, result_keys, steps},
};

/// Downloads the located policy and turns it into markdown text.
///
/// Any failure along the way yields an empty policy text; the run goes on
/// and the determination works from whatever text it gets.
pub struct PolicyMaterializationStage {
    blob_store: Arc<dyn BlobStore>,
    analyzer: Arc<dyn DocumentAnalyzer>,
}

impl PolicyMaterializationStage {
    pub fn new(blob_store: Arc<dyn BlobStore>, analyzer: Arc<dyn DocumentAnalyzer>) -> Self {
        Self {
            blob_store,
            analyzer,
        }
    }

    pub async fn policy_text(&self, case_id: &str, location: &str) -> String {
        let bytes = match self.blob_store.download_bytes(location).await {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => {
                error!(case_id = %case_id, policy = %location, "Policy document is missing or empty");
                return String::new();
            }
            Err(e) => {
                error!(case_id = %case_id, policy = %location, error = %e, "Failed to download policy");
                return String::new();
            }
        };

        match self
            .analyzer
            .analyze(DocumentInput::Bytes(bytes), LAYOUT_MODEL, OutputFormat::Markdown)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                error!(case_id = %case_id, policy = %location, error = %e, "Policy layout analysis failed");
                String::new()
            }
        }
    }
}

#[async_trait]
impl Stage for PolicyMaterializationStage {
    fn id(&self) -> &str {
        "policy_materialization"
    }

    async fn run(&self, context: &Context, store: &CaseStore) -> Result<StageResult> {
        let case_id = context.case_id();
        let location: String = context.require(context_keys::POLICY_LOCATION).await?;

        let policy_text = self.policy_text(case_id, &location).await;
        info!(
            case_id = %case_id,
            policy = %location,
            characters = policy_text.len(),
            "Policy text extracted"
        );

        store.log(
            keys::entry(result_keys::POLICY_TEXT, &policy_text),
            None,
            steps::POLICY_EXTRACTION,
        );
        context.set(context_keys::POLICY_TEXT, &policy_text).await?;

        Ok(StageResult::proceed("Policy text extracted"))
    }
}
