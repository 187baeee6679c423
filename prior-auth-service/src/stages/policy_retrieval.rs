use async_trait::async_trait;
use pa_flow::{CaseStore, Context, FlowError, Result, Stage, StageResult};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    backends::{
        Completion, GenerationBackend, GenerationParams, GenerationRequest, SamplingParams,
        SearchBackend, SearchRequest,
    },
    config::RetrievalSettings,
    models::{ClinicalInformation, PolicyLocation},
    prompts::Prompts,
    stages::keys::{self, context_keys, result_keys, steps},
};

/// Expands the clinical picture into a search query and locates the policy
/// document. Stops the run quietly when no policy can be located.
pub struct PolicyRetrievalStage {
    generation: Arc<dyn GenerationBackend>,
    search: Arc<dyn SearchBackend>,
    prompts: Arc<Prompts>,
    expansion: SamplingParams,
    retrieval: RetrievalSettings,
}

impl PolicyRetrievalStage {
    pub fn new(
        generation: Arc<dyn GenerationBackend>,
        search: Arc<dyn SearchBackend>,
        prompts: Arc<Prompts>,
        expansion: SamplingParams,
        retrieval: RetrievalSettings,
    ) -> Self {
        Self {
            generation,
            search,
            prompts,
            expansion,
            retrieval,
        }
    }

    async fn expand_query(
        &self,
        case_id: &str,
        clinical: &ClinicalInformation,
        store: &CaseStore,
    ) -> Result<String> {
        let request = GenerationRequest::new(
            self.prompts.query_expansion(clinical),
            GenerationParams::json(self.expansion.clone()),
        )
        .with_system(&self.prompts.query_expansion_system);

        let output = match self.generation.complete(request).await? {
            Completion::Output(output) => output,
            Completion::ContextLengthExceeded => {
                return Err(FlowError::StageFailed(
                    "Query expansion prompt exceeds the model context length".to_string(),
                ));
            }
        };

        let query = output.response["optimized_query"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if query.is_empty() {
            return Err(FlowError::StageFailed(
                "Query expansion returned no optimized query".to_string(),
            ));
        }

        store.log(
            keys::entry(result_keys::OPTIMIZED_QUERY, &query),
            Some(output.conversation),
            steps::QUERY_EXPANSION,
        );
        info!(case_id = %case_id, query = %query, "Optimized policy search query");
        Ok(query)
    }

    /// Path of the top hit, or a sentinel. Never fails.
    async fn locate_policy(&self, case_id: &str, query: &str) -> PolicyLocation {
        let request = SearchRequest {
            text: query.to_string(),
            vector_field: self.retrieval.vector_field.clone(),
            k_nearest_neighbors: self.retrieval.k_nearest_neighbors,
            vector_weight: self.retrieval.vector_weight,
            semantic_configuration: self.retrieval.semantic_configuration_name.clone(),
            top: self.retrieval.top,
        };

        match self.search.search(&request).await {
            Ok(hits) => match hits.into_iter().next() {
                Some(hit) => match hit.parent_path.filter(|p| !p.trim().is_empty()) {
                    Some(path) => PolicyLocation::Found(path),
                    None => {
                        warn!(case_id = %case_id, "Top search hit has no parent path");
                        PolicyLocation::LocateError
                    }
                },
                None => PolicyLocation::NoResults,
            },
            Err(e) => {
                error!(case_id = %case_id, error = %e, "Policy search failed");
                PolicyLocation::LocateError
            }
        }
    }
}

#[async_trait]
impl Stage for PolicyRetrievalStage {
    fn id(&self) -> &str {
        "policy_retrieval"
    }

    async fn run(&self, context: &Context, store: &CaseStore) -> Result<StageResult> {
        let case_id = context.case_id();
        let clinical: ClinicalInformation = context.require(context_keys::CLINICAL_INFO).await?;

        let query = self.expand_query(case_id, &clinical, store).await?;
        context.set(context_keys::OPTIMIZED_QUERY, &query).await?;

        let location = self.locate_policy(case_id, &query).await;
        store.log(
            keys::entry(result_keys::POLICY_LOCATION, location.as_str()),
            None,
            steps::POLICY_SEARCH,
        );

        match location {
            PolicyLocation::Found(path) => {
                info!(case_id = %case_id, policy = %path, "Policy located");
                context.set(context_keys::POLICY_LOCATION, &path).await?;
                Ok(StageResult::proceed(format!("Policy located at {}", path)))
            }
            sentinel => {
                info!(case_id = %case_id, reason = sentinel.as_str(), "Policy not found, stopping");
                Ok(StageResult::halt(sentinel.as_str()))
            }
        }
    }
}
