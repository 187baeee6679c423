use anyhow::{Result as AnyResult, bail};
use pa_flow::{
    CaseRepository, CaseRunner, CaseStore, Context, InMemoryCaseRepository, Pipeline,
    PipelineBuilder, PostgresCaseRepository, RunReport,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    backends::{
        ApiAuth, AzureBlobStore, AzureSearchBackend, BlobStore, ChatCompletionsBackend,
        DocumentAnalyzer, DocumentIntelligenceAnalyzer, GenerationBackend, LocalBlobStore,
        SearchBackend,
    },
    config::{LlmProvider, LlmSettings, Settings, StorageBackend},
    models::PageImage,
    stages::{
        DeterminationStage, ExtractionStage, IngestStage, PolicyMaterializationStage,
        PolicyRetrievalStage, extraction::ExtractionSettings, keys::context_keys,
    },
};

/// The external services a pipeline talks to
#[derive(Clone)]
pub struct Backends {
    pub generation: Arc<dyn GenerationBackend>,
    /// Primary determination backend; `None` sends every determination to `generation`
    pub reasoning: Option<Arc<dyn GenerationBackend>>,
    pub search: Arc<dyn SearchBackend>,
    pub blob_store: Arc<dyn BlobStore>,
    pub documents: Arc<dyn DocumentAnalyzer>,
}

fn chat_backend(llm: &LlmSettings, name: &str, deployment: &str, api_version: &str) -> ChatCompletionsBackend {
    match llm.provider {
        LlmProvider::Azure => ChatCompletionsBackend::azure(
            name,
            &llm.endpoint,
            deployment,
            api_version,
            llm.api_key.clone(),
        ),
        LlmProvider::OpenaiCompatible => ChatCompletionsBackend::new(
            name,
            llm.endpoint.clone(),
            Some(deployment.to_string()),
            ApiAuth::Bearer(llm.api_key.clone()),
        ),
    }
}

impl Backends {
    pub fn from_settings(settings: &Settings) -> AnyResult<Self> {
        let llm = &settings.llm;
        if llm.endpoint.is_empty() || llm.api_key.is_empty() {
            bail!("AZURE_OPENAI_ENDPOINT and AZURE_OPENAI_KEY must be set");
        }

        let generation: Arc<dyn GenerationBackend> = Arc::new(chat_backend(
            llm,
            "chat",
            &llm.chat_deployment,
            &llm.api_version,
        ));

        let reasoning: Option<Arc<dyn GenerationBackend>> = if llm.reasoning_deployment.is_empty() {
            info!("No reasoning deployment configured");
            None
        } else {
            Some(Arc::new(chat_backend(
                llm,
                "reasoning",
                &llm.reasoning_deployment,
                &llm.reasoning_api_version,
            )))
        };

        if settings.search.endpoint.is_empty() || settings.search.index_name.is_empty() {
            warn!("Search endpoint or index name is empty, policy search will fail");
        }
        let search = Arc::new(AzureSearchBackend::new(
            settings.search.endpoint.clone(),
            settings.search.index_name.clone(),
            settings.search.api_key.clone(),
        ));

        let storage = &settings.storage;
        let blob_store: Arc<dyn BlobStore> = match storage.resolved_backend() {
            StorageBackend::Local => {
                info!(root = %storage.local_root, "Using local blob store");
                Arc::new(LocalBlobStore::new(storage.local_root.clone()))
            }
            StorageBackend::Azure => {
                info!(
                    account = %storage.account_name,
                    container = %storage.container_name,
                    "Using Azure blob store"
                );
                Arc::new(AzureBlobStore::new(
                    storage.account_name.clone(),
                    storage.container_name.clone(),
                    storage.sas_token.clone(),
                ))
            }
        };

        let documents = Arc::new(DocumentIntelligenceAnalyzer::new(
            settings.document_intelligence.endpoint.clone(),
            settings.document_intelligence.api_key.clone(),
        ));

        Ok(Self {
            generation,
            reasoning,
            search,
            blob_store,
            documents,
        })
    }
}

/// Durable case store: Postgres when a database URL is configured,
/// otherwise an in-process map that is lost on exit
pub async fn open_repository(settings: &Settings) -> AnyResult<Arc<dyn CaseRepository>> {
    match settings.database_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            let repository = PostgresCaseRepository::connect(url).await?;
            info!("Case documents stored in PostgreSQL");
            Ok(Arc::new(repository))
        }
        None => {
            warn!("DATABASE_URL not set, case documents are kept in memory only");
            Ok(Arc::new(InMemoryCaseRepository::new()))
        }
    }
}

/// ingest → clinical_extraction → policy_retrieval → policy_materialization → llm_determination
pub fn build_pa_pipeline(backends: &Backends, settings: &Settings) -> Pipeline {
    let prompts = Arc::new(settings.prompts.clone());

    PipelineBuilder::new("prior_authorization")
        .add_stage(Arc::new(IngestStage::new(
            backends.blob_store.clone(),
            settings.storage.remote_dir_base.clone(),
        )))
        .add_stage(Arc::new(ExtractionStage::new(
            backends.generation.clone(),
            prompts.clone(),
            ExtractionSettings {
                patient: settings.patient_extraction.clone(),
                physician: settings.physician_extraction.clone(),
                clinical: settings.clinical_extraction.clone(),
            },
        )))
        .add_stage(Arc::new(PolicyRetrievalStage::new(
            backends.generation.clone(),
            backends.search.clone(),
            prompts.clone(),
            settings.query_expansion.clone(),
            settings.retrieval.clone(),
        )))
        .add_stage(Arc::new(PolicyMaterializationStage::new(
            backends.blob_store.clone(),
            backends.documents.clone(),
        )))
        .add_stage(Arc::new(DeterminationStage::new(
            backends.reasoning.clone(),
            backends.generation.clone(),
            prompts,
            settings.determination.clone(),
            settings.summarization.clone(),
        )))
        .build()
}

/// Runs prior authorization cases. Every call gets its own context and
/// case store; only the pipeline and the repository are shared.
#[derive(Clone)]
pub struct PaProcessor {
    runner: CaseRunner,
}

impl PaProcessor {
    pub fn new(backends: &Backends, settings: &Settings, repository: Arc<dyn CaseRepository>) -> Self {
        let pipeline = Arc::new(build_pa_pipeline(backends, settings));
        Self {
            runner: CaseRunner::new(pipeline, repository),
        }
    }

    pub fn repository(&self) -> Arc<dyn CaseRepository> {
        self.runner.repository()
    }

    fn start_case(&self, case_id: Option<String>) -> pa_flow::Result<(Context, CaseStore)> {
        if let Some(id) = &case_id {
            pa_flow::check_case_id(id)?;
        }
        Ok(self.runner.start_case(case_id))
    }

    /// Process a case from uploaded PDFs (local paths or URLs)
    pub async fn process_documents(
        &self,
        case_id: Option<String>,
        uploaded_files: Vec<String>,
        use_reasoning: Option<bool>,
    ) -> pa_flow::Result<RunReport> {
        let (context, store) = self.start_case(case_id)?;
        context
            .set(context_keys::UPLOADED_FILES, &uploaded_files)
            .await?;
        if let Some(use_reasoning) = use_reasoning {
            context.set(context_keys::USE_REASONING, use_reasoning).await?;
        }
        Ok(self.runner.run(context, store).await)
    }

    /// Process a case from page images that were already rendered
    pub async fn process_images(
        &self,
        case_id: Option<String>,
        images: Vec<PageImage>,
        use_reasoning: Option<bool>,
    ) -> pa_flow::Result<RunReport> {
        let (context, store) = self.start_case(case_id)?;
        context.set(context_keys::PAGE_IMAGES, &images).await?;
        if let Some(use_reasoning) = use_reasoning {
            context.set(context_keys::USE_REASONING, use_reasoning).await?;
        }
        Ok(self.runner.run(context, store).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{
        GenerationRequest,
        fakes::{FakeAnalyzer, FakeGeneration, FakeSearch, MemoryBlobStore, Reply, output, text},
    };
    use pa_flow::{InMemoryCaseRepository, RunOutcome};
    use serde_json::json;

    fn respond(request: &GenerationRequest) -> Reply {
        let system = request.system_message.clone().unwrap_or_default();
        if system.contains("patient's identifying") {
            output(json!({"patient_name": "Jane Roe", "patient_id": "P-1"}))
        } else if system.contains("requesting physician") {
            output(json!({"physician_name": "Dr. Alan Smith", "specialty": "Pulmonology"}))
        } else if system.contains("clinical reviewer") {
            output(json!({
                "diagnosis": "Severe persistent asthma",
                "icd_10_code": "J45.50",
                "treatment_request": {"name_of_medication_or_procedure": "Omalizumab"}
            }))
        } else if system.contains("search queries") {
            output(json!({"optimized_query": "omalizumab severe asthma J45.50"}))
        } else {
            text("APPROVED")
        }
    }

    fn pages() -> Vec<PageImage> {
        (1..=3)
            .map(|i| PageImage::new(format!("page_{}.png", i), "iVBORw0KGgo="))
            .collect()
    }

    fn processor(
        search: Arc<FakeSearch>,
        blob_store: Arc<MemoryBlobStore>,
        repository: Arc<InMemoryCaseRepository>,
    ) -> PaProcessor {
        let backends = Backends {
            generation: FakeGeneration::responding("chat", respond),
            reasoning: None,
            search,
            blob_store,
            documents: FakeAnalyzer::returning("# Omalizumab criteria"),
        };
        PaProcessor::new(&backends, &Settings::default(), repository)
    }

    #[tokio::test]
    async fn full_case_is_determined_and_persisted() {
        let repository = Arc::new(InMemoryCaseRepository::new());
        let processor = processor(
            FakeSearch::with_paths(&["policies/asthma-v2"]),
            MemoryBlobStore::with_blob("policies/asthma-v2", b"%PDF"),
            repository.clone(),
        );

        let report = processor
            .process_images(Some("case-e2e".to_string()), pages(), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.flushed);

        let document = repository.get("case-e2e").await.unwrap().unwrap();
        assert_eq!(document["case_id"], "case-e2e");
        assert_eq!(document["patient_info"]["patient_name"], "Jane Roe");
        assert_eq!(document["physician_info"]["specialty"], "Pulmonology");
        assert_eq!(document["clinical_info"]["icd_10_code"], "J45.50");
        assert_eq!(document["policy_location"], "policies/asthma-v2");
        assert_eq!(document["policy_text"], "# Omalizumab criteria");
        assert_eq!(document["final_determination"], "APPROVED");
    }

    #[tokio::test]
    async fn missing_policy_stops_the_run_but_still_persists() {
        let repository = Arc::new(InMemoryCaseRepository::new());
        let processor = processor(
            FakeSearch::with_paths(&[]),
            Arc::new(MemoryBlobStore::default()),
            repository.clone(),
        );

        let report = processor
            .process_images(Some("case-none".to_string()), pages(), Some(false))
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::Stopped { .. }));
        let document = repository.get("case-none").await.unwrap().unwrap();
        assert_eq!(document["policy_location"], "no results found");
        assert!(document.get("final_determination").is_none());
        assert_eq!(document["run_status"], "stopped");
    }

    #[tokio::test]
    async fn empty_policy_download_still_reaches_a_determination() {
        let repository = Arc::new(InMemoryCaseRepository::new());
        let processor = processor(
            FakeSearch::with_paths(&["policies/empty.pdf"]),
            MemoryBlobStore::with_blob("policies/empty.pdf", b""),
            repository.clone(),
        );

        let report = processor
            .process_images(Some("case-empty".to_string()), pages(), None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.results["policy_text"], "");
        assert_eq!(
            report.results["final_determination"],
            "APPROVED"
        );
    }

    #[tokio::test]
    async fn concurrent_cases_do_not_share_results() {
        let repository = Arc::new(InMemoryCaseRepository::new());
        let processor = processor(
            FakeSearch::with_paths(&["policies/asthma-v2.pdf"]),
            MemoryBlobStore::with_blob("policies/asthma-v2.pdf", b"%PDF"),
            repository.clone(),
        );

        let (a, b) = tokio::join!(
            processor.process_images(Some("case-a".to_string()), pages(), None),
            processor.process_images(Some("case-b".to_string()), pages(), None),
        );

        assert_eq!(a.unwrap().case_id, "case-a");
        assert_eq!(b.unwrap().case_id, "case-b");
        let doc_a = repository.get("case-a").await.unwrap().unwrap();
        assert_eq!(doc_a["case_id"], "case-a");
        assert!(repository.get("case-b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn traversal_case_id_is_refused_before_any_stage_runs() {
        let repository = Arc::new(InMemoryCaseRepository::new());
        let blobs = Arc::new(MemoryBlobStore::default());
        let processor = processor(FakeSearch::with_paths(&[]), blobs.clone(), repository.clone());

        let result = processor
            .process_documents(
                Some("../../escape".to_string()),
                vec!["/data/referral.pdf".to_string()],
                None,
            )
            .await;

        assert!(matches!(result, Err(pa_flow::FlowError::ContextError(_))));
        assert!(blobs.blobs.is_empty());
        assert!(repository.get("../../escape").await.unwrap().is_none());
    }

    #[test]
    fn backends_need_generation_credentials() {
        assert!(Backends::from_settings(&Settings::default()).is_err());
    }
}
