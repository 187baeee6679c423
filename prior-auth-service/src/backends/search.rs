use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::{BackendError, SearchBackend, SearchHit, SearchRequest};

const SERVICE: &str = "search";
const DEFAULT_API_VERSION: &str = "2024-07-01";

/// Azure AI Search index queried through the REST `docs/search` endpoint
pub struct AzureSearchBackend {
    client: Client,
    endpoint: String,
    index_name: String,
    api_key: String,
    api_version: String,
}

impl AzureSearchBackend {
    pub fn new(
        endpoint: impl Into<String>,
        index_name: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
            api_key: api_key.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/indexes/{}/docs/search?api-version={}",
            self.endpoint,
            urlencoding::encode(&self.index_name),
            self.api_version
        )
    }
}

/// Hybrid query: keyword text, a vectorized copy of the same text and
/// semantic reranking with extractive captions and answers
pub(crate) fn search_body(request: &SearchRequest) -> Value {
    json!({
        "search": request.text,
        "vectorQueries": [{
            "kind": "text",
            "text": request.text,
            "k": request.k_nearest_neighbors,
            "fields": request.vector_field,
            "weight": request.vector_weight,
        }],
        "queryType": "semantic",
        "semanticConfiguration": request.semantic_configuration,
        "captions": "extractive",
        "answers": "extractive",
        "top": request.top,
    })
}

pub(crate) fn parse_hits(body: &Value) -> Result<Vec<SearchHit>, BackendError> {
    let documents = body["value"].as_array().ok_or_else(|| BackendError::Decode {
        service: SERVICE,
        message: "missing 'value' array".to_string(),
    })?;

    Ok(documents
        .iter()
        .map(|doc| SearchHit {
            parent_path: doc["parent_path"].as_str().map(str::to_string),
            chunk_id: doc["chunk_id"].as_str().map(str::to_string),
            chunk: doc["chunk"].as_str().map(str::to_string),
            reranker_score: doc["@search.rerankerScore"].as_f64(),
            caption: doc["@search.captions"][0]["text"]
                .as_str()
                .map(str::to_string),
        })
        .collect())
}

#[async_trait]
impl SearchBackend for AzureSearchBackend {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, BackendError> {
        debug!(index = %self.index_name, query = %request.text, "Querying policy index");

        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .json(&search_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: Value = response.json().await?;
        parse_hits(&body)
    }
}
