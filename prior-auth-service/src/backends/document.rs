use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::{BackendError, DocumentAnalyzer, DocumentInput, OutputFormat};

const SERVICE: &str = "document intelligence";
const DEFAULT_API_VERSION: &str = "2024-11-30";

/// Document Intelligence analyze endpoint. Submits the document, then polls
/// the returned operation until the analysis settles.
pub struct DocumentIntelligenceAnalyzer {
    client: Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl DocumentIntelligenceAnalyzer {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            poll_interval: Duration::from_secs(2),
            max_polls: 90,
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls;
        self
    }

    fn analyze_url(&self, model: &str, format: OutputFormat) -> String {
        format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={}&outputContentFormat={}",
            self.endpoint,
            urlencoding::encode(model),
            self.api_version,
            format.as_str()
        )
    }

    async fn poll(&self, operation_url: &str) -> Result<String, BackendError> {
        for attempt in 1..=self.max_polls {
            let response = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
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
            match body["status"].as_str() {
                Some("succeeded") => return extract_content(&body),
                Some("failed") | Some("canceled") => {
                    return Err(BackendError::Decode {
                        service: SERVICE,
                        message: format!("analysis {}: {}", body["status"], body["error"]),
                    });
                }
                _ => {
                    debug!(attempt, "Document analysis still running");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        Err(BackendError::Timeout(format!(
            "document analysis after {} polls",
            self.max_polls
        )))
    }
}

pub(crate) fn extract_content(body: &Value) -> Result<String, BackendError> {
    body["analyzeResult"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BackendError::Decode {
            service: SERVICE,
            message: "missing analyzeResult.content".to_string(),
        })
}

#[async_trait]
impl DocumentAnalyzer for DocumentIntelligenceAnalyzer {
    async fn analyze(
        &self,
        input: DocumentInput,
        model: &str,
        format: OutputFormat,
    ) -> Result<String, BackendError> {
        let body = match input {
            DocumentInput::Bytes(bytes) => json!({ "base64Source": STANDARD.encode(&bytes) }),
            DocumentInput::Url(url) => json!({ "urlSource": url }),
        };

        let response = self
            .client
            .post(self.analyze_url(model, format))
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .json(&body)
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

        let operation_url = response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Decode {
                service: SERVICE,
                message: "missing operation-location header".to_string(),
            })?;

        let content = self.poll(&operation_url).await?;
        info!(model = %model, characters = content.len(), "Document analysis completed");
        Ok(content)
    }
}
