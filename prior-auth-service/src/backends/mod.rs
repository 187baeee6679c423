//! Collaborators the pipeline talks to: a chat-completion endpoint, a hybrid
//! search index, a blob store and a document layout analyzer.
//!
//! Stages only see the traits below; the HTTP adapters live in the
//! submodules and are wired up in [`crate::workflow`].

use async_trait::async_trait;
use pa_flow::ConversationTurn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

use crate::models::PageImage;

pub mod blob;
pub mod document;
pub mod openai;
pub mod search;

#[cfg(test)]
pub(crate) mod fakes;

pub use blob::{AzureBlobStore, LocalBlobStore};
pub use document::DocumentIntelligenceAnalyzer;
pub use openai::{ApiAuth, ChatCompletionsBackend};
pub use search::AzureSearchBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {service}: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Prompt exceeds the model context length")]
    ContextLengthExceeded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for pa_flow::FlowError {
    fn from(err: BackendError) -> Self {
        pa_flow::FlowError::StageFailed(err.to_string())
    }
}

/// Sampling knobs for a non-reasoning chat call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub seed: Option<i64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 3000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Reply must be a JSON object; it is parsed before being returned
    JsonObject,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationParams {
    Sampled {
        sampling: SamplingParams,
        response_format: ResponseFormat,
    },
    /// Reasoning deployments accept a completion budget and nothing else
    Reasoning { max_completion_tokens: u32 },
}

impl GenerationParams {
    pub fn json(sampling: SamplingParams) -> Self {
        GenerationParams::Sampled {
            sampling,
            response_format: ResponseFormat::JsonObject,
        }
    }

    pub fn text(sampling: SamplingParams) -> Self {
        GenerationParams::Sampled {
            sampling,
            response_format: ResponseFormat::Text,
        }
    }

    pub fn response_format(&self) -> ResponseFormat {
        match self {
            GenerationParams::Sampled {
                response_format, ..
            } => *response_format,
            GenerationParams::Reasoning { .. } => ResponseFormat::Text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_message: Option<String>,
    pub query: String,
    pub images: Vec<PageImage>,
    pub conversation_history: Vec<ConversationTurn>,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(query: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            system_message: None,
            query: query.into(),
            images: Vec::new(),
            conversation_history: Vec::new(),
            params,
        }
    }

    pub fn with_system(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    pub fn with_images(mut self, images: Vec<PageImage>) -> Self {
        self.images = images;
        self
    }
}

/// A successful generation: the reply plus the turns that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Parsed object for JSON replies, a string otherwise
    pub response: Value,
    pub conversation: Vec<ConversationTurn>,
}

impl StageOutput {
    pub fn text(&self) -> String {
        match &self.response {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Output(StageOutput),
    /// The endpoint rejected the prompt as too long for the model
    ContextLengthExceeded,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, request: GenerationRequest) -> Result<Completion, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub text: String,
    pub vector_field: String,
    pub k_nearest_neighbors: u32,
    pub vector_weight: f32,
    pub semantic_configuration: String,
    pub top: u32,
}

/// One document returned by the policy index, best match first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub parent_path: Option<String>,
    pub chunk_id: Option<String>,
    pub chunk: Option<String>,
    pub reranker_score: Option<f64>,
    pub caption: Option<String>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, BackendError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob by path or URL; `None` when it does not exist
    async fn download_bytes(&self, location: &str) -> Result<Option<Vec<u8>>, BackendError>;
    /// Store a local file under `remote_path`, returning the stored location
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<String, BackendError>;
    /// Copy a blob reachable at `source_url` to `remote_path`
    async fn copy(&self, source_url: &str, remote_path: &str) -> Result<String, BackendError>;
}

#[derive(Debug, Clone)]
pub enum DocumentInput {
    Bytes(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Markdown,
    Text,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Text => "text",
        }
    }
}

/// Prebuilt model that keeps headings and tables
pub const LAYOUT_MODEL: &str = "prebuilt-layout";

#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    /// Run `model` over the document and return its full text content
    async fn analyze(
        &self,
        input: DocumentInput,
        model: &str,
        format: OutputFormat,
    ) -> Result<String, BackendError>;
}

/// `https://...` or `http://...`
pub fn is_url(location: &str) -> bool {
    location.starts_with("https://") || location.starts_with("http://")
}
