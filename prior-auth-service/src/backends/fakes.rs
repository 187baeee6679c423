//! In-process stand-ins for the collaborators, used by stage and workflow tests.

use async_trait::async_trait;
use dashmap::DashMap;
use pa_flow::ConversationTurn;
use serde_json::Value;
use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::{
    BackendError, BlobStore, Completion, DocumentAnalyzer, DocumentInput, GenerationBackend,
    GenerationRequest, OutputFormat, SearchBackend, SearchHit, SearchRequest, StageOutput,
};

pub(crate) type Reply = Result<Completion, BackendError>;

pub(crate) fn output(response: Value) -> Reply {
    Ok(Completion::Output(StageOutput {
        conversation: vec![
            ConversationTurn::user("prompt"),
            ConversationTurn::assistant(response.to_string()),
        ],
        response,
    }))
}

pub(crate) fn text(response: &str) -> Reply {
    output(Value::String(response.to_string()))
}

pub(crate) fn context_length() -> Reply {
    Ok(Completion::ContextLengthExceeded)
}

pub(crate) fn failure(message: &str) -> Reply {
    Err(BackendError::Status {
        service: "fake",
        status: 500,
        body: message.to_string(),
    })
}

enum Mode {
    Script(Mutex<VecDeque<Reply>>),
    Respond(Box<dyn Fn(&GenerationRequest) -> Reply + Send + Sync>),
}

/// Generation backend that either replays a script or answers per request
pub(crate) struct FakeGeneration {
    name: String,
    mode: Mode,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeGeneration {
    pub(crate) fn scripted(name: &str, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            mode: Mode::Script(Mutex::new(replies.into())),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn responding(
        name: &str,
        respond: impl Fn(&GenerationRequest) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            mode: Mode::Respond(Box::new(respond)),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GenerationBackend for FakeGeneration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: GenerationRequest) -> Result<Completion, BackendError> {
        let reply = match &self.mode {
            Mode::Script(script) => script
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .unwrap_or_else(|| failure("script exhausted")),
            Mode::Respond(respond) => respond(&request),
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        reply
    }
}

/// Search backend returning canned hits, or failing
pub(crate) struct FakeSearch {
    hits: Option<Vec<SearchHit>>,
    pub(crate) queries: Mutex<Vec<SearchRequest>>,
}

impl FakeSearch {
    pub(crate) fn with_paths(paths: &[&str]) -> Arc<Self> {
        let hits = paths
            .iter()
            .map(|p| SearchHit {
                parent_path: Some(p.to_string()),
                ..SearchHit::default()
            })
            .collect();
        Arc::new(Self {
            hits: Some(hits),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            hits: None,
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SearchBackend for FakeSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, BackendError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(request.clone());
        }
        self.hits
            .clone()
            .ok_or_else(|| BackendError::Config("search index unavailable".to_string()))
    }
}

/// Blob store holding everything in memory
#[derive(Default)]
pub(crate) struct MemoryBlobStore {
    pub(crate) blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub(crate) fn with_blob(location: &str, bytes: &[u8]) -> Arc<Self> {
        let store = Self::default();
        store.blobs.insert(location.to_string(), bytes.to_vec());
        Arc::new(store)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn download_bytes(&self, location: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.blobs.get(location).map(|b| b.clone()))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<String, BackendError> {
        let bytes = tokio::fs::read(local_path).await?;
        self.blobs.insert(remote_path.to_string(), bytes);
        Ok(remote_path.to_string())
    }

    async fn copy(&self, source_url: &str, remote_path: &str) -> Result<String, BackendError> {
        let bytes = self
            .blobs
            .get(source_url)
            .map(|b| b.clone())
            .ok_or_else(|| BackendError::NotFound(source_url.to_string()))?;
        self.blobs.insert(remote_path.to_string(), bytes);
        Ok(remote_path.to_string())
    }
}

/// Analyzer that returns fixed content, or fails
pub(crate) struct FakeAnalyzer {
    content: Option<String>,
    pub(crate) calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub(crate) fn returning(content: &str) -> Arc<Self> {
        Arc::new(Self {
            content: Some(content.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            content: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentAnalyzer for FakeAnalyzer {
    async fn analyze(
        &self,
        _input: DocumentInput,
        _model: &str,
        _format: OutputFormat,
    ) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.content
            .clone()
            .ok_or_else(|| BackendError::Timeout("layout analysis".to_string()))
    }
}
