use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{error::Result, storage::CaseRepository};

/// Field added to every persisted case document
pub const CASE_ID_FIELD: &str = "case_id";

/// Role of a single conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One message exchanged with a generation backend.
///
/// `content` is kept as JSON so multi-part messages (text plus images)
/// survive unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: Value,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: Value::String(content.into()),
        }
    }

    pub fn user(content: impl Into<Value>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: Value::String(content.into()),
        }
    }
}

/// Everything accumulated for one case during a run
#[derive(Debug, Clone, Default)]
pub struct CaseEntry {
    /// Stage outputs; keys keep the order in which stages logged them
    pub results: Map<String, Value>,
    /// One entry per logged stage call
    pub conversation: Vec<Vec<ConversationTurn>>,
}

/// In-memory accumulator of stage results, mirrored to a
/// [`CaseRepository`] by [`CaseStore::flush`].
///
/// Entries are keyed by case id. A store handed to a pipeline run is bound
/// to that run's case; merges from concurrent stage futures are serialized
/// by the map's shard lock.
#[derive(Clone)]
pub struct CaseStore {
    case_id: Arc<str>,
    cases: Arc<DashMap<String, CaseEntry>>,
    repository: Arc<dyn CaseRepository>,
}

impl CaseStore {
    pub fn new(case_id: impl Into<String>, repository: Arc<dyn CaseRepository>) -> Self {
        Self {
            case_id: Arc::from(case_id.into()),
            cases: Arc::new(DashMap::new()),
            repository,
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Merge `data` into the case results and record the conversation turns.
    ///
    /// Keys already logged by an earlier step are overwritten if repeated;
    /// steps are expected to use disjoint keys. A non-object payload is
    /// stored whole under the step name.
    pub fn log(&self, data: Value, conversation: Option<Vec<ConversationTurn>>, step: &str) {
        let mut entry = self.cases.entry(self.case_id.to_string()).or_default();

        match data {
            Value::Object(map) => {
                for (key, value) in map {
                    entry.results.insert(key, value);
                }
            }
            other => {
                warn!(
                    case_id = %self.case_id,
                    step = %step,
                    "Logged data is not a mapping, storing under the step name"
                );
                entry.results.insert(step.to_string(), other);
            }
        }

        if let Some(turns) = conversation {
            if !turns.is_empty() {
                entry.conversation.push(turns);
            }
        }

        debug!(case_id = %self.case_id, step = %step, "Data logged for case");
    }

    /// Snapshot of the accumulated results, in logging order
    pub fn results(&self) -> Map<String, Value> {
        self.cases
            .get(self.case_id.as_ref())
            .map(|entry| entry.results.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the conversation log
    pub fn conversation(&self) -> Vec<Vec<ConversationTurn>> {
        self.cases
            .get(self.case_id.as_ref())
            .map(|entry| entry.conversation.clone())
            .unwrap_or_default()
    }

    /// The document that [`CaseStore::flush`] writes: results plus the case id
    pub fn document(&self) -> Option<Map<String, Value>> {
        let entry = self.cases.get(self.case_id.as_ref())?;
        if entry.results.is_empty() {
            return None;
        }
        let mut document = entry.results.clone();
        document.insert(
            CASE_ID_FIELD.to_string(),
            Value::String(self.case_id.to_string()),
        );
        Some(document)
    }

    /// Upsert the case document into the repository, replacing any previous
    /// version. Returns `false` when nothing was accumulated.
    pub async fn flush(&self) -> Result<bool> {
        let Some(document) = self.document() else {
            warn!(case_id = %self.case_id, "No results to store for case");
            return Ok(false);
        };

        self.repository.upsert(&self.case_id, document).await?;
        info!(case_id = %self.case_id, "Case results stored");
        Ok(true)
    }
}
