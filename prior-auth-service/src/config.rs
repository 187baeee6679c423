use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::backends::SamplingParams;
use crate::prompts::Prompts;

pub const CONFIG_PATH_ENV: &str = "PA_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Azure,
    /// Any endpoint speaking the chat-completions protocol with a bearer key
    OpenaiCompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    /// Azure resource endpoint, or the full chat-completions URL
    pub endpoint: String,
    pub api_key: String,
    pub chat_deployment: String,
    /// Empty disables the reasoning backend
    pub reasoning_deployment: String,
    pub api_version: String,
    pub reasoning_api_version: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Azure,
            endpoint: String::new(),
            api_key: String::new(),
            chat_deployment: "gpt-4o".to_string(),
            reasoning_deployment: "o1".to_string(),
            api_version: "2024-10-21".to_string(),
            reasoning_api_version: "2024-12-01-preview".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub endpoint: String,
    pub index_name: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentIntelligenceSettings {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    Azure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Unset means inferred from the environment, falling back to local
    pub backend: Option<StorageBackend>,
    pub local_root: String,
    pub account_name: String,
    pub container_name: String,
    pub sas_token: String,
    /// Per-case files go under `{remote_dir_base}/{case_id}/`
    pub remote_dir_base: String,
}

impl StorageSettings {
    pub fn resolved_backend(&self) -> StorageBackend {
        self.backend.clone().unwrap_or_default()
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: None,
            local_root: "./blob-store".to_string(),
            account_name: String::new(),
            container_name: "pre-auth-policies".to_string(),
            sas_token: String::new(),
            remote_dir_base: "pa_processing_runs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub semantic_configuration_name: String,
    pub vector_field: String,
    pub k_nearest_neighbors: u32,
    pub vector_weight: f32,
    pub top: u32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            semantic_configuration_name: "my-semantic-config".to_string(),
            vector_field: "vector".to_string(),
            k_nearest_neighbors: 5,
            vector_weight: 0.5,
            top: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterminationSettings {
    pub sampling: SamplingParams,
    /// Start on the reasoning backend when one is configured
    pub use_reasoning_backend: bool,
    /// Attempts on the secondary backend before the stage fails
    pub max_retries: u32,
    pub reasoning_max_completion_tokens: u32,
}

impl Default for DeterminationSettings {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            use_reasoning_backend: true,
            max_retries: 2,
            reasoning_max_completion_tokens: 15000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub search: SearchSettings,
    pub document_intelligence: DocumentIntelligenceSettings,
    pub storage: StorageSettings,
    pub database_url: Option<String>,
    pub server: ServerSettings,
    pub patient_extraction: SamplingParams,
    pub physician_extraction: SamplingParams,
    pub clinical_extraction: SamplingParams,
    pub query_expansion: SamplingParams,
    pub determination: DeterminationSettings,
    pub summarization: SamplingParams,
    pub retrieval: RetrievalSettings,
    pub prompts: Prompts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            search: SearchSettings::default(),
            document_intelligence: DocumentIntelligenceSettings::default(),
            storage: StorageSettings::default(),
            database_url: None,
            server: ServerSettings::default(),
            patient_extraction: SamplingParams::default().with_max_tokens(2000),
            physician_extraction: SamplingParams::default().with_max_tokens(2000),
            clinical_extraction: SamplingParams::default().with_max_tokens(3000),
            query_expansion: SamplingParams::default().with_max_tokens(1000),
            determination: DeterminationSettings::default(),
            summarization: SamplingParams::default().with_max_tokens(4096),
            retrieval: RetrievalSettings::default(),
            prompts: Prompts::default(),
        }
    }
}

impl Settings {
    /// Read the YAML file named by `PA_CONFIG` (default
    /// `config/settings.yaml`), then apply environment overrides. A missing
    /// file means built-in defaults.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_file(Path::new(&path))?;
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Settings file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = Self::from_yaml_str(&raw)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        info!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Overwrite endpoints and secrets with values from `lookup`
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *target = value;
            }
        };

        set(&mut self.llm.endpoint, "AZURE_OPENAI_ENDPOINT");
        set(&mut self.llm.api_key, "AZURE_OPENAI_KEY");
        set(&mut self.llm.chat_deployment, "AZURE_OPENAI_CHAT_DEPLOYMENT_ID");
        set(
            &mut self.llm.reasoning_deployment,
            "AZURE_OPENAI_REASONING_DEPLOYMENT_ID",
        );
        set(&mut self.llm.api_version, "AZURE_OPENAI_API_VERSION");
        set(
            &mut self.llm.reasoning_api_version,
            "AZURE_OPENAI_API_VERSION_01",
        );
        set(&mut self.search.endpoint, "AZURE_AI_SEARCH_SERVICE_ENDPOINT");
        set(&mut self.search.index_name, "AZURE_SEARCH_INDEX_NAME");
        set(&mut self.search.api_key, "AZURE_AI_SEARCH_ADMIN_KEY");
        set(
            &mut self.document_intelligence.endpoint,
            "AZURE_DOCUMENT_INTELLIGENCE_ENDPOINT",
        );
        set(
            &mut self.document_intelligence.api_key,
            "AZURE_DOCUMENT_INTELLIGENCE_KEY",
        );
        set(&mut self.storage.account_name, "AZURE_STORAGE_ACCOUNT_NAME");
        set(&mut self.storage.sas_token, "AZURE_STORAGE_SAS_TOKEN");
        set(&mut self.storage.local_root, "BLOB_LOCAL_ROOT");

        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if self.storage.backend.is_none()
            && !self.storage.account_name.is_empty()
            && lookup("BLOB_LOCAL_ROOT").is_none()
        {
            self.storage.backend = Some(StorageBackend::Azure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_retrieval_and_determination_constants() {
        let settings = Settings::default();
        assert_eq!(settings.retrieval.k_nearest_neighbors, 5);
        assert_eq!(settings.retrieval.semantic_configuration_name, "my-semantic-config");
        assert_eq!(settings.determination.max_retries, 2);
        assert_eq!(settings.determination.reasoning_max_completion_tokens, 15000);
        assert_eq!(settings.summarization.max_tokens, 4096);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let settings = Settings::from_yaml_str(
            r#"
determination:
  use_reasoning_backend: false
  sampling:
    temperature: 0.2
retrieval:
  top: 3
prompts:
  prior_auth_system: "Custom reviewer"
"#,
        )
        .unwrap();

        assert!(!settings.determination.use_reasoning_backend);
        assert_eq!(settings.determination.max_retries, 2);
        assert_eq!(settings.determination.sampling.temperature, 0.2);
        assert_eq!(settings.retrieval.top, 3);
        assert_eq!(settings.retrieval.vector_field, "vector");
        assert_eq!(settings.prompts.prior_auth_system, "Custom reviewer");
        assert_eq!(settings.prompts.patient_system, Prompts::default().patient_system);
    }

    #[test]
    fn environment_overrides_secrets_and_port() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AZURE_OPENAI_KEY", "secret"),
            ("AZURE_SEARCH_INDEX_NAME", "policies"),
            ("AZURE_STORAGE_ACCOUNT_NAME", "acct"),
            ("PORT", "8080"),
            ("DATABASE_URL", " "),
        ]);
        let mut settings = Settings::default();
        settings.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.llm.api_key, "secret");
        assert_eq!(settings.search.index_name, "policies");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.storage.resolved_backend(), StorageBackend::Azure);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn explicit_storage_backend_is_not_overridden_by_account_name() {
        let mut settings = Settings::from_yaml_str(
            r#"
storage:
  backend: local
"#,
        )
        .unwrap();
        settings.apply_env_overrides(|key| {
            (key == "AZURE_STORAGE_ACCOUNT_NAME").then(|| "acct".to_string())
        });

        assert_eq!(settings.storage.account_name, "acct");
        assert_eq!(settings.storage.resolved_backend(), StorageBackend::Local);
        assert_eq!(Settings::default().storage.resolved_backend(), StorageBackend::Local);
    }
}
