use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{FlowError, Result};

/// Scratch space for handing typed values from one stage to the next.
///
/// The context is owned by a single pipeline run. Stage outputs that must
/// survive the run go through [`crate::CaseStore`] instead.
#[derive(Clone, Debug)]
pub struct Context {
    case_id: Arc<str>,
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: Arc::from(case_id.into()),
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub async fn set(&self, key: impl Into<String>, value: impl serde::Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.into(), value);
        Ok(())
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }

    /// Non-async read, usable from edge conditions and sync helpers
    pub fn get_sync<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Like [`Context::get`] but a missing or mistyped value is an error
    pub async fn require<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| FlowError::ContextError(format!("{} not found in context", key)))?;
        serde_json::from_value(value)
            .map_err(|e| FlowError::ContextError(format!("{} has unexpected shape: {}", key, e)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn require_reports_missing_keys() {
        let context = Context::new("case-1");
        context.set("count", 3u32).await.unwrap();

        let count: u32 = context.require("count").await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(context.case_id(), "case-1");

        let missing = context.require::<String>("absent").await;
        assert!(matches!(missing, Err(FlowError::ContextError(_))));

        let mistyped = context.require::<String>("count").await;
        assert!(matches!(mistyped, Err(FlowError::ContextError(_))));
    }
}
