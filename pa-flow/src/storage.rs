use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sqlx::{PgPool, Row, postgres::PgPoolOptions, types::Json};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

/// Filter for reading persisted case documents
#[derive(Debug, Clone, Default)]
pub struct CaseQuery {
    pub case_id: Option<String>,
    pub limit: Option<usize>,
}

impl CaseQuery {
    pub fn by_case_id(case_id: impl Into<String>) -> Self {
        Self {
            case_id: Some(case_id.into()),
            limit: None,
        }
    }
}

/// Durable store holding one document per case
#[async_trait]
pub trait CaseRepository: Send + Sync {
    /// Insert the document for `case_id`, or replace it entirely if present
    async fn upsert(&self, case_id: &str, document: Map<String, Value>) -> Result<()>;
    async fn query(&self, filter: &CaseQuery) -> Result<Vec<Value>>;
    async fn get(&self, case_id: &str) -> Result<Option<Value>> {
        let mut docs = self.query(&CaseQuery::by_case_id(case_id)).await?;
        Ok(docs.pop())
    }
    async fn delete(&self, case_id: &str) -> Result<()>;
}

/// In-memory implementation of CaseRepository
#[derive(Default)]
pub struct InMemoryCaseRepository {
    documents: Arc<DashMap<String, Value>>,
}

impl InMemoryCaseRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaseRepository for InMemoryCaseRepository {
    async fn upsert(&self, case_id: &str, document: Map<String, Value>) -> Result<()> {
        self.documents
            .insert(case_id.to_string(), Value::Object(document));
        Ok(())
    }

    async fn query(&self, filter: &CaseQuery) -> Result<Vec<Value>> {
        let docs = match &filter.case_id {
            Some(id) => self
                .documents
                .get(id)
                .map(|entry| vec![entry.clone()])
                .unwrap_or_default(),
            None => self
                .documents
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };
        Ok(match filter.limit {
            Some(limit) => docs.into_iter().take(limit).collect(),
            None => docs,
        })
    }

    async fn delete(&self, case_id: &str) -> Result<()> {
        self.documents.remove(case_id);
        Ok(())
    }
}

/// PostgreSQL implementation of CaseRepository, one JSONB row per case
pub struct PostgresCaseRepository {
    pool: PgPool,
}

impl PostgresCaseRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let repository = Self { pool };
        repository.migrate().await?;
        info!("Connected to PostgreSQL case repository");
        Ok(repository)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pa_cases (
                case_id     TEXT PRIMARY KEY,
                document    JSONB NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CaseRepository for PostgresCaseRepository {
    async fn upsert(&self, case_id: &str, document: Map<String, Value>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pa_cases (case_id, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (case_id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(case_id)
        .bind(Json(Value::Object(document)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, filter: &CaseQuery) -> Result<Vec<Value>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = match &filter.case_id {
            Some(id) => {
                sqlx::query("SELECT document FROM pa_cases WHERE case_id = $1 LIMIT $2")
                    .bind(id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT document FROM pa_cases ORDER BY updated_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| {
                let Json(document): Json<Value> = row.try_get("document")?;
                Ok(document)
            })
            .collect()
    }

    async fn delete(&self, case_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pa_cases WHERE case_id = $1")
            .bind(case_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_repository_filters_and_limits() {
        let repository = InMemoryCaseRepository::new();
        for id in ["a", "b", "c"] {
            let mut doc = Map::new();
            doc.insert("case_id".into(), json!(id));
            repository.upsert(id, doc).await.unwrap();
        }

        assert_eq!(repository.query(&CaseQuery::default()).await.unwrap().len(), 3);
        let limited = CaseQuery {
            case_id: None,
            limit: Some(2),
        };
        assert_eq!(repository.query(&limited).await.unwrap().len(), 2);

        let b = repository.get("b").await.unwrap().unwrap();
        assert_eq!(b["case_id"], "b");

        repository.delete("b").await.unwrap();
        assert!(repository.get("b").await.unwrap().is_none());
    }
}
