//! Remote collaborators: the query executor and the per-entity detail fetcher.
//!
//! Both are traits so the cache, prefetcher and aggregator can be driven by
//! stubs in tests. [`HttpQueryExecutor`] is the production implementation,
//! talking JSON over HTTP to the analytics service.

use crate::types::{QuarryError, QueryResult, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Runs a query against the remote analytics service
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, timeout: Duration) -> Result<QueryResult>;
}

/// Fetches one detail record per entity (dashboards, monitors, ...)
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_details(&self, entity_id: &str) -> Result<Value>;
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
}

/// Query executor backed by the service's HTTP API
pub struct HttpQueryExecutor {
    endpoint: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpQueryExecutor {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, query: &str, timeout: Duration) -> Result<QueryResult> {
        debug!("Executing remote query ({} bytes)", query.len());

        let response = self
            .authorized(self.http_client.post(self.url("query")))
            .timeout(timeout)
            .json(&QueryRequest { query })
            .send()
            .await
            .map_err(|e| QuarryError::remote(format!("query request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QuarryError::remote(format!(
                "query rejected with {}: {}",
                status, body
            )));
        }

        response
            .json::<QueryResult>()
            .await
            .map_err(|e| QuarryError::remote(format!("invalid query response: {}", e)))
    }
}

/// Detail fetcher reading `GET {endpoint}/{collection}/{id}`
pub struct HttpDetailFetcher {
    executor: HttpQueryExecutor,
    collection: String,
    timeout: Duration,
}

impl HttpDetailFetcher {
    pub fn new(executor: HttpQueryExecutor, collection: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            collection: collection.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DetailFetcher for HttpDetailFetcher {
    async fn fetch_details(&self, entity_id: &str) -> Result<Value> {
        let url = self
            .executor
            .url(&format!("{}/{}", self.collection, entity_id));

        let response = self
            .executor
            .authorized(self.executor.http_client.get(url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| QuarryError::remote(format!("detail request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(QuarryError::invalid_state(format!(
                "unknown {} '{}'",
                self.collection, entity_id
            )));
        }
        if !status.is_success() {
            return Err(QuarryError::remote(format!(
                "detail request for {} rejected with {}",
                entity_id, status
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| QuarryError::remote(format!("invalid detail response: {}", e)))
    }
}

/// In-memory collaborators for tests
#[cfg(test)]
pub mod testing {
    use super::*;
    use serde_json::{json, Map};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Executor returning a fixed column list, recording every query
    pub struct StubExecutor {
        columns: Vec<String>,
        per_table: HashMap<String, Vec<String>>,
        failure: Option<String>,
        failing_tables: Vec<String>,
        delay: Option<Duration>,
        queries: Mutex<Vec<String>>,
    }

    impl StubExecutor {
        pub fn with_columns(columns: &[&str]) -> Self {
            Self {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                per_table: HashMap::new(),
                failure: None,
                failing_tables: Vec::new(),
                delay: None,
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                failure: Some(message.to_string()),
                ..Self::with_columns(&[])
            }
        }

        pub fn with_table(mut self, table: &str, columns: &[&str]) -> Self {
            self.per_table.insert(
                table.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
            self
        }

        pub fn failing_for(mut self, table: &str) -> Self {
            self.failing_tables.push(table.to_string());
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.queries.lock().unwrap().len()
        }

        pub fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for StubExecutor {
        async fn execute(&self, query: &str, _timeout: Duration) -> Result<QueryResult> {
            self.queries.lock().unwrap().push(query.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.failure {
                return Err(QuarryError::remote(message));
            }
            if self
                .failing_tables
                .iter()
                .any(|t| query.contains(&format!("'{}'", t)))
            {
                return Err(QuarryError::remote("describe failed"));
            }

            let columns = self
                .per_table
                .iter()
                .find(|(table, _)| query.contains(&format!("'{}'", table)))
                .map(|(_, columns)| columns)
                .unwrap_or(&self.columns);

            let rows = columns
                .iter()
                .map(|c| {
                    let mut row = Map::new();
                    row.insert("column_name".to_string(), json!(c));
                    row
                })
                .collect();
            Ok(QueryResult::from_rows(rows))
        }
    }
}
