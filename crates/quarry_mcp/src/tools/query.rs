//! run_query - remote query with schema prefetch
//!
//! Every table the query reads from has its schema warmed first; prefetch
//! problems are reported alongside the result but never fail the call.

use super::McpTool;
use crate::server::ServerContext;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::info;

pub struct RunQueryTool;

#[derive(Debug, Deserialize)]
struct RunQueryArgs {
    query: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

const MAX_TIMEOUT_MS: u64 = 300_000;

#[async_trait]
impl McpTool for RunQueryTool {
    fn name(&self) -> &'static str {
        "run_query"
    }

    fn description(&self) -> &'static str {
        "Run a query against the analytics service. Schemas of referenced tables are cached for 24 hours."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Query text, e.g. SELECT count(*) FROM Events"
                },
                "timeout_ms": {
                    "type": "integer",
                    "maximum": MAX_TIMEOUT_MS
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> Result<Value> {
        let args: RunQueryArgs = serde_json::from_value(args)?;
        if args.query.trim().is_empty() {
            return Err(anyhow!("Query must not be empty"));
        }

        let timeout = args
            .timeout_ms
            .map(|ms| Duration::from_millis(ms.min(MAX_TIMEOUT_MS)))
            .unwrap_or(ctx.config.query_timeout);

        let start = Instant::now();
        let (result, prefetch) = ctx
            .prefetcher
            .execute_with_prefetch(&args.query, timeout)
            .await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            "Query returned {} rows in {} ms ({} schemas warmed)",
            result.row_count(),
            elapsed_ms,
            prefetch.warmed.len()
        );

        Ok(json!({
            "row_count": result.row_count(),
            "rows": result.rows,
            "metadata": result.metadata,
            "elapsed_ms": elapsed_ms,
            "prefetch": prefetch,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::StubExecutor;
    use quarry_logging::BufferedLogger;
    use std::sync::Arc;

    fn context(executor: StubExecutor) -> ServerContext {
        ServerContext::new(
            Default::default(),
            Arc::new(executor),
            Arc::new(BufferedLogger::new()),
        )
    }

    #[tokio::test]
    async fn test_run_query_reports_prefetch() {
        let ctx = context(StubExecutor::with_columns(&["ts", "level"]));

        let value = RunQueryTool
            .execute(json!({"query": "SELECT * FROM Events"}), &ctx)
            .await
            .unwrap();

        assert_eq!(value["row_count"], 2);
        assert_eq!(value["prefetch"]["warmed"], json!(["Events"]));
        assert!(ctx.cache.is_fresh("Events"));
    }

    #[tokio::test]
    async fn test_run_query_requires_query() {
        let ctx = context(StubExecutor::with_columns(&[]));

        assert!(RunQueryTool.execute(json!({}), &ctx).await.is_err());
        assert!(RunQueryTool
            .execute(json!({"query": "   "}), &ctx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_query_surfaces_remote_failure() {
        let ctx = context(StubExecutor::failing("connection refused"));

        let err = RunQueryTool
            .execute(json!({"query": "SELECT 1"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
