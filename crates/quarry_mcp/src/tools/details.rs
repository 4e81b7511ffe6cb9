//! fetch_details - per-entity detail lookups with bounded concurrency

use super::{require_param, McpTool};
use crate::aggregator;
use crate::server::ServerContext;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct FetchDetailsTool;

#[async_trait]
impl McpTool for FetchDetailsTool {
    fn name(&self) -> &'static str {
        "fetch_details"
    }

    fn description(&self) -> &'static str {
        "Fetch detail records for a list of ids; individual failures are reported without failing the call"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1
                }
            },
            "required": ["ids"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> Result<Value> {
        let ids = require_param!(args, "ids", Vec<String>);
        let fetcher = ctx
            .details
            .as_deref()
            .ok_or_else(|| anyhow!("Detail lookups are not configured"))?;

        let outcome =
            aggregator::fetch_details(fetcher, ids.clone(), ctx.config.detail_concurrency).await?;

        let details: Vec<Value> = ids
            .iter()
            .zip(&outcome.results)
            .filter_map(|(id, result)| {
                result
                    .as_ref()
                    .ok()
                    .map(|detail| json!({ "id": id, "detail": detail }))
            })
            .collect();
        let errors: Vec<Value> = outcome
            .errors
            .iter()
            .map(|failure| json!({ "id": ids[failure.index], "error": failure.message }))
            .collect();

        Ok(json!({
            "requested": ids.len(),
            "succeeded": details.len(),
            "details": details,
            "errors": errors,
        }))
    }
}
