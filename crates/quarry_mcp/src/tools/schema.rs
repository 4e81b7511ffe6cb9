//! Schema cache tools: get_schema, schema_cache_stats, evict_schema

use super::{require_param, McpTool};
use crate::server::ServerContext;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct GetSchemaTool;

#[async_trait]
impl McpTool for GetSchemaTool {
    fn name(&self) -> &'static str {
        "get_schema"
    }

    fn description(&self) -> &'static str {
        "List the columns of a table (served from a 24 hour cache)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string", "description": "Table name" }
            },
            "required": ["table"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> Result<Value> {
        let table = require_param!(args, "table", String);

        let columns = ctx.cache.get_schema_shared(&table).await?;
        let entry = ctx.cache.entry(&table);

        Ok(json!({
            "table": table,
            "columns": columns,
            "cached_at": entry.as_ref().map(|e| e.cached_at),
            "expires_at": entry.as_ref().map(|e| e.expires_at),
        }))
    }
}

pub struct SchemaCacheStatsTool;

#[async_trait]
impl McpTool for SchemaCacheStatsTool {
    fn name(&self) -> &'static str {
        "schema_cache_stats"
    }

    fn description(&self) -> &'static str {
        "Show cached tables with column counts and remaining TTL"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> Result<Value> {
        Ok(serde_json::to_value(ctx.cache.stats())?)
    }
}

pub struct EvictSchemaTool;

#[async_trait]
impl McpTool for EvictSchemaTool {
    fn name(&self) -> &'static str {
        "evict_schema"
    }

    fn description(&self) -> &'static str {
        "Drop a table's cached schema, or every cached schema when no table is given"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string", "description": "Table to evict; omit to clear the cache" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> Result<Value> {
        match args.get("table").and_then(Value::as_str) {
            Some(table) => {
                ctx.cache.evict(table);
                Ok(json!({ "evicted": [table] }))
            }
            None => {
                let tables = ctx.cache.cached_tables();
                let count = ctx.cache.evict_all();
                Ok(json!({ "evicted": tables, "count": count }))
            }
        }
    }
}
