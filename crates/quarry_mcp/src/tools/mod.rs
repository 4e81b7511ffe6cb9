//! MCP Tool Implementations
//!
//! Each tool exposes one capability of the analytics bridge. Tools are
//! registered in the [`ToolRegistry`] and dispatched by name.
//!
//! # Tools
//!
//! - `run_query`: warm table schemas, then run a query remotely
//! - `get_schema`: column list for one table (cached for 24h)
//! - `schema_cache_stats`: what the schema cache currently holds
//! - `evict_schema`: drop one table or every table from the cache
//! - `fetch_details`: bounded fan-out detail lookups by id

mod details;
mod query;
mod registry;
mod schema;

pub use registry::ToolRegistry;

use crate::protocol::ToolDefinition;
use crate::server::ServerContext;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Trait for MCP tools
///
/// Tools are stateless; everything they touch comes in through the
/// [`ServerContext`].
#[async_trait]
pub trait McpTool: Send + Sync {
    /// Tool name (e.g., "run_query")
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ServerContext) -> Result<Value>;

    /// Get the tool definition for tools/list
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

// Macro to reduce boilerplate for tool parameter handling
macro_rules! require_param {
    ($args:expr, $name:literal, $ty:ty) => {
        serde_json::from_value::<$ty>($args.get($name).cloned().unwrap_or(Value::Null))
            .map_err(|e| anyhow::anyhow!("Invalid parameter '{}': {}", $name, e))?
    };
    ($args:expr, $name:literal) => {
        $args
            .get($name)
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {}", $name))?
    };
}

pub(crate) use require_param;
