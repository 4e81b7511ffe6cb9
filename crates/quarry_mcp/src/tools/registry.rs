//! Tool Registry - Tool Discovery and Dispatch
//!
//! Maintains the list of available tools and dispatches calls by name.

use super::*;
use anyhow::anyhow;
use std::collections::HashMap;
use tracing::debug;

/// Registry of available MCP tools
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn McpTool>>,
}

impl ToolRegistry {
    /// Create a new tool registry with all tools registered
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };

        registry.register(Box::new(query::RunQueryTool));
        registry.register(Box::new(schema::GetSchemaTool));
        registry.register(Box::new(schema::SchemaCacheStatsTool));
        registry.register(Box::new(schema::EvictSchemaTool));
        registry.register(Box::new(details::FetchDetailsTool));

        debug!("Registered {} tools", registry.tools.len());

        registry
    }

    fn register(&mut self, tool: Box<dyn McpTool>) {
        let name = tool.name().to_string();
        debug!("Registering tool: {}", name);
        self.tools.insert(name, tool);
    }

    /// List all available tools, sorted by name
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Call a tool by name
    pub async fn call_tool(&self, name: &str, args: Value, ctx: &ServerContext) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("Unknown tool: {}", name))?;

        tool.execute(args, ctx).await
    }

    /// Check if a tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::StubExecutor;
    use quarry_logging::BufferedLogger;
    use std::sync::Arc;

    #[test]
    fn test_registry_has_core_tools() {
        let registry = ToolRegistry::new();

        assert!(registry.has_tool("run_query"));
        assert!(registry.has_tool("get_schema"));
        assert!(registry.has_tool("schema_cache_stats"));
        assert!(registry.has_tool("evict_schema"));
        assert!(registry.has_tool("fetch_details"));
    }

    #[test]
    fn test_list_tools_sorted() {
        let registry = ToolRegistry::new();
        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let ctx = ServerContext::new(
            Default::default(),
            Arc::new(StubExecutor::with_columns(&["a"])),
            Arc::new(BufferedLogger::new()),
        );
        let err = ToolRegistry::new()
            .call_tool("drop_everything", Value::Null, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }
}
