//! CLI command implementations

pub mod mcp;
