//! Core types for the MCP server
//!
//! Error taxonomy shared by every subsystem, plus the result shape returned by
//! the remote query executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by the cache, transport and remote collaborators
#[derive(Debug, Error)]
pub enum QuarryError {
    /// The remote executor or detail fetcher could not complete
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// A framed message could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Operation not valid in the current state (or unknown entity)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    /// Get the JSON-RPC error code for this error type
    pub fn error_code(&self) -> i32 {
        match self {
            QuarryError::RemoteUnavailable(_) => -32003, // Custom: remote failure
            QuarryError::Parse(_) => -32700,             // Parse error
            QuarryError::InvalidState(_) => -32002,      // Custom: invalid state
            QuarryError::Serialization(_) => -32700,     // Parse error
            QuarryError::Io(_) => -32603,                // Internal error
        }
    }

    pub fn remote(message: impl std::fmt::Display) -> Self {
        QuarryError::RemoteUnavailable(message.to_string())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        QuarryError::InvalidState(message.into())
    }
}

impl Clone for QuarryError {
    /// Wrapped library errors are rebuilt from their kind and message.
    fn clone(&self) -> Self {
        match self {
            QuarryError::RemoteUnavailable(m) => QuarryError::RemoteUnavailable(m.clone()),
            QuarryError::Parse(m) => QuarryError::Parse(m.clone()),
            QuarryError::InvalidState(m) => QuarryError::InvalidState(m.clone()),
            QuarryError::Serialization(e) => {
                QuarryError::Serialization(serde::de::Error::custom(e.to_string()))
            }
            QuarryError::Io(e) => QuarryError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type Result<T, E = QuarryError> = std::result::Result<T, E>;

// =============================================================================
// Remote Query Results
// =============================================================================

/// Rows and metadata returned by the remote analytics service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,

    #[serde(default)]
    pub metadata: Value,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            rows,
            metadata: Value::Null,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

// =============================================================================
// Resource URIs
// =============================================================================

/// URI scheme prefix for cached table schemas
pub const SCHEMA_URI_PREFIX: &str = "quarry://schemas/";

/// Resource URI for a table schema
pub fn schema_uri(table: &str) -> String {
    format!("{}{}", SCHEMA_URI_PREFIX, table)
}

/// Table name from a schema resource URI
pub fn table_from_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(SCHEMA_URI_PREFIX)
        .filter(|table| !table.is_empty())
}
