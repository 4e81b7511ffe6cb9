//! MCP (Model Context Protocol) Server for the Quarry analytics bridge
//!
//! This crate implements an MCP server that lets AI assistants query a remote
//! analytics service, with table schemas cached locally and kept warm.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    AI Assistant (MCP client)                     │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               │ MCP Protocol (newline-framed JSON-RPC)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 crates/quarry_mcp/                               │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                    Core Subsystems                        │   │
//! │  ├──────────────────────────────────────────────────────────┤   │
//! │  │  Transport    │ framing, backpressure, lifecycle         │   │
//! │  │  Server       │ JSON-RPC dispatch, resources, logging    │   │
//! │  │  Schema Cache │ 24h TTL column lists, update events      │   │
//! │  │  Prefetcher   │ warm schemas before a query runs         │   │
//! │  │  Aggregator   │ bounded fan-out with partial failures    │   │
//! │  │  Event Bus    │ prefix pub/sub, isolated handlers        │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                    Tool Implementations                   │   │
//! │  ├──────────────────────────────────────────────────────────┤   │
//! │  │  Query        │ run_query                                │   │
//! │  │  Schema       │ get_schema, schema_cache_stats,          │   │
//! │  │               │ evict_schema                             │   │
//! │  │  Details      │ fetch_details                            │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               │ HTTP (reqwest)
//!                               ▼
//!                     Remote analytics service
//! ```
//!
//! # Design Principles
//!
//! 1. **Prefetch is advisory:** a failed schema lookup never fails the user's
//!    query.
//!
//! 2. **Explicit wiring:** one [`ServerContext`] built at startup; no global
//!    singletons.
//!
//! 3. **Stdout is the wire:** operational logs go to stderr, a log file, or
//!    the client as `notifications/message`.

pub mod aggregator;
pub mod bus;
pub mod notify;
pub mod prefetch;
pub mod protocol;
pub mod remote;
pub mod schema_cache;
pub mod server;
pub mod single_flight;
pub mod tools;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use bus::{EventBus, EventEnvelope, Subscription, SCHEMA_UPDATED_TOPIC};
pub use protocol::{JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use remote::{DetailFetcher, HttpDetailFetcher, HttpQueryExecutor, QueryExecutor};
pub use schema_cache::{Clock, ManualClock, SchemaCache, SchemaCacheStats, SystemClock};
pub use server::{McpServer, McpServerConfig, ServerContext};
pub use transport::{FramedTransport, TransportHandlers, TransportState};
pub use types::{QuarryError, QueryResult, Result};
