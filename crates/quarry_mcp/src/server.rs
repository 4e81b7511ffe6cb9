//! MCP Server Implementation
//!
//! JSON-RPC 2.0 server for the Model Context Protocol.
//!
//! # Architecture
//!
//! The server drives one [`FramedTransport`]. Inbound frames, schema-updated
//! notifications and forwarded log messages arrive on three channels and are
//! handled by a single loop, so every outbound frame is written from one place
//! and in order.
//!
//! All shared state lives in a [`ServerContext`] built once at startup and
//! handed to every tool by reference.
//!
//! # Example
//!
//! ```ignore
//! let ctx = ServerContext::new(config, executor, logger);
//! let mut server = McpServer::new(ctx);
//! server.run(FramedTransport::stdio()).await?;
//! ```

use crate::bus::EventBus;
use crate::notify::{forward_schema_updates, ChannelNotifier, ClientLogSink};
use crate::prefetch::Prefetcher;
use crate::protocol::{
    methods, ContentBlock, InitializeParams, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, ReadResourceResult, RequestId, Resource, ResourceContents,
    ResourceUriParams, ResourcesCapability, ResourcesListResult, ServerCapabilities, ServerInfo,
    SetLevelParams, ToolCallParams, ToolCallResult, ToolsCapability, ToolsListResult,
    JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use crate::remote::{DetailFetcher, QueryExecutor};
use crate::schema_cache::SchemaCache;
use crate::tools::ToolRegistry;
use crate::transport::{FramedTransport, TransportHandlers};
use crate::types::{schema_uri, table_from_uri, QuarryError};
use anyhow::Result;
use quarry_logging::BufferedLogger;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

/// Analytics endpoint used when none is configured
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

const SCHEMA_MIME_TYPE: &str = "application/json";

/// MCP Server configuration
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Server name (reported in initialize)
    pub server_name: String,

    /// Server version (reported in initialize)
    pub server_version: String,

    /// Base URL of the analytics service
    pub endpoint: String,

    /// Bearer token for the analytics service
    pub api_token: Option<String>,

    /// Usage hint passed to the client as initialize instructions
    pub dataset_hint: Option<String>,

    /// Default timeout for user queries
    pub query_timeout: Duration,

    /// Maximum tool response size in bytes
    pub max_response_bytes: usize,

    /// Concurrent requests for detail fan-out
    pub detail_concurrency: usize,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            server_name: "quarry-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_token: None,
            dataset_hint: None,
            query_timeout: Duration::from_secs(60),
            max_response_bytes: 1024 * 1024, // 1MB
            detail_concurrency: 4,
        }
    }
}

/// Everything request handlers and tools need, built once at startup
pub struct ServerContext {
    pub config: McpServerConfig,
    pub bus: EventBus,
    pub cache: Arc<SchemaCache>,
    pub prefetcher: Prefetcher,
    pub details: Option<Arc<dyn DetailFetcher>>,
    pub logger: Arc<BufferedLogger>,
}

impl ServerContext {
    pub fn new(
        config: McpServerConfig,
        executor: Arc<dyn QueryExecutor>,
        logger: Arc<BufferedLogger>,
    ) -> Self {
        let cache = Arc::new(SchemaCache::new(executor, EventBus::new()));
        Self::with_cache(config, cache, logger)
    }

    /// Build around an existing cache (and its bus)
    pub fn with_cache(
        config: McpServerConfig,
        cache: Arc<SchemaCache>,
        logger: Arc<BufferedLogger>,
    ) -> Self {
        Self {
            config,
            bus: cache.bus().clone(),
            prefetcher: Prefetcher::new(Arc::clone(&cache)),
            cache,
            details: None,
            logger,
        }
    }

    pub fn with_details(mut self, fetcher: Arc<dyn DetailFetcher>) -> Self {
        self.details = Some(fetcher);
        self
    }
}

/// What the transport hands to the server loop
enum Inbound {
    Message(JsonRpcMessage),
    Unreadable(QuarryError),
}

/// MCP Server
pub struct McpServer {
    ctx: ServerContext,
    tools: ToolRegistry,
    initialized: bool,
    /// Resource URIs the client asked to be notified about
    subscriptions: HashSet<String>,
    log_sink: Option<Arc<ClientLogSink>>,
}

impl McpServer {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            tools: ToolRegistry::new(),
            initialized: false,
            subscriptions: HashSet::new(),
            log_sink: None,
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Serve `transport` until the client disconnects.
    pub async fn run<R, W>(&mut self, transport: FramedTransport<R, W>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        let error_tx = inbound_tx.clone();
        transport.start(
            TransportHandlers::new(move |message| {
                let _ = inbound_tx.send(Inbound::Message(message));
            })
            .on_error(move |e| {
                let _ = error_tx.send(Inbound::Unreadable(e));
            }),
        )?;

        let (notifier, mut updates) = ChannelNotifier::channel();
        let updates_subscription = forward_schema_updates(&self.ctx.bus, Arc::new(notifier));

        let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
        self.log_sink = Some(Arc::new(ClientLogSink::new(outbound_tx)));

        info!("MCP server starting");

        let result = self
            .serve(&transport, &mut inbound, &mut updates, &mut outbound)
            .await;

        updates_subscription.unsubscribe();
        self.ctx.logger.detach_sink().await;
        self.log_sink = None;
        transport.close();

        info!("MCP server shutting down");
        result
    }

    async fn serve<R, W>(
        &mut self,
        transport: &FramedTransport<R, W>,
        inbound: &mut UnboundedReceiver<Inbound>,
        updates: &mut UnboundedReceiver<String>,
        outbound: &mut UnboundedReceiver<JsonRpcMessage>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(Inbound::Message(JsonRpcMessage::Request(request))) => {
                        if let Some(response) = self.handle_request(request).await {
                            transport.send(&response).await?;
                        }
                    }
                    Some(Inbound::Message(JsonRpcMessage::Response(response))) => {
                        if response.result.is_none() && response.error.is_none() {
                            // a request that lost its method
                            warn!("Frame {:?} has no method, result or error", response.id);
                            let reply = JsonRpcResponse::error(
                                response.id,
                                JsonRpcError::invalid_request("Request is missing a method"),
                            );
                            transport.send(&reply).await?;
                        } else {
                            debug!("Ignoring client response to {:?}", response.id);
                        }
                    }
                    Some(Inbound::Unreadable(QuarryError::Parse(message))) => {
                        warn!("Unreadable frame: {}", message);
                        let response = JsonRpcResponse::error(
                            RequestId::Null,
                            JsonRpcError::parse_error(format!("Invalid JSON: {}", message)),
                        );
                        transport.send(&response).await?;
                    }
                    Some(Inbound::Unreadable(e)) => {
                        error!("Transport read failed: {}", e);
                    }
                    // reader finished: EOF or read error
                    None => return Ok(()),
                },
                Some(uri) = updates.recv() => {
                    if self.initialized && self.subscriptions.contains(&uri) {
                        let params = serde_json::to_value(ResourceUriParams { uri })?;
                        transport
                            .send(&JsonRpcMessage::notification(methods::RESOURCE_UPDATED, Some(params)))
                            .await?;
                    }
                }
                Some(message) = outbound.recv() => {
                    transport.send(&message).await?;
                }
            }
        }
    }

    /// Handle one request; `None` for notifications, which get no response.
    async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let notification = request.is_notification();
        let id = request.id.clone().unwrap_or_default();

        let outcome = if request.jsonrpc != JSONRPC_VERSION {
            Err(JsonRpcError::invalid_request(format!(
                "Invalid JSON-RPC version: {}",
                request.jsonrpc
            )))
        } else {
            self.dispatch(request).await
        };

        if notification {
            if let Err(e) = outcome {
                debug!("Notification failed: {}", e.message);
            }
            return None;
        }
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(id, e),
        })
    }

    async fn dispatch(&mut self, request: JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let JsonRpcRequest { method, params, .. } = request;
        debug!("Handling {}", method);

        match method.as_str() {
            methods::INITIALIZE => self.handle_initialize(params),
            methods::INITIALIZED => {
                self.handle_initialized().await;
                Ok(Value::Null)
            }
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => to_result(ToolsListResult {
                tools: self.tools.list_tools(),
            }),
            methods::TOOLS_CALL => {
                self.require_initialized()?;
                self.handle_tools_call(params).await
            }
            methods::RESOURCES_LIST => {
                self.require_initialized()?;
                self.handle_resources_list()
            }
            methods::RESOURCES_READ => {
                self.require_initialized()?;
                self.handle_resources_read(params).await
            }
            methods::RESOURCES_SUBSCRIBE => {
                self.require_initialized()?;
                let uri = schema_resource(params)?;
                debug!("Client subscribed to {}", uri);
                self.subscriptions.insert(uri);
                Ok(json!({}))
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                self.require_initialized()?;
                let uri = schema_resource(params)?;
                self.subscriptions.remove(&uri);
                Ok(json!({}))
            }
            methods::LOGGING_SET_LEVEL => {
                self.require_initialized()?;
                let SetLevelParams { level } = parse_params(params, "logging/setLevel")?;
                if let Some(sink) = &self.log_sink {
                    sink.set_min_level(level);
                }
                info!("Client log level set to {}", level.as_str());
                Ok(json!({}))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn require_initialized(&self) -> Result<(), JsonRpcError> {
        if self.initialized {
            Ok(())
        } else {
            Err(JsonRpcError::not_initialized())
        }
    }

    fn handle_initialize(&mut self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = parse_params(params, "initialize")?;

        info!(
            "Initialize from {} v{} (protocol {})",
            params.client_info.name, params.client_info.version, params.protocol_version
        );

        self.initialized = true;

        to_result(InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                resources: Some(ResourcesCapability {
                    subscribe: true,
                    list_changed: false,
                }),
                logging: Some(json!({})),
            },
            server_info: ServerInfo {
                name: self.ctx.config.server_name.clone(),
                version: self.ctx.config.server_version.clone(),
            },
            instructions: self.ctx.config.dataset_hint.clone(),
        })
    }

    /// The client is ready for notifications: start delivering logs.
    async fn handle_initialized(&mut self) {
        if !self.initialized {
            warn!("Client sent initialized before initialize");
            return;
        }
        if let Some(sink) = &self.log_sink {
            let flushed = self.ctx.logger.attach_sink(sink.clone()).await;
            debug!("Client log sink attached, {} buffered entries flushed", flushed);
        }
    }

    async fn handle_tools_call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ToolCallParams = parse_params(params, "tool call")?;

        info!("Tool call: {}", params.name);

        let tool_result = match self
            .tools
            .call_tool(&params.name, params.arguments, &self.ctx)
            .await
        {
            Ok(value) => self.budgeted(value),
            Err(e) => {
                error!("Tool {} failed: {:#}", params.name, e);
                ToolCallResult {
                    content: vec![ContentBlock::text(format!("Error: {:#}", e))],
                    is_error: true,
                }
            }
        };

        to_result(tool_result)
    }

    /// Wrap a tool's output, replacing it with a truncation notice when it
    /// exceeds the response budget.
    fn budgeted(&self, value: Value) -> ToolCallResult {
        let json = match serde_json::to_string(&value) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize tool result: {}", e);
                return ToolCallResult {
                    content: vec![ContentBlock::text(format!(
                        "{{\"error\": \"Serialization failed: {}\"}}",
                        e
                    ))],
                    is_error: true,
                };
            }
        };

        let max_bytes = self.ctx.config.max_response_bytes;
        if json.len() <= max_bytes {
            return ToolCallResult {
                content: vec![ContentBlock::text(json)],
                is_error: false,
            };
        }

        warn!("Response truncated from {} to {} bytes", json.len(), max_bytes);
        let notice = json!({
            "truncated": true,
            "max_bytes": max_bytes,
            "original_bytes": json.len(),
            "message": "Response exceeded size limit. Narrow the query or add a LIMIT clause.",
        });
        // Marked as an error so the agent knows to narrow the query
        ToolCallResult {
            content: vec![ContentBlock::text(notice.to_string())],
            is_error: true,
        }
    }

    fn handle_resources_list(&self) -> Result<Value, JsonRpcError> {
        let resources = self
            .ctx
            .cache
            .cached_tables()
            .into_iter()
            .map(|table| Resource {
                uri: schema_uri(&table),
                description: Some(format!("Cached column list of {}", table)),
                name: table,
                mime_type: Some(SCHEMA_MIME_TYPE.to_string()),
            })
            .collect();

        to_result(ResourcesListResult { resources })
    }

    async fn handle_resources_read(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let uri = schema_resource(params)?;
        let table = table_from_uri(&uri).unwrap_or_default();

        let columns = self
            .ctx
            .cache
            .get_schema_shared(table)
            .await
            .map_err(|e| JsonRpcError::from_error(&e))?;
        let text = json!({ "table": table, "columns": columns }).to_string();

        to_result(ReadResourceResult {
            contents: vec![ResourceContents {
                uri: uri.clone(),
                mime_type: SCHEMA_MIME_TYPE.to_string(),
                text,
            }],
        })
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>, what: &str) -> Result<T, JsonRpcError> {
    match params {
        Some(params) => serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid {} params: {}", what, e))),
        None => Err(JsonRpcError::invalid_params(format!("Missing {} params", what))),
    }
}

/// URI of a schema resource from `{ "uri": .. }` params
fn schema_resource(params: Option<Value>) -> Result<String, JsonRpcError> {
    let ResourceUriParams { uri } = parse_params(params, "resource")?;
    if table_from_uri(&uri).is_none() {
        return Err(JsonRpcError::invalid_params(format!("Unknown resource: {}", uri)));
    }
    Ok(uri)
}

fn to_result<T: Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::internal_error(format!("Failed to serialize result: {}", e)))
}
