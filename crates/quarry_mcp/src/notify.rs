//! Client-facing notifications.
//!
//! Two things flow from the server core to the connected client outside the
//! request/response cycle: resource-updated notifications (driven by schema
//! cache events on the bus) and log messages (driven by the buffered logger).
//! Both are handed to the server loop over channels so that synchronous
//! callers never touch the transport directly.

use crate::bus::{EventBus, Subscription, SCHEMA_UPDATED_TOPIC};
use crate::protocol::{methods, JsonRpcMessage, LoggingMessageParams};
use crate::types::schema_uri;
use anyhow::anyhow;
use async_trait::async_trait;
use quarry_logging::{LogEntry, LogLevel, LogSink, SinkError};
use serde_json::json;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Receives "resource changed" signals for the client
pub trait NotificationSink: Send + Sync {
    /// Announce that the resource at `uri` changed. Must not fail when no
    /// client is connected.
    fn send_update_notification(&self, uri: &str);
}

/// Notification sink backed by an unbounded channel drained by the server
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn send_update_notification(&self, uri: &str) {
        if self.tx.send(uri.to_string()).is_err() {
            debug!("No client listening for update of {}", uri);
        }
    }
}

/// Forward every schema-updated event on `bus` to `sink` as a schema
/// resource URI.
pub fn forward_schema_updates(bus: &EventBus, sink: Arc<dyn NotificationSink>) -> Subscription {
    bus.subscribe(SCHEMA_UPDATED_TOPIC, move |event| {
        let table = event
            .payload
            .as_str()
            .ok_or_else(|| anyhow!("schema event without a table name: {}", event.payload))?;
        sink.send_update_notification(&schema_uri(table));
        Ok(())
    })
}

/// Log sink that turns entries into `notifications/message` frames.
///
/// Entries below the client's requested level (see `logging/setLevel`) are
/// accepted and discarded. Once the outbound queue is gone the sink reports
/// [`SinkError::NotConnected`] so the logger buffers again.
pub struct ClientLogSink {
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    min_level: RwLock<LogLevel>,
}

impl ClientLogSink {
    pub fn new(outbound: mpsc::UnboundedSender<JsonRpcMessage>) -> Self {
        Self {
            outbound,
            min_level: RwLock::new(LogLevel::Info),
        }
    }

    pub fn min_level(&self) -> LogLevel {
        *self
            .min_level
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_min_level(&self, level: LogLevel) {
        *self
            .min_level
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
    }
}

#[async_trait]
impl LogSink for ClientLogSink {
    async fn deliver(&self, entry: &LogEntry) -> Result<(), SinkError> {
        if entry.level < self.min_level() {
            return Ok(());
        }
        if self.outbound.is_closed() {
            return Err(SinkError::NotConnected);
        }

        let logger = entry
            .args
            .first()
            .and_then(|fields| fields.get("target"))
            .and_then(|target| target.as_str())
            .map(str::to_string);

        let params = LoggingMessageParams {
            level: entry.level,
            logger,
            data: json!({
                "message": entry.message,
                "timestamp": entry.timestamp,
                "fields": entry.args,
            }),
        };
        let params =
            serde_json::to_value(params).map_err(|e| SinkError::Delivery(e.to_string()))?;

        self.outbound
            .send(JsonRpcMessage::notification(methods::LOG_MESSAGE, Some(params)))
            .map_err(|_| SinkError::NotConnected)
    }
}
