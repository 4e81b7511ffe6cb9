//! Tracing layer that forwards events into a [`BufferedLogger`].
//!
//! `Layer::on_event` is synchronous, so events are pushed onto an unbounded
//! channel and a background task drives the (async) logger. Events emitted by
//! this crate are never forwarded, otherwise a failing sink would feed itself.

use crate::buffered::{BufferedLogger, LogEntry, LogLevel};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

/// Receiving end of a [`ForwardingLayer`]
pub type ForwardReceiver = mpsc::UnboundedReceiver<LogEntry>;

pub struct ForwardingLayer {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ForwardingLayer {
    pub fn channel() -> (Self, ForwardReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(OWN_TARGET) {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let mut fields = visitor.fields;
        fields.insert("target".to_string(), Value::String(metadata.target().to_string()));

        let entry = LogEntry::new(LogLevel::from(metadata.level()), visitor.message)
            .with_args(vec![Value::Object(fields)]);

        // receiver gone means the forwarder was shut down
        let _ = self.tx.send(entry);
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }
}

/// Drive forwarded entries into `logger` until every sender is dropped.
pub fn spawn_forwarder(mut rx: ForwardReceiver, logger: Arc<BufferedLogger>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            if let Err(e) = logger.log(entry).await {
                tracing::debug!("Forwarded log entry dropped: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_layer_captures_message_and_fields() {
        let (layer, mut rx) = ForwardingLayer::channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "quarry_mcp::cache", table = "Events", rows = 3u64, "schema refreshed");
        });

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.message, "schema refreshed");
        assert_eq!(entry.args[0]["table"], "Events");
        assert_eq!(entry.args[0]["rows"], 3);
        assert_eq!(entry.args[0]["target"], "quarry_mcp::cache");
    }

    #[test]
    fn test_layer_skips_own_events() {
        let (layer, mut rx) = ForwardingLayer::channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "quarry_logging::buffered", "internal");
        });

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_feeds_logger() {
        let (layer, rx) = ForwardingLayer::channel();
        let logger = Arc::new(BufferedLogger::new());
        let handle = spawn_forwarder(rx, Arc::clone(&logger));

        layer
            .tx
            .send(LogEntry::new(LogLevel::Info, "hello"))
            .unwrap();
        drop(layer);
        handle.await.unwrap();

        assert_eq!(logger.buffered_len().await, 1);
    }
}
