//! Buffered Delivery Logger
//!
//! Forwards log entries to a sink (the MCP client, in practice). While no sink
//! is attached, entries are queued in a byte-bounded buffer; once a sink
//! attaches, the backlog is flushed in original order.
//!
//! # Buffer bound
//!
//! The buffer never holds more than [`MAX_BUFFER_BYTES`] (approximate). When a
//! new entry would exceed it, the oldest entries are evicted first. Overflow is
//! not an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Upper bound on buffered log bytes while no sink is attached (4 MiB).
pub const MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Fixed per-entry overhead added to the approximate size (timestamp, framing).
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Log levels, ordered by severity (MCP `logging` levels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Alert => "alert",
            LogLevel::Emergency => "emergency",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "notice" => Ok(LogLevel::Notice),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "alert" => Ok(LogLevel::Alert),
            "emergency" => Ok(LogLevel::Emergency),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// A single log message waiting for (or undergoing) delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            args: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Approximate in-memory footprint used for the buffer bound.
    pub fn approx_size(&self) -> usize {
        let args: usize = self
            .args
            .iter()
            .map(|arg| serde_json::to_string(arg).map(|s| s.len()).unwrap_or(0))
            .sum();
        self.message.len() + args + self.level.as_str().len() + ENTRY_OVERHEAD_BYTES
    }
}

/// Errors reported by a [`LogSink`]
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink exists but cannot take messages yet (transport not connected).
    #[error("log sink is not connected")]
    NotConnected,

    #[error("log delivery failed: {0}")]
    Delivery(String),
}

/// Destination for forwarded log entries
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn deliver(&self, entry: &LogEntry) -> Result<(), SinkError>;
}

/// Byte-bounded FIFO of pending entries
#[derive(Debug)]
struct LogBuffer {
    entries: VecDeque<(LogEntry, usize)>,
    total_bytes: usize,
    max_bytes: usize,
}

impl LogBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append, evicting oldest entries until the new one fits.
    ///
    /// Returns the number of evicted entries.
    fn push(&mut self, entry: LogEntry) -> usize {
        let size = entry.approx_size();
        if size > self.max_bytes {
            warn!(
                "Dropping log entry of {} bytes, larger than buffer bound {}",
                size, self.max_bytes
            );
            return 0;
        }

        let mut evicted = 0;
        while self.total_bytes + size > self.max_bytes {
            match self.entries.pop_front() {
                Some((_, old_size)) => {
                    self.total_bytes -= old_size;
                    evicted += 1;
                }
                None => break,
            }
        }

        self.total_bytes += size;
        self.entries.push_back((entry, size));
        evicted
    }

    fn pop_front(&mut self) -> Option<(LogEntry, usize)> {
        let (entry, size) = self.entries.pop_front()?;
        self.total_bytes -= size;
        Some((entry, size))
    }

    /// Put an entry back at the head (delivery was refused).
    fn restore_front(&mut self, entry: LogEntry, size: usize) {
        self.total_bytes += size;
        self.entries.push_front((entry, size));
    }
}

struct LoggerState {
    sink: Option<Arc<dyn LogSink>>,
    buffer: LogBuffer,
}

/// Producer/consumer log forwarder with an in-memory backlog
pub struct BufferedLogger {
    state: Mutex<LoggerState>,
}

impl BufferedLogger {
    pub fn new() -> Self {
        Self::with_max_bytes(MAX_BUFFER_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(LoggerState {
                sink: None,
                buffer: LogBuffer::new(max_bytes),
            }),
        }
    }

    /// Deliver an entry, or buffer it if there is nowhere to deliver to.
    ///
    /// A `NotConnected` refusal from the sink falls back to buffering; any
    /// other delivery failure is returned.
    pub async fn log(&self, entry: LogEntry) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;

        if let Some(sink) = state.sink.clone() {
            match sink.deliver(&entry).await {
                Ok(()) => return Ok(()),
                Err(SinkError::NotConnected) => {
                    debug!("Log sink not connected, buffering entry");
                }
                Err(e) => return Err(e),
            }
        }

        let evicted = state.buffer.push(entry);
        if evicted > 0 {
            debug!("Evicted {} buffered log entries", evicted);
        }
        Ok(())
    }

    /// Attach a sink and flush the backlog into it in original order.
    ///
    /// Returns the number of entries delivered. Flushing stops at the first
    /// `NotConnected` refusal; the remaining entries stay buffered. Entries
    /// failing with any other error are dropped.
    pub async fn attach_sink(&self, sink: Arc<dyn LogSink>) -> usize {
        let mut state = self.state.lock().await;
        state.sink = Some(Arc::clone(&sink));

        let mut delivered = 0;
        while let Some((entry, size)) = state.buffer.pop_front() {
            match sink.deliver(&entry).await {
                Ok(()) => delivered += 1,
                Err(SinkError::NotConnected) => {
                    state.buffer.restore_front(entry, size);
                    break;
                }
                Err(e) => {
                    warn!("Dropping buffered log entry: {}", e);
                }
            }
        }

        if delivered > 0 {
            debug!("Flushed {} buffered log entries", delivered);
        }
        delivered
    }

    /// Detach the current sink; subsequent entries are buffered.
    pub async fn detach_sink(&self) {
        self.state.lock().await.sink = None;
    }

    pub async fn has_sink(&self) -> bool {
        self.state.lock().await.sink.is_some()
    }

    pub async fn buffered_len(&self) -> usize {
        self.state.lock().await.buffer.entries.len()
    }

    pub async fn buffered_bytes(&self) -> usize {
        self.state.lock().await.buffer.total_bytes
    }

    /// Snapshot of buffered entries, oldest first
    pub async fn buffered_entries(&self) -> Vec<LogEntry> {
        self.state
            .lock()
            .await
            .buffer
            .entries
            .iter()
            .map(|(entry, _)| entry.clone())
            .collect()
    }
}

impl Default for BufferedLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records delivered messages; refuses after `accept_limit` deliveries.
    struct RecordingSink {
        delivered: StdMutex<Vec<String>>,
        accept_limit: usize,
        fail_message: Option<String>,
        calls: AtomicUsize,
    }

    impl RecordingSink {
        fn accepting() -> Self {
            Self::with_limit(usize::MAX)
        }

        fn with_limit(accept_limit: usize) -> Self {
            Self {
                delivered: StdMutex::new(Vec::new()),
                accept_limit,
                fail_message: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_on(message: &str) -> Self {
            Self {
                fail_message: Some(message.to_string()),
                ..Self::accepting()
            }
        }

        fn messages(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn deliver(&self, entry: &LogEntry) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_message.as_deref() == Some(entry.message.as_str()) {
                return Err(SinkError::Delivery("boom".into()));
            }
            let mut delivered = self.delivered.lock().unwrap();
            if delivered.len() >= self.accept_limit {
                return Err(SinkError::NotConnected);
            }
            delivered.push(entry.message.clone());
            Ok(())
        }
    }

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(LogLevel::Info, message)
    }

    #[tokio::test]
    async fn test_buffers_without_sink() {
        let logger = BufferedLogger::new();
        logger.log(entry("one")).await.unwrap();
        logger.log(entry("two")).await.unwrap();

        assert_eq!(logger.buffered_len().await, 2);
        assert!(logger.buffered_bytes().await > 0);
    }

    #[tokio::test]
    async fn test_attach_flushes_in_order() {
        let logger = BufferedLogger::new();
        for msg in ["a", "b", "c"] {
            logger.log(entry(msg)).await.unwrap();
        }

        let sink = Arc::new(RecordingSink::accepting());
        let delivered = logger.attach_sink(sink.clone()).await;

        assert_eq!(delivered, 3);
        assert_eq!(sink.messages(), vec!["a", "b", "c"]);
        assert_eq!(logger.buffered_len().await, 0);
        assert_eq!(logger.buffered_bytes().await, 0);

        logger.log(entry("d")).await.unwrap();
        assert_eq!(sink.messages(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_not_connected_keeps_remaining_in_order() {
        let logger = BufferedLogger::new();
        for msg in ["a", "b", "c", "d"] {
            logger.log(entry(msg)).await.unwrap();
        }

        let sink = Arc::new(RecordingSink::with_limit(2));
        assert_eq!(logger.attach_sink(sink.clone()).await, 2);

        let remaining: Vec<String> = logger
            .buffered_entries()
            .await
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(remaining, vec!["c", "d"]);

        // Next attach picks up where the last one stopped
        let second = Arc::new(RecordingSink::accepting());
        assert_eq!(logger.attach_sink(second.clone()).await, 2);
        assert_eq!(second.messages(), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_log_falls_back_to_buffer_when_not_connected() {
        let logger = BufferedLogger::new();
        let sink = Arc::new(RecordingSink::with_limit(0));
        logger.attach_sink(sink.clone()).await;

        logger.log(entry("queued")).await.unwrap();

        assert!(sink.messages().is_empty());
        assert_eq!(logger.buffered_len().await, 1);
    }

    #[tokio::test]
    async fn test_other_delivery_errors_propagate() {
        let logger = BufferedLogger::new();
        logger
            .attach_sink(Arc::new(RecordingSink::failing_on("bad")))
            .await;

        let err = logger.log(entry("bad")).await.unwrap_err();
        assert!(matches!(err, SinkError::Delivery(_)));
        assert_eq!(logger.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_drops_entries_failing_with_other_errors() {
        let logger = BufferedLogger::new();
        for msg in ["a", "bad", "c"] {
            logger.log(entry(msg)).await.unwrap();
        }

        let sink = Arc::new(RecordingSink::failing_on("bad"));
        assert_eq!(logger.attach_sink(sink.clone()).await, 2);
        assert_eq!(sink.messages(), vec!["a", "c"]);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(logger.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_buffer_bound_evicts_oldest_first() {
        let per_entry = entry("msg-00").approx_size();
        let max = per_entry * 3;
        let logger = BufferedLogger::with_max_bytes(max);

        for i in 0..10 {
            logger.log(entry(&format!("msg-{:02}", i))).await.unwrap();
            assert!(logger.buffered_bytes().await <= max);
        }

        let kept: Vec<String> = logger
            .buffered_entries()
            .await
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(kept, vec!["msg-07", "msg-08", "msg-09"]);
    }

    #[tokio::test]
    async fn test_default_bound_is_four_mib() {
        let logger = BufferedLogger::new();
        let big = "x".repeat(512 * 1024);
        for _ in 0..20 {
            logger.log(entry(&big)).await.unwrap();
        }

        let bytes = logger.buffered_bytes().await;
        assert!(bytes <= MAX_BUFFER_BYTES);
        assert_eq!(logger.buffered_len().await, 7);
    }

    #[test]
    fn test_oversized_entry_is_dropped() {
        let mut buffer = LogBuffer::new(16);
        assert_eq!(buffer.push(entry("this message is far too long")), 0);
        assert!(buffer.entries.is_empty());
        assert_eq!(buffer.total_bytes, 0);
    }

    #[test]
    fn test_level_conversions() {
        assert_eq!(LogLevel::from(&tracing::Level::WARN), LogLevel::Warning);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error > LogLevel::Info);
    }
}
