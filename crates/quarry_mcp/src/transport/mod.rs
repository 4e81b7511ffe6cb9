//! Framed Transport
//!
//! Newline-delimited JSON-RPC over any `AsyncRead`/`AsyncWrite` pair: stdin and
//! stdout in production, `tokio::io::duplex` in tests.
//!
//! ```text
//! Unstarted ──start()──► Listening ──close() / EOF / read error──► Closed
//! ```
//!
//! A single reader task owns the input half. It appends every chunk to a
//! [`ReadBuffer`] and delivers each complete frame, in arrival order, to the
//! `on_message` handler. Frames that do not parse go to `on_error`; reading
//! continues.
//!
//! Writes are serialized through an async mutex. `write_all` suspends while the
//! peer is not draining, so a slow client applies backpressure to the caller
//! without blocking a runtime thread and without dropping or reordering frames.
//!
//! Closing drops only this transport's handle on the input. For stdio that
//! handle is `tokio::io::Stdin`, which never closes file descriptor 0, so any
//! other reader of the process input is unaffected.

mod buffer;

pub use buffer::{serialize_frame, ReadBuffer};

use crate::protocol::JsonRpcMessage;
use crate::types::{QuarryError, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unstarted,
    Listening,
    Closed,
}

type MessageHandler = Box<dyn Fn(JsonRpcMessage) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(QuarryError) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;

/// Callbacks installed by [`FramedTransport::start`]
pub struct TransportHandlers {
    on_message: MessageHandler,
    on_error: ErrorHandler,
    on_close: Option<CloseHandler>,
}

impl TransportHandlers {
    /// Handlers delivering messages to `on_message`; frame errors are logged
    /// until [`on_error`](Self::on_error) replaces that default.
    pub fn new(on_message: impl Fn(JsonRpcMessage) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Box::new(on_message),
            on_error: Box::new(|e| warn!("Unreadable frame: {}", e)),
            on_close: None,
        }
    }

    pub fn on_error(mut self, handler: impl Fn(QuarryError) + Send + Sync + 'static) -> Self {
        self.on_error = Box::new(handler);
        self
    }

    pub fn on_close(mut self, handler: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(handler));
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the transport and its reader task
struct Shared {
    state: Mutex<TransportState>,
    buffer: Mutex<ReadBuffer>,
    on_close: Mutex<Option<CloseHandler>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    /// Transition to `Closed`. Returns false if already closed.
    fn close(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == TransportState::Closed {
                return false;
            }
            *state = TransportState::Closed;
        }

        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        lock(&self.buffer).clear();

        let on_close = lock(&self.on_close).take();
        if let Some(on_close) = on_close {
            on_close();
        }
        debug!("Transport closed");
        true
    }
}

pub struct FramedTransport<R, W> {
    shared: Arc<Shared>,
    reader: Mutex<Option<R>>,
    writer: tokio::sync::Mutex<W>,
}

impl FramedTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Transport over the process stdin/stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TransportState::Unstarted),
                buffer: Mutex::new(ReadBuffer::new()),
                on_close: Mutex::new(None),
                reader_task: Mutex::new(None),
            }),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    /// Bytes received but not yet forming a complete frame
    pub fn buffered_len(&self) -> usize {
        lock(&self.shared.buffer).len()
    }

    /// Begin listening. Only valid once, from `Unstarted`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, handlers: TransportHandlers) -> Result<()> {
        let reader = {
            let mut state = lock(&self.shared.state);
            if *state != TransportState::Unstarted {
                return Err(QuarryError::invalid_state(format!(
                    "transport cannot start from {:?}",
                    *state
                )));
            }
            let reader = lock(&self.reader)
                .take()
                .ok_or_else(|| QuarryError::invalid_state("transport input already consumed"))?;
            *state = TransportState::Listening;
            reader
        };

        *lock(&self.shared.on_close) = handlers.on_close;

        let task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.shared),
            handlers.on_message,
            handlers.on_error,
        ));

        let mut slot = lock(&self.shared.reader_task);
        if self.shared.state() == TransportState::Closed {
            task.abort();
        } else {
            *slot = Some(task);
        }

        debug!("Transport listening");
        Ok(())
    }

    /// Write one frame. Suspends while the peer is not accepting data.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        if self.state() == TransportState::Closed {
            return Err(QuarryError::invalid_state("cannot send on a closed transport"));
        }

        let frame = serialize_frame(message)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Stop listening, clear the read buffer and fire `on_close`.
    ///
    /// Later calls do nothing; `on_close` runs at most once.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<R, W> Drop for FramedTransport<R, W> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.shared.reader_task).take() {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    on_message: MessageHandler,
    on_error: ErrorHandler,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Transport input reached EOF");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                on_error(QuarryError::Io(e));
                break;
            }
        };

        // Handlers run without the buffer lock held; they may close the transport
        let frames: Vec<Result<JsonRpcMessage>> = {
            let mut buffer = lock(&shared.buffer);
            buffer.append(&chunk[..n]);
            std::iter::from_fn(|| buffer.read_message()).collect()
        };

        for frame in frames {
            if shared.state() == TransportState::Closed {
                return;
            }
            match frame {
                Ok(message) => on_message(message),
                Err(e) => on_error(e),
            }
        }
    }

    shared.close();
}
