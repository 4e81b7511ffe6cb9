//! Read assembly buffer for newline-delimited JSON frames.

use crate::types::{QuarryError, Result};
use serde::de::DeserializeOwned;

/// Accumulates raw bytes and yields one complete frame at a time.
///
/// A frame is everything up to a `\n`; a trailing `\r` is stripped and blank
/// lines are skipped. Bytes after the last delimiter are retained for the next
/// call.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, parsed as `T`.
    ///
    /// Returns `None` when no complete frame is buffered. A frame that fails to
    /// parse is consumed and reported as [`QuarryError::Parse`]; later frames
    /// are unaffected.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        loop {
            let end = self.buf.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(deserialize_frame(&line));
        }
    }

    /// Drop everything buffered, including a partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Buffered (not yet consumed) byte count
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn deserialize_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    let text = std::str::from_utf8(line)
        .map_err(|e| QuarryError::Parse(format!("frame is not valid UTF-8: {}", e)))?;
    serde_json::from_str(text).map_err(|e| QuarryError::Parse(format!("invalid JSON frame: {}", e)))
}

/// Serialize `message` as one frame (JSON followed by `\n`).
pub fn serialize_frame<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut json = serde_json::to_vec(message)?;
    if json.contains(&b'\n') {
        return Err(QuarryError::Parse(
            "serialized message contains an embedded newline".to_string(),
        ));
    }
    json.push(b'\n');
    Ok(json)
}
