//! Line-oriented SSE framing shared by the relay (reading the analysis API) and
//! the client (reading the relay).
//!
//! A line starting with `event: ` sets the current event type, which sticks
//! until the next `event: ` line. Every non-blank `data: ` line yields one
//! [`Frame`] tagged with that type. Anything else (comments, `id:`, blank
//! separators) is ignored. JSON decoding happens later, per frame, so a broken
//! payload never stalls the lines after it.

use crate::constants::{DATA_PREFIX, DONE_MARKER, EVENT_PREFIX, MAX_SSE_LINE_BYTES};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_MARKER
    }

    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("SSE line exceeds the {0} byte limit")]
    LineTooLong(usize),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct EventFrameCodec {
    current_event: Option<String>,
    scanned: usize,
    max_line_bytes: usize,
}

impl EventFrameCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_SSE_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            current_event: None,
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Forgets the sticky event type, for reuse on a fresh connection.
    pub fn reset(&mut self) {
        self.current_event = None;
        self.scanned = 0;
    }

    fn classify(&mut self, line: &str) -> Option<Frame> {
        if let Some(rest) = line.strip_prefix(EVENT_PREFIX) {
            let event = rest.trim();
            self.current_event = if event.is_empty() {
                None
            } else {
                Some(event.to_string())
            };
            return None;
        }

        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            let data = rest.trim();
            if data.is_empty() {
                return None;
            }
            return Some(Frame {
                event: self.current_event.clone(),
                data: data.to_string(),
            });
        }

        None
    }
}

impl Default for EventFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventFrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            let newline = buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if buf.len() > self.max_line_bytes {
                    buf.clear();
                    self.scanned = 0;
                    return Err(FrameError::LineTooLong(self.max_line_bytes));
                }
                // Hold the partial line back until more bytes arrive.
                self.scanned = buf.len();
                return Ok(None);
            };

            let line_end = self.scanned + offset;
            self.scanned = 0;
            if line_end > self.max_line_bytes {
                buf.clear();
                return Err(FrameError::LineTooLong(self.max_line_bytes));
            }

            let raw = buf.split_to(line_end + 1);
            let mut line = &raw[..line_end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let text = String::from_utf8_lossy(line);

            if let Some(frame) = self.classify(&text) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() {
            tracing::debug!(
                "Discarding {} bytes of unterminated SSE line at end of stream",
                buf.len()
            );
            buf.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

/// Adapts a body byte stream into a stream of frames.
pub fn frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<Frame, FrameError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let reader = StreamReader::new(byte_stream.map(|r| r.map_err(std::io::Error::other)));
    FramedRead::new(reader, EventFrameCodec::new())
}
