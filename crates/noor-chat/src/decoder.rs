//! Newline-delimited JSON stream decoder.
//!
//! Turns a body arriving in arbitrary chunks into an ordered sequence of
//! [`StreamEvent`]s. Bytes are buffered until a `\n` is seen, so chunk
//! boundaries (including ones splitting a multi-byte character) never change
//! the decoded sequence. Lines that are not a recognised event, or that grow
//! past the decoder's maximum line length, are skipped in lenient mode and
//! surfaced as [`ChatError::MalformedEvent`] in strict mode. No terminal event
//! is ever synthesized.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;

use noor_core::types::{StreamEvent, Verse};

use crate::error::ChatError;
use crate::transport::TransportError;

/// Longest line buffered before it is dropped as malformed.
const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// How unparseable lines are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Drop the line and keep going.
    #[default]
    Lenient,
    /// Yield a `MalformedEvent` error in place of the line, then keep going.
    Strict,
}

/// One line of the wire format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Sources {
        data: Vec<Verse>,
    },
    Token {
        data: String,
    },
    Done,
    Error {
        #[serde(default)]
        data: String,
        #[serde(default)]
        error_code: Option<String>,
        #[serde(default)]
        reset_time: Option<String>,
    },
}

impl From<WireEvent> for StreamEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Sources { data } => StreamEvent::Sources(data),
            WireEvent::Token { data } => StreamEvent::Token(data),
            WireEvent::Done => StreamEvent::Done,
            WireEvent::Error {
                data,
                error_code,
                reset_time,
            } => StreamEvent::Error {
                message: data,
                error_code,
                reset_time,
            },
        }
    }
}

/// Incremental line decoder. Feed it chunks with [`push`](Self::push).
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    mode: DecodeMode,
    skipped: usize,
    max_line_bytes: usize,
    /// Dropping the rest of an oversized line up to its terminator.
    discarding: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(DecodeMode::default())
    }
}

impl StreamDecoder {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            buffer: Vec::new(),
            mode,
            skipped: 0,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            discarding: false,
        }
    }

    /// Cap the length of a single line. Longer lines count as malformed.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Append a chunk and decode every line it completes.
    ///
    /// In lenient mode every returned item is `Ok`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, ChatError>> {
        let mut out = Vec::new();
        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.discarding = false;
                    chunk = &chunk[i + 1..];
                }
                None => return out,
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(item) = self.decode_line(start, end) {
                out.push(item);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.max_line_bytes {
            let dropped = self.buffer.len();
            self.buffer.clear();
            self.discarding = true;
            out.extend(self.oversized(dropped));
        }
        out
    }

    /// Signal end of input. Returns how many unterminated trailing bytes were
    /// discarded.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.discarding = false;
        dropped
    }

    /// Number of lines skipped as malformed so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Bytes buffered while waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&mut self, start: usize, end: usize) -> Option<Result<StreamEvent, ChatError>> {
        if end - start > self.max_line_bytes {
            return self.oversized(end - start);
        }
        let line = self.buffer[start..end].trim_ascii();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_slice::<WireEvent>(line) {
            Ok(wire) => Some(Ok(wire.into())),
            Err(e) => {
                self.skipped += 1;
                let text = String::from_utf8_lossy(line).into_owned();
                match self.mode {
                    DecodeMode::Lenient => {
                        tracing::debug!(error = %e, line = %text, "Skipping malformed stream line");
                        None
                    }
                    DecodeMode::Strict => Some(Err(ChatError::MalformedEvent(text))),
                }
            }
        }
    }

    fn oversized(&mut self, len: usize) -> Option<Result<StreamEvent, ChatError>> {
        self.skipped += 1;
        match self.mode {
            DecodeMode::Lenient => {
                tracing::debug!(bytes = len, limit = self.max_line_bytes, "Dropping oversized stream line");
                None
            }
            DecodeMode::Strict => Some(Err(ChatError::MalformedEvent(format!(
                "line longer than {} bytes",
                self.max_line_bytes
            )))),
        }
    }
}

struct DecodeState<S> {
    source: S,
    decoder: StreamDecoder,
    pending: VecDeque<Result<StreamEvent, ChatError>>,
    exhausted: bool,
}

/// Lazily decode a body stream into events with `decoder`.
///
/// A transport failure is yielded once as [`ChatError::Network`] and ends the
/// sequence. The sequence also ends, without a synthetic terminal event,
/// when the source does.
pub fn decode_stream<S>(
    source: S,
    decoder: StreamDecoder,
) -> impl Stream<Item = Result<StreamEvent, ChatError>> + Send
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin + Send,
{
    let state = DecodeState {
        source,
        decoder,
        pending: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.exhausted {
                return None;
            }
            match state.source.next().await {
                Some(Ok(chunk)) => state.pending.extend(state.decoder.push(&chunk)),
                Some(Err(e)) => {
                    state.exhausted = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.exhausted = true;
                    let dropped = state.decoder.finish();
                    if dropped > 0 {
                        tracing::debug!(bytes = dropped, "Discarding unterminated trailing data");
                    }
                }
            }
        }
    })
}
