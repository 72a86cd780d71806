//! Stream normalization.
//!
//! Three completion providers answer in three shapes:
//! - Anthropic: SSE with `content_block_delta` / `message_stop` events.
//! - OpenAI: SSE `data:` chunks with `choices[0].delta.content`.
//! - n8n: one JSON object, not streamed at all.
//!
//! Each shape has a [`StreamDecoder`]. A [`StreamSession`] drives one decoder
//! over one upstream byte stream and yields [`CanonicalEvent`]s: zero or more
//! `text-delta`, then exactly one `done` or `error`. Those are framed as SSE
//! for the client:
//!
//! ```text
//! event: text-delta
//! data: {"type":"text-delta","text":"Hel"}
//!
//! event: done
//! data: {"type":"done"}
//!
//! ```
//!
//! The session owns the upstream stream. When the client goes away the
//! response body is dropped, the session with it, and so the upstream
//! connection.

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use tracing::{debug, warn};

pub mod anthropic;
pub mod client;
pub mod n8n;
pub mod openai;

pub use anthropic::AnthropicDecoder;
pub use client::{CompletionClient, Provider};
pub use n8n::N8nDecoder;
pub use openai::OpenAiDecoder;

pub const UPSTREAM_ERROR: &str = "upstream_error";

/// The gateway's own event vocabulary, independent of any provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CanonicalEvent {
    TextDelta { text: String },
    Done,
    Error { code: String },
}

impl CanonicalEvent {
    pub fn text(text: impl Into<String>) -> Self {
        CanonicalEvent::TextDelta { text: text.into() }
    }

    pub fn error(code: impl Into<String>) -> Self {
        CanonicalEvent::Error { code: code.into() }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CanonicalEvent::TextDelta { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CanonicalEvent::TextDelta { .. } => "text-delta",
            CanonicalEvent::Done => "done",
            CanonicalEvent::Error { .. } => "error",
        }
    }

    /// One SSE frame: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.name()));
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

/// Incremental decoder for one provider's wire format.
pub trait StreamDecoder: Send {
    /// Consume the next network read and return whatever events it completes.
    fn feed(&mut self, chunk: &[u8]) -> Vec<CanonicalEvent>;

    /// Called once at end of input for any buffered remainder.
    fn finish(&mut self) -> Vec<CanonicalEvent>;
}

/// Longest partial line kept between reads. Anything longer is dropped up to
/// its terminating newline.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Splits a byte stream into lines across arbitrary read boundaries.
///
/// Works on bytes so a multi-byte UTF-8 character split between two reads is
/// reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
    /// Prefix of `carry` already known to hold no newline.
    scanned: usize,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and drain every complete line (without `\n` / `\r\n`).
    /// The trailing partial line stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.carry[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                lines.push(decode_line(&self.carry[start..end]));
            }
            start = end + 1;
            from = start;
        }
        self.carry.drain(..start);
        self.scanned = self.carry.len();

        if self.carry.len() > MAX_LINE_BYTES {
            warn!(len = self.carry.len(), "dropping oversized stream line");
            self.carry.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        lines
    }

    /// Whatever is left after the final read, if anything.
    pub fn take_rest(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.carry);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || rest.is_empty() {
            return None;
        }
        Some(decode_line(&rest))
    }

    pub fn buffered_len(&self) -> usize {
        self.carry.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Payload of an SSE `data:` line, if `line` is one.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// One upstream call being relayed to one client.
pub struct StreamSession<S> {
    decoder: Box<dyn StreamDecoder>,
    upstream: S,
}

impl<S, E> StreamSession<S>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new(decoder: Box<dyn StreamDecoder>, upstream: S) -> Self {
        Self { decoder, upstream }
    }

    /// Canonical events, ending with exactly one terminal event.
    ///
    /// Reading stops at the first terminal event; the upstream stream is
    /// dropped at that point rather than drained.
    pub fn into_events(self) -> impl Stream<Item = CanonicalEvent> + Send + 'static {
        let Self {
            mut decoder,
            upstream,
        } = self;

        stream! {
            let mut upstream = Box::pin(upstream);
            loop {
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        for event in decoder.feed(&chunk) {
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream stream failed");
                        yield CanonicalEvent::error(UPSTREAM_ERROR);
                        return;
                    }
                    None => {
                        for event in decoder.finish() {
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                        debug!("upstream ended without a terminal event");
                        yield CanonicalEvent::Done;
                        return;
                    }
                }
            }
        }
    }

    /// Canonical events framed as SSE bytes, ready for a streaming response.
    pub fn into_sse(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        self.into_events()
            .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_sse())))
    }
}
