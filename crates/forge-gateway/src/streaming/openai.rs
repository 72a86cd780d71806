//! OpenAI Chat Completions stream decoder.

use serde_json::Value;
use tracing::debug;

use super::{sse_data, CanonicalEvent, LineBuffer, StreamDecoder, UPSTREAM_ERROR};

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    lines: LineBuffer,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_line(line: &str, out: &mut Vec<CanonicalEvent>) {
        let Some(data) = sse_data(line) else {
            return;
        };
        if data == DONE_SENTINEL {
            out.push(CanonicalEvent::Done);
            return;
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping malformed OpenAI chunk");
                return;
            }
        };

        if v.get("error").is_some_and(|e| !e.is_null()) {
            out.push(CanonicalEvent::error(UPSTREAM_ERROR));
            return;
        }

        let Some(choice) = v.get("choices").and_then(|c| c.get(0)) else {
            return;
        };
        if let Some(text) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                out.push(CanonicalEvent::text(text));
            }
        }
        if choice.get("finish_reason").and_then(Value::as_str) == Some("stop") {
            out.push(CanonicalEvent::Done);
        }
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        for line in self.lines.push(chunk) {
            Self::decode_line(&line, &mut out);
        }
        out
    }

    fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.take_rest() {
            Self::decode_line(&line, &mut out);
        }
        out
    }
}
