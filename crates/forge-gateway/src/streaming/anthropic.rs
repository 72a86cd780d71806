//! Anthropic Messages API stream decoder.
//!
//! ```text
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}
//!
//! event: message_stop
//! data: {"type":"message_stop"}
//! ```
//!
//! The `type` field inside `data:` carries the event name, so `event:` lines
//! are not needed.

use serde_json::Value;
use tracing::debug;

use super::{sse_data, CanonicalEvent, LineBuffer, StreamDecoder, UPSTREAM_ERROR};

#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    lines: LineBuffer,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_line(line: &str) -> Option<CanonicalEvent> {
        let data = sse_data(line)?;
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping malformed Anthropic event");
                return None;
            }
        };

        match v.get("type").and_then(Value::as_str)? {
            "content_block_delta" => {
                let delta = v.get("delta")?;
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return None;
                }
                let text = delta.get("text").and_then(Value::as_str)?;
                (!text.is_empty()).then(|| CanonicalEvent::text(text))
            }
            "message_stop" => Some(CanonicalEvent::Done),
            "error" => {
                let kind = v
                    .get("error")
                    .and_then(|e| e.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                debug!(kind, "Anthropic stream reported an error");
                Some(CanonicalEvent::error(UPSTREAM_ERROR))
            }
            _ => None,
        }
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<CanonicalEvent> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| Self::decode_line(line))
            .collect()
    }

    fn finish(&mut self) -> Vec<CanonicalEvent> {
        self.lines
            .take_rest()
            .and_then(|line| Self::decode_line(&line))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"content\":[]}}\n\
\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\
\n\
event: ping\n\
data: {\"type\":\"ping\"}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", world\"}}\n\
\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\
\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\
\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\
\n";

    fn expected() -> Vec<CanonicalEvent> {
        vec![
            CanonicalEvent::text("Hello"),
            CanonicalEvent::text(", world"),
            CanonicalEvent::Done,
        ]
    }

    #[test]
    fn test_whole_stream_in_one_read() {
        let mut decoder = AnthropicDecoder::new();
        let mut events = decoder.feed(STREAM.as_bytes());
        events.extend(decoder.finish());
        assert_eq!(events, expected());
    }

    #[test]
    fn test_every_split_point_gives_same_events() {
        let bytes = STREAM.as_bytes();
        for split in 1..bytes.len() {
            let mut decoder = AnthropicDecoder::new();
            let mut events = decoder.feed(&bytes[..split]);
            events.extend(decoder.feed(&bytes[split..]));
            events.extend(decoder.finish());
            assert_eq!(events, expected(), "split at {}", split);
        }
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut decoder = AnthropicDecoder::new();
        let events = decoder.feed(
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"a\"}}\n\
data: {not json\n\
data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"b\"}}\n",
        );
        assert_eq!(events, vec![CanonicalEvent::text("a"), CanonicalEvent::text("b")]);
    }

    #[test]
    fn test_non_text_deltas_are_ignored() {
        let mut decoder = AnthropicDecoder::new();
        let events = decoder.feed(
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\"}}\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_error_event_is_terminal_error() {
        let mut decoder = AnthropicDecoder::new();
        let events = decoder.feed(
            b"event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        assert_eq!(events, vec![CanonicalEvent::error(UPSTREAM_ERROR)]);
    }

    #[test]
    fn test_final_line_without_newline_is_decoded() {
        let mut decoder = AnthropicDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":\"message_stop\"}").is_empty());
        assert_eq!(decoder.finish(), vec![CanonicalEvent::Done]);
    }
}
