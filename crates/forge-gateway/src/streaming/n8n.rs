//! n8n workflow decoder.
//!
//! The workflow answers with a single JSON document once it has run. The whole
//! body is buffered and turned into one `text-delta` followed by `done`.

use serde_json::Value;
use tracing::warn;

use super::{CanonicalEvent, StreamDecoder, UPSTREAM_ERROR};

/// Largest workflow reply that will be buffered.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Fields checked, in order, for the reply text.
const TEXT_FIELDS: &[&str] = &["content", "output", "text"];

#[derive(Debug, Default)]
pub struct N8nDecoder {
    body: Vec<u8>,
    overflowed: bool,
}

impl N8nDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

/// First non-empty string found under [`TEXT_FIELDS`]. A top-level array is
/// answered by its first element.
pub fn extract_text(v: &Value) -> Option<&str> {
    let object = match v {
        Value::Array(items) => items.first()?,
        other => other,
    };
    TEXT_FIELDS
        .iter()
        .filter_map(|field| object.get(*field).and_then(Value::as_str))
        .find(|text| !text.is_empty())
}

impl StreamDecoder for N8nDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<CanonicalEvent> {
        if self.overflowed {
            return Vec::new();
        }
        if self.body.len() + chunk.len() > MAX_BODY_BYTES {
            warn!(limit = MAX_BODY_BYTES, "n8n reply too large");
            self.overflowed = true;
            self.body.clear();
            return vec![CanonicalEvent::error(UPSTREAM_ERROR)];
        }
        self.body.extend_from_slice(chunk);
        Vec::new()
    }

    fn finish(&mut self) -> Vec<CanonicalEvent> {
        if self.overflowed {
            return Vec::new();
        }
        let body = std::mem::take(&mut self.body);
        let parsed: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "n8n reply is not JSON");
                return vec![CanonicalEvent::error(UPSTREAM_ERROR)];
            }
        };
        match extract_text(&parsed) {
            Some(text) => vec![CanonicalEvent::text(text), CanonicalEvent::Done],
            None => {
                warn!("n8n reply has no text field");
                vec![CanonicalEvent::error(UPSTREAM_ERROR)]
            }
        }
    }
}
