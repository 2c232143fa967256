use serde_json::Value;
use tracing::{debug, warn};

const EVENT_DELIMITER: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data: ";

/// Largest unterminated frame kept in memory before it is discarded.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One decoded `data: {"event": ..., "data": ...}` line.
///
/// The decoder only checks the envelope shape; interpreting `event` names
/// is left to [`StreamEvent::from_raw`](crate::events::StreamEvent::from_raw).
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub event: String,
    pub data: Value,
}

/// Incremental decoder for the chat stream.
///
/// Bytes are buffered until a blank-line delimiter arrives, so frames are
/// only turned into text once complete. Chunk boundaries (including ones
/// that split a multi-byte character) never change the decoded output.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already searched without finding a delimiter.
    scanned: usize,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and drain every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        let mut start = 0;
        // A delimiter may straddle the previous chunk boundary.
        let mut from = self.scanned.saturating_sub(EVENT_DELIMITER.len() - 1);
        while let Some(pos) = find_delimiter(&self.buffer[from..]) {
            let end = from + pos;
            decode_frame(&self.buffer[start..end], &mut events);
            start = end + EVENT_DELIMITER.len();
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_FRAME_BYTES {
            warn!(len = self.buffer.len(), "discarding oversized stream frame");
            self.buffer.clear();
            self.scanned = 0;
        }

        events
    }

    /// Flush the trailing fragment once the body has ended.
    ///
    /// Servers that omit the final blank line still get their last event
    /// delivered; an empty or partial fragment yields nothing.
    pub fn finish(&mut self) -> Vec<RawEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let mut events = Vec::new();
        decode_frame(&rest, &mut events);
        events
    }

    /// Decode a complete payload in one shot.
    pub fn decode_all(input: &[u8]) -> Vec<RawEvent> {
        let mut decoder = Self::new();
        let mut events = decoder.feed(input);
        events.extend(decoder.finish());
        events
    }

}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(EVENT_DELIMITER.len())
        .position(|window| window == EVENT_DELIMITER)
}

fn decode_frame(frame: &[u8], out: &mut Vec<RawEvent>) {
    if frame.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(frame);
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => {
                if let Some(event) = into_raw_event(value) {
                    out.push(event);
                }
            }
            Err(e) => {
                debug!(error = %e, len = payload.len(), "dropping malformed stream line");
            }
        }
    }
}

fn into_raw_event(value: Value) -> Option<RawEvent> {
    let Value::Object(mut map) = value else {
        return None;
    };
    let event = match map.remove("event") {
        Some(Value::String(name)) => name,
        _ => return None,
    };
    let data = map.remove("data").unwrap_or(Value::Null);
    Some(RawEvent { event, data })
}
