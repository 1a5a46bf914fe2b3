//! Incremental SSE / JSON-lines framing shared by every provider formatter.
//!
//! Generalizes the `for line in text.lines() { if let Some(data) =
//! line.strip_prefix("data: ") { ... } }` loop each dialect used to hand-roll
//! into one buffer-fed framer so dialects only implement
//! `parse_stream_chunk`.

use serde_json::Value;

use crate::error::EngineError;

/// One decoded unit out of a byte stream: either a JSON payload or the
/// terminal sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Value(Value),
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Undetermined,
    Sse,
    JsonLines,
}

/// Feeds raw bytes in and yields [`Frame`]s out, auto-detecting SSE vs
/// JSON-lines/array framing from buffer content.
pub struct StreamFramer {
    mode: Mode,
    remaining: String,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self { mode: Mode::Undetermined, remaining: String::new() }
    }

    /// Feed a chunk of bytes (normalizing CRLF to LF) and return every
    /// [`Frame`] that could be decoded so far. Order always matches byte
    /// arrival order; a malformed event is dropped, not fatal.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let text = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
        self.remaining.push_str(&text);

        if self.mode == Mode::Undetermined {
            self.mode = detect_mode(&self.remaining);
        }

        match self.mode {
            Mode::Sse => self.drain_sse(false),
            Mode::JsonLines => self.drain_json_lines(false),
            Mode::Undetermined => Vec::new(),
        }
    }

    /// Signal EOF: attempt to parse whatever is left in the buffer and
    /// return any final frames. Unparseable residue is silently dropped.
    pub fn finish(&mut self) -> Result<Vec<Frame>, EngineError> {
        match self.mode {
            Mode::Sse => Ok(self.drain_sse(true)),
            Mode::JsonLines => Ok(self.drain_json_lines(true)),
            Mode::Undetermined => {
                self.remaining.clear();
                Ok(Vec::new())
            }
        }
    }

    fn drain_sse(&mut self, flush_trailing: bool) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let Some(boundary) = self.remaining.find("\n\n") else {
                if flush_trailing && !self.remaining.trim().is_empty() {
                    if let Some(frame) = parse_sse_event(&self.remaining) {
                        frames.push(frame);
                    }
                    self.remaining.clear();
                }
                break;
            };
            let event = self.remaining[..boundary].to_string();
            self.remaining.drain(..boundary + 2);
            if let Some(frame) = parse_sse_event(&event) {
                frames.push(frame);
            }
        }
        frames
    }

    fn drain_json_lines(&mut self, flush_trailing: bool) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let Some(boundary) = self.remaining.find('\n') else {
                if flush_trailing && !self.remaining.trim().is_empty() {
                    if let Some(frame) = parse_json_line(&self.remaining) {
                        frames.push(frame);
                    }
                    self.remaining.clear();
                }
                break;
            };
            let line = self.remaining[..boundary].to_string();
            self.remaining.drain(..=boundary);
            if let Some(frame) = parse_json_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn detect_mode(buffer: &str) -> Mode {
    if buffer.lines().any(|l| l.starts_with("data:")) {
        Mode::Sse
    } else if buffer.trim_start().starts_with('{') || buffer.trim_start().starts_with('[') {
        Mode::JsonLines
    } else {
        Mode::Undetermined
    }
}

fn parse_sse_event(event: &str) -> Option<Frame> {
    let mut data_lines = Vec::new();
    let mut event_type: Option<String> = None;

    for line in event.lines() {
        if line.starts_with(':') || line.starts_with("id:") || line.starts_with("retry:") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let payload = data_lines.join("\n");
    if payload.trim() == "[DONE]" {
        return Some(Frame::StreamEnd);
    }

    let mut value: Value = serde_json::from_str(&payload).ok()?;
    if let (Some(event_type), Value::Object(map)) = (event_type, &mut value) {
        if !map.contains_key("type") {
            map.insert("type".to_string(), Value::String(event_type));
        }
    }
    Some(Frame::Value(value))
}

fn parse_json_line(line: &str) -> Option<Frame> {
    let trimmed = line.trim().trim_start_matches('[').trim_end_matches(']').trim_end_matches(',').trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "[DONE]" || trimmed == "\"[DONE]\"" {
        return Some(Frame::StreamEnd);
    }
    serde_json::from_str(trimmed).ok().map(Frame::Value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_single_data_line_parses_as_json() {
        let mut framer = StreamFramer::new();
        let frames = framer.feed(b"data: {\"delta\":\"Hi\"}\n\n");
        assert_eq!(frames, vec![Frame::Value(json!({"delta": "Hi"}))]);
    }

    #[test]
    fn sse_multiple_data_lines_join_with_newline() {
        let mut framer = StreamFramer::new();
        let frames = framer.feed(b"data: {\n data: \"a\":1}\n\n");
        assert_eq!(frames, vec![Frame::Value(json!({"a": 1}))]);
    }

    #[test]
    fn sse_done_sentinel_is_not_parsed_as_json() {
        let mut framer = StreamFramer::new();
        let frames = framer.feed(b"data: [DONE]\n\n");
        assert_eq!(frames, vec![Frame::StreamEnd]);
    }

    #[test]
    fn sse_event_type_is_synthesized_into_object_without_one() {
        let mut framer = StreamFramer::new();
        let frames = framer.feed(b"event: content_block_delta\ndata: {\"text\":\"hi\"}\n\n");
        assert_eq!(frames, vec![Frame::Value(json!({"text": "hi", "type": "content_block_delta"}))]);
    }

    #[test]
    fn json_lines_mode_strips_array_punctuation() {
        let mut framer = StreamFramer::new();
        let frames = framer.feed(b"[\n{\"a\":1},\n{\"a\":2}\n]");
        let finished = framer.finish().unwrap();
        let mut all = frames;
        all.extend(finished);
        assert_eq!(all, vec![Frame::Value(json!({"a": 1})), Frame::Value(json!({"a": 2}))]);
    }

    #[test]
    fn trailing_buffer_is_parsed_on_finish_and_then_dropped() {
        let mut framer = StreamFramer::new();
        framer.feed(b"data: {\"a\":1}");
        let finished = framer.finish().unwrap();
        assert_eq!(finished, vec![Frame::Value(json!({"a": 1}))]);
        assert!(framer.remaining.is_empty());
    }

    #[test]
    fn malformed_event_does_not_abort_subsequent_frames() {
        let mut framer = StreamFramer::new();
        let frames = framer.feed(b"data: {not json}\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(frames, vec![Frame::Value(json!({"ok": true}))]);
    }
}
