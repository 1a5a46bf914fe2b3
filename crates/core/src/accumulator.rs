//! Folds a sequence of [`StreamDelta`]s into a single [`ModelMessage`],
//! including live inline tool-call extraction as text streams in.

use std::time::{Duration, Instant};

use crate::codec::scan_for_tool_call;
use crate::formatter::{ModelMessage, StreamDelta};
use crate::message::Part;
use crate::tool::ToolMode;
use crate::Usage;

/// Incremental accumulator for one model turn's stream.
pub struct StreamAccumulator {
    tool_mode: ToolMode,
    parts: Vec<Part>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    model_version: Option<String>,
    response_id: Option<String>,
    thinking_started_at: Option<Instant>,
    thinking_duration: Option<Duration>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new(tool_mode: ToolMode) -> Self {
        Self {
            tool_mode,
            parts: Vec::new(),
            finish_reason: None,
            usage: None,
            model_version: None,
            response_id: None,
            thinking_started_at: None,
            thinking_duration: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn thinking_duration(&self) -> Option<Duration> {
        self.thinking_duration
    }

    /// Fold one delta into the running message, returning the parts newly
    /// appended by this call (for emitting `Chunk` events).
    pub fn push(&mut self, delta: StreamDelta) -> Vec<Part> {
        let mut appended = Vec::new();

        for part in delta.parts {
            match &part {
                Part::Text { thought, .. } => {
                    let is_thought = thought.unwrap_or(false);
                    if is_thought && self.thinking_started_at.is_none() {
                        self.thinking_started_at = Some(Instant::now());
                    }
                    if !is_thought {
                        if let Some(started) = self.thinking_started_at.take() {
                            self.thinking_duration = Some(started.elapsed());
                        }
                    }
                    self.append_text(part.clone(), is_thought);
                }
                _ => self.parts.push(part.clone()),
            }
            appended.push(part);
        }

        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
        if delta.model_version.is_some() {
            self.model_version = delta.model_version;
        }
        if delta.response_id.is_some() {
            self.response_id = delta.response_id;
        }
        if delta.done {
            self.done = true;
        }

        self.extract_inline_tool_calls();
        appended
    }

    fn append_text(&mut self, part: Part, is_thought: bool) {
        let Part::Text { text, .. } = &part else { unreachable!() };
        if let Some(Part::Text { text: last_text, thought: last_thought, .. }) = self.parts.last_mut() {
            if last_thought.unwrap_or(false) == is_thought {
                last_text.push_str(text);
                return;
            }
        }
        self.parts.push(part);
    }

    /// Re-scans every text part for a complete inline tool-call region and,
    /// when the encoding pair is ambiguous (both xml and json present),
    /// prefers whichever region starts earliest. Synthesized calls replace
    /// the matched text with the surrounding text split around them.
    fn extract_inline_tool_calls(&mut self) {
        if self.tool_mode == ToolMode::FunctionCall {
            return;
        }

        let mut i = 0;
        while i < self.parts.len() {
            let text = match &self.parts[i] {
                Part::Text { text, thought: None | Some(false), .. } => text.clone(),
                _ => {
                    i += 1;
                    continue;
                }
            };

            let Some(scanned) = scan_for_tool_call(&text, self.tool_mode) else {
                i += 1;
                continue;
            };

            let before = text[..scanned.start].to_string();
            let after = text[scanned.end..].to_string();
            let mut replacement = Vec::new();
            if !before.is_empty() {
                replacement.push(Part::text(before));
            }
            replacement.push(scanned.call);
            if !after.is_empty() {
                replacement.push(Part::text(after));
            }

            self.parts.splice(i..=i, replacement);
            i += 1;
        }
    }

    /// Finalize the running state into a [`ModelMessage`].
    pub fn into_message(self) -> ModelMessage {
        ModelMessage {
            parts: self.parts,
            finish_reason: self.finish_reason,
            usage: self.usage,
            model_version: self.model_version,
            response_id: self.response_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_delta(text: &str) -> StreamDelta {
        StreamDelta { parts: vec![Part::text(text)], ..Default::default() }
    }

    #[test]
    fn adjacent_text_with_matching_thought_flag_merges() {
        let mut acc = StreamAccumulator::new(ToolMode::FunctionCall);
        acc.push(text_delta("Hi "));
        acc.push(text_delta("there"));
        let message = acc.into_message();
        assert_eq!(message.parts.len(), 1);
        assert_eq!(message.parts[0], Part::text("Hi there"));
    }

    #[test]
    fn usage_is_overwritten_on_each_non_null_update() {
        let mut acc = StreamAccumulator::new(ToolMode::FunctionCall);
        acc.push(StreamDelta { usage: Some(Usage { input_tokens: 1, output_tokens: 1 }), ..Default::default() });
        acc.push(StreamDelta { usage: Some(Usage { input_tokens: 2, output_tokens: 3 }), ..Default::default() });
        let message = acc.into_message();
        assert_eq!(message.usage, Some(Usage { input_tokens: 2, output_tokens: 3 }));
    }

    #[test]
    fn finish_reason_latches_last_writer_wins() {
        let mut acc = StreamAccumulator::new(ToolMode::FunctionCall);
        acc.push(StreamDelta { finish_reason: Some("tool_calls".into()), ..Default::default() });
        acc.push(StreamDelta { finish_reason: Some("stop".into()), ..Default::default() });
        assert_eq!(acc.into_message().finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn xml_tool_call_is_extracted_from_streamed_text() {
        let mut acc = StreamAccumulator::new(ToolMode::Xml);
        acc.push(text_delta(
            "Here:\n<tool_use><tool_name>read_file</tool_name><parameters><path>x</path></parameters></tool_use>",
        ));
        let message = acc.into_message();
        assert!(message.parts.iter().any(|p| matches!(p, Part::FunctionCall { name, .. } if name == "read_file")));
        assert!(message.parts.iter().any(|p| matches!(p, Part::Text { text, .. } if text == "Here:\n")));
    }

    #[test]
    fn function_call_mode_never_scans_accumulated_text() {
        let mut acc = StreamAccumulator::new(ToolMode::FunctionCall);
        acc.push(text_delta("<tool_use><tool_name>x</tool_name><parameters></parameters></tool_use>"));
        let message = acc.into_message();
        assert!(message.parts.iter().all(|p| !matches!(p, Part::FunctionCall { .. })));
    }

    #[test]
    fn thinking_duration_is_recorded_once_first_real_text_arrives() {
        let mut acc = StreamAccumulator::new(ToolMode::FunctionCall);
        acc.push(StreamDelta {
            parts: vec![Part::Text { text: "pondering".into(), thought: Some(true), thought_signatures: None }],
            ..Default::default()
        });
        assert!(acc.thinking_duration().is_none());
        acc.push(text_delta("answer"));
        assert!(acc.thinking_duration().is_some());
    }
}
