//! Canonical conversation data model shared by every provider formatter.
//!
//! `Part` is the tagged-sum building block of a [`Message`]; a [`Conversation`]
//! is an ordered sequence of messages plus free-form metadata. Every
//! provider-formatter crate converts to and from this shape and never leaks
//! its own wire representation past `build_request`/`parse_response`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Usage;

/// Role of the party that produced a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// One content block inside a [`Message`].
///
/// Tagged as `{"type": "...", "data": {...}}` so every call site that needs
/// to special-case a variant (internal-marker filtering, tool-call
/// extraction, history normalization) can match exhaustively instead of
/// probing untyped JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signatures: Option<HashMap<String, String>>,
    },
    InlineData {
        mime_type: String,
        base64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    FileData {
        mime_type: String,
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    FunctionCall {
        id: String,
        name: String,
        args: JsonValue,
    },
    FunctionResponse {
        id: String,
        name: String,
        response: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parts: Option<Vec<Part>>,
    },
    /// Carries engine-private bookkeeping (e.g. an OpenAI-Responses
    /// continuation marker). Stripped from every outgoing request; see
    /// [`INTERNAL_MARKER_MIME`].
    InternalMarker {
        kind: String,
        payload: JsonValue,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: None,
            thought_signatures: None,
        }
    }

    pub fn function_call(id: impl Into<String>, name: impl Into<String>, args: JsonValue) -> Self {
        Part::FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    pub fn function_response(
        id: impl Into<String>,
        name: impl Into<String>,
        response: JsonValue,
    ) -> Self {
        Part::FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
            parts: None,
        }
    }

    pub fn is_thought(&self) -> bool {
        matches!(self, Part::Text { thought: Some(true), .. })
    }

    pub fn as_function_call(&self) -> Option<(&str, &str, &JsonValue)> {
        match self {
            Part::FunctionCall { id, name, args } => Some((id, name, args)),
            _ => None,
        }
    }

    pub fn as_internal_marker(&self) -> Option<(&str, &JsonValue)> {
        match self {
            Part::InternalMarker { kind, payload } => Some((kind, payload)),
            _ => None,
        }
    }
}

/// MIME tag used by [`Part::InlineData`]/[`Part::FileData`] encodings of an
/// [`Part::InternalMarker`] payload when a provider formatter must smuggle
/// continuation state through a wire format that has no native "internal"
/// part kind. Parts carrying this tag MUST be filtered from every outgoing
/// request body.
pub const INTERNAL_MARKER_MIME: &str =
    "application/x-loopcore-openai-responses-stateful-marker";

/// Optional bookkeeping carried alongside a message's parts. Most fields are
/// only ever set on model messages; `is_function_response`/`selection_references`
/// are set on user messages that answer a tool call or carry attached context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_function_response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_summary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_references: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_overrides: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_context: Option<JsonValue>,
}

/// A single turn in a [`Conversation`]: a role plus an ordered sequence of
/// [`Part`]s, with optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// Unix seconds, matching the rest of the workspace's
    /// `OffsetDateTime::now_utc().unix_timestamp()` convention.
    pub created_at: i64,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            metadata: MessageMetadata::default(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::new(Role::User, vec![Part::text(text)])
    }

    pub fn model(text: impl Into<String>) -> Self {
        Message::new(Role::Model, vec![Part::text(text)])
    }

    /// All `(id, name, args)` triples of function calls this message carries.
    pub fn function_calls(&self) -> Vec<(&str, &str, &JsonValue)> {
        self.parts.iter().filter_map(Part::as_function_call).collect()
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, thought: None | Some(false), .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Strips [`Part::InternalMarker`] parts. Every outgoing wire body must
    /// be built from a message that has gone through this first.
    pub fn without_internal_markers(&self) -> Message {
        let mut clone = self.clone();
        clone.parts.retain(|p| !matches!(p, Part::InternalMarker { .. }));
        clone
    }
}

/// Ordered sequence of [`Message`]s plus free-form per-conversation metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub custom_metadata: HashMap<String, JsonValue>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Index of the most recent `isSummary` message, if any. Messages at or
    /// before this index must never be sent on the wire.
    pub fn last_summary_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.metadata.is_summary == Some(true))
            .map(|(i, _)| i)
    }

    pub fn find(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_round_trips_through_tagged_json() {
        let part = Part::function_call("call_1", "list_files", json!({"path": "/tmp"}));
        let encoded = serde_json::to_value(&part).unwrap();
        assert_eq!(encoded["type"], "functionCall");
        let decoded: Part = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, part);
    }

    #[test]
    fn text_joins_non_thought_parts_only() {
        let message = Message::new(
            Role::Model,
            vec![
                Part::Text { text: "thinking...".into(), thought: Some(true), thought_signatures: None },
                Part::text("Hi "),
                Part::text("there"),
            ],
        );
        assert_eq!(message.text(), "Hi there");
    }

    #[test]
    fn last_summary_index_finds_most_recent_summary() {
        let mut conversation = Conversation::new();
        conversation.push(Message::user("hello"));
        let mut summary = Message::model("summary of above");
        summary.metadata.is_summary = Some(true);
        conversation.push(summary);
        conversation.push(Message::user("continue"));
        assert_eq!(conversation.last_summary_index(), Some(1));
    }

    #[test]
    fn internal_marker_is_stripped() {
        let message = Message::new(
            Role::Model,
            vec![
                Part::text("visible"),
                Part::InternalMarker { kind: "openai-responses".into(), payload: json!({"v": 1}) },
            ],
        );
        let stripped = message.without_internal_markers();
        assert_eq!(stripped.parts.len(), 1);
    }
}
