//! The `ProviderFormatter` seam: the one place each wire dialect touches
//! HTTP shape, leaving everything upstream (context assembly, trimming,
//! the tool loop) dialect-agnostic.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

/// Per-stream scratch space a dialect's [`ProviderFormatter::parse_stream_chunk`]
/// may use to accumulate state that spans multiple frames within one
/// stream (e.g. Anthropic's `input_json_delta` fragments, which arrive as
/// partial JSON strings keyed by content-block index and only become a
/// complete [`crate::message::Part::FunctionCall`] on `content_block_stop`).
///
/// Owned by the caller (one fresh instance per in-flight stream, discarded
/// at stream end) so formatter instances stay safely shareable across
/// concurrent conversations despite needing per-stream state.
pub type StreamScratch = HashMap<String, JsonValue>;

use crate::channel::ChannelConfig;
use crate::error::EngineError;
use crate::message::{Message, Part};
use crate::tool::Tool;
use crate::Usage;

/// A fully-formed outbound HTTP request, dialect-specific body already
/// serialized to bytes.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Whether this request should be issued against the streaming endpoint
    /// variant (e.g. Gemini's `streamGenerateContent?alt=sse`).
    pub stream: bool,
}

/// A fully-parsed non-streaming response, or the terminal accumulation of a
/// streamed one.
#[derive(Debug, Clone, Default)]
pub struct ModelMessage {
    pub parts: Vec<Part>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub model_version: Option<String>,
    pub response_id: Option<String>,
}

/// One decoded unit of a streaming response, normalized to the canonical
/// shape every dialect's `parse_stream_chunk` must produce.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub parts: Vec<Part>,
    pub done: bool,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub model_version: Option<String>,
    pub response_id: Option<String>,
    /// Raw SSE/event-name tag, when the dialect's framing carries one
    /// (e.g. Anthropic's `content_block_delta`). Formatters use this to
    /// disambiguate payload shapes that otherwise collide.
    pub event: Option<String>,
}

/// Extra per-request knobs that don't belong in the persisted
/// [`ChannelConfig`] because they vary turn-to-turn.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions<'a> {
    pub tools: Option<&'a [Tool]>,
    pub dynamic_system_prompt: Option<&'a str>,
    pub previous_response_id: Option<&'a str>,
    pub prompt_cache_key: Option<&'a str>,
    pub skip_tools: bool,
}

/// One wire dialect: Gemini, OpenAI Chat, OpenAI Responses, or Anthropic.
///
/// Implementations own URL construction, header composition, body shape,
/// and the translation between the canonical [`Message`]/[`Part`] model and
/// whatever JSON shape the provider speaks.
pub trait ProviderFormatter: Send + Sync {
    /// Build the outbound HTTP request for one turn.
    ///
    /// `history` has already been trimmed by `ContextTrimmer` and must be
    /// normalized here: internal markers stripped, role aliases mapped,
    /// leading non-user messages dropped, consecutive same-role messages
    /// coalesced, and (for xml/json tool modes) function calls/responses
    /// rewritten into text.
    fn build_request(
        &self,
        history: &[Message],
        config: &ChannelConfig,
        options: &RequestOptions<'_>,
    ) -> Result<HttpRequest, EngineError>;

    /// Parse a complete (non-streaming) response body.
    fn parse_response(&self, body: &[u8]) -> Result<ModelMessage, EngineError>;

    /// Parse one decoded stream frame (already framed by [`crate::stream::StreamFramer`])
    /// into a canonical delta. `scratch` persists across every frame of one
    /// stream (see [`StreamScratch`]) and must not be read across streams.
    fn parse_stream_chunk(&self, value: &JsonValue, scratch: &mut StreamScratch) -> Result<StreamDelta, EngineError>;

    /// Whether this dialect is subject to the Gemini 429-floor spacing rule
    /// and the Gemini iteration-2-onward jitter delay.
    fn is_gemini_like(&self) -> bool {
        false
    }

    /// Whether this dialect can infer `done` from connection-close rather
    /// than an explicit terminal event (OpenAI Responses only).
    fn infers_done_on_close(&self) -> bool {
        false
    }
}

/// Composes the final system instruction sent to the model: the channel's
/// configured instruction, the turn's dynamic prompt, and a tool-definition
/// block substituted into any `{{$TOOLS}}`/`{{$MCP_TOOLS}}` placeholder (or
/// appended if no placeholder is present).
pub fn compose_system_instruction(
    config: &ChannelConfig,
    dynamic_system_prompt: Option<&str>,
    tool_block: &str,
) -> String {
    let mut composed = config.system_instruction.clone().unwrap_or_default();
    if let Some(dynamic) = dynamic_system_prompt {
        if !dynamic.is_empty() {
            if !composed.is_empty() {
                composed.push_str("\n\n");
            }
            composed.push_str(dynamic);
        }
    }

    if composed.contains("{{$TOOLS}}") {
        composed.replace("{{$TOOLS}}", tool_block)
    } else if composed.contains("{{$MCP_TOOLS}}") {
        composed.replace("{{$MCP_TOOLS}}", tool_block)
    } else if tool_block.is_empty() {
        composed
    } else {
        if !composed.is_empty() {
            composed.push_str("\n\n");
        }
        composed.push_str(tool_block);
        composed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, CredentialRef, ProviderKind};

    fn base_config(instruction: Option<&str>) -> ChannelConfig {
        ChannelConfig {
            id: "c".into(),
            provider: ProviderKind::Anthropic,
            endpoint_url: "https://example.test".into(),
            credential: CredentialRef::EnvVar("X".into()),
            model: "m".into(),
            system_instruction: instruction.map(str::to_string),
            tool_mode: Default::default(),
            context_threshold: 1000.0,
            context_threshold_is_percent: false,
            retry: Default::default(),
            custom_headers: Default::default(),
            custom_body_overlay: None,
            timeout_seconds: 30,
            prefer_stream: true,
            send_history_thoughts: false,
            send_history_thought_signatures: false,
            enabled: true,
        }
    }

    #[test]
    fn tool_block_substitutes_into_placeholder() {
        let config = base_config(Some("Be helpful.\n{{$TOOLS}}\nBe concise."));
        let composed = compose_system_instruction(&config, None, "TOOLS HERE");
        assert_eq!(composed, "Be helpful.\nTOOLS HERE\nBe concise.");
    }

    #[test]
    fn tool_block_appends_when_no_placeholder_present() {
        let config = base_config(Some("Be helpful."));
        let composed = compose_system_instruction(&config, Some("Dynamic note."), "TOOLS HERE");
        assert_eq!(composed, "Be helpful.\n\nDynamic note.\n\nTOOLS HERE");
    }

    #[test]
    fn empty_tool_block_is_not_appended() {
        let config = base_config(Some("Be helpful."));
        let composed = compose_system_instruction(&config, None, "");
        assert_eq!(composed, "Be helpful.");
    }
}
