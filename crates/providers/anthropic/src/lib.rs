//! Anthropic Messages API dialect: implements [`ProviderFormatter`] against
//! `POST /v1/messages`, including SSE streaming with incremental
//! `input_json_delta` tool-argument accumulation.

use std::collections::HashMap;

use base64::Engine as _;
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use loopcore::channel::ChannelConfig;
use loopcore::error::EngineError;
use loopcore::formatter::{compose_system_instruction, HttpRequest, ModelMessage, ProviderFormatter, RequestOptions, StreamDelta, StreamScratch};
use loopcore::history::normalize_history;
use loopcore::message::{Message, Part, Role};
use loopcore::tool::{render_tool_block, Tool, ToolMode};
use loopcore::Usage;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Default)]
pub struct AnthropicFormatter;

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool<'a>>>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a JsonValue,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct AnthropicSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

impl ProviderFormatter for AnthropicFormatter {
    fn build_request(
        &self,
        history: &[Message],
        config: &ChannelConfig,
        options: &RequestOptions<'_>,
    ) -> Result<HttpRequest, EngineError> {
        let normalized = normalize_history(history, config.tool_mode);
        let tools = options.tools.unwrap_or(&[]);
        let tool_block = if options.skip_tools { String::new() } else { render_tool_block(tools, config.tool_mode) };
        let system = compose_system_instruction(config, options.dynamic_system_prompt, &tool_block);

        let messages: Vec<AnthropicMessage> = normalized.iter().map(to_anthropic_message).collect();
        if messages.is_empty() {
            return Err(EngineError::ValidationError("history produced no messages to send".into()));
        }

        let anthropic_tools = if config.tool_mode == ToolMode::FunctionCall && !options.skip_tools && !tools.is_empty() {
            Some(tools.iter().map(to_anthropic_tool).collect())
        } else {
            None
        };

        let body = AnthropicRequest {
            model: &config.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            system: if system.is_empty() { None } else { Some(&system) },
            messages,
            tools: anthropic_tools,
            stream: config.prefer_stream,
        };

        let api_key = config.credential.resolve()?;
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-api-key".to_string(), api_key);
        headers.insert("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string());
        for (k, v) in &config.custom_headers {
            headers.insert(k.clone(), v.clone());
        }

        Ok(HttpRequest {
            method: Method::POST,
            url: config.endpoint_url.clone(),
            headers,
            body: serde_json::to_vec(&body)?,
            stream: config.prefer_stream,
        })
    }

    fn parse_response(&self, body: &[u8]) -> Result<ModelMessage, EngineError> {
        let raw: AnthropicResponse = serde_json::from_slice(body)
            .map_err(|e| EngineError::ParseError(format!("anthropic response: {e}")))?;
        let parts = raw.content.into_iter().map(content_block_to_part).collect();
        Ok(ModelMessage {
            parts,
            finish_reason: raw.stop_reason,
            usage: raw.usage.map(|u| Usage { input_tokens: u.input_tokens, output_tokens: u.output_tokens }),
            model_version: raw.model,
            response_id: raw.id,
        })
    }

    fn parse_stream_chunk(&self, value: &JsonValue, scratch: &mut StreamScratch) -> Result<StreamDelta, EngineError> {
        let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        match event_type {
            "message_start" => {
                let message = value.get("message");
                Ok(StreamDelta {
                    response_id: message.and_then(|m| m.get("id")).and_then(|v| v.as_str()).map(String::from),
                    model_version: message.and_then(|m| m.get("model")).and_then(|v| v.as_str()).map(String::from),
                    event: Some(event_type.into()),
                    ..Default::default()
                })
            }
            "content_block_start" => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(block) = value.get("content_block") {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                        scratch.insert(format!("tool_{index}_id"), json!(id));
                        scratch.insert(format!("tool_{index}_name"), json!(name));
                        scratch.insert(format!("tool_{index}_json"), json!(""));
                    }
                }
                Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() })
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let Some(delta) = value.get("delta") else {
                    return Ok(StreamDelta::default());
                };
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                        Ok(StreamDelta { parts: vec![Part::text(text)], event: Some(event_type.into()), ..Default::default() })
                    }
                    Some("thinking_delta") => {
                        let text = delta.get("thinking").and_then(|v| v.as_str()).unwrap_or_default();
                        Ok(StreamDelta {
                            parts: vec![Part::Text { text: text.to_string(), thought: Some(true), thought_signatures: None }],
                            event: Some(event_type.into()),
                            ..Default::default()
                        })
                    }
                    Some("input_json_delta") => {
                        let fragment = delta.get("partial_json").and_then(|v| v.as_str()).unwrap_or_default();
                        let key = format!("tool_{index}_json");
                        let existing = scratch.get(&key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                        scratch.insert(key, json!(format!("{existing}{fragment}")));
                        Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() })
                    }
                    _ => Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() }),
                }
            }
            "content_block_stop" => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let id_key = format!("tool_{index}_id");
                if let Some(id) = scratch.remove(&id_key) {
                    let name = scratch.remove(&format!("tool_{index}_name")).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
                    let json_buf = scratch.remove(&format!("tool_{index}_json")).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
                    let args: JsonValue = if json_buf.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json_buf).unwrap_or(JsonValue::Null)
                    };
                    let id = id.as_str().map(String::from).unwrap_or_default();
                    return Ok(StreamDelta {
                        parts: vec![Part::function_call(id, name, args)],
                        event: Some(event_type.into()),
                        ..Default::default()
                    });
                }
                Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() })
            }
            "message_delta" => {
                let stop_reason = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let usage = value.get("usage").and_then(|u| serde_json::from_value::<AnthropicUsage>(u.clone()).ok());
                Ok(StreamDelta {
                    finish_reason: stop_reason,
                    usage: usage.map(|u| Usage { input_tokens: u.input_tokens, output_tokens: u.output_tokens }),
                    event: Some(event_type.into()),
                    ..Default::default()
                })
            }
            "message_stop" => Ok(StreamDelta { done: true, event: Some(event_type.into()), ..Default::default() }),
            other => Ok(StreamDelta { event: Some(other.to_string()), ..Default::default() }),
        }
    }
}

fn to_anthropic_tool(tool: &Tool) -> AnthropicTool<'_> {
    AnthropicTool {
        name: &tool.function.name,
        description: &tool.function.description,
        input_schema: &tool.function.parameters,
    }
}

fn to_anthropic_message(message: &Message) -> AnthropicMessage {
    let role = match message.role {
        Role::User => "user",
        Role::Model => "assistant",
    };
    let content = message.parts.iter().filter_map(part_to_content_block).collect::<Vec<_>>();
    let content = if content.is_empty() { vec![AnthropicContentBlock::Text { text: String::new() }] } else { content };
    AnthropicMessage { role, content }
}

fn part_to_content_block(part: &Part) -> Option<AnthropicContentBlock> {
    match part {
        Part::Text { text, thought: Some(true), .. } => Some(AnthropicContentBlock::Text { text: format!("[thinking] {text}") }),
        Part::Text { text, .. } => Some(AnthropicContentBlock::Text { text: text.clone() }),
        Part::InlineData { mime_type, base64, .. } => Some(AnthropicContentBlock::Image {
            source: AnthropicSource { source_type: "base64", media_type: mime_type.clone(), data: base64.clone() },
        }),
        Part::FunctionCall { id, name, args } => {
            Some(AnthropicContentBlock::ToolUse { id: id.clone(), name: name.clone(), input: args.clone() })
        }
        Part::FunctionResponse { id, response, .. } => Some(AnthropicContentBlock::ToolResult {
            tool_use_id: id.clone(),
            content: response.to_string(),
        }),
        Part::FileData { .. } | Part::InternalMarker { .. } => None,
    }
}

fn content_block_to_part(block: AnthropicResponseContent) -> Part {
    match block.content_type.as_str() {
        "tool_use" => Part::function_call(
            block.id.unwrap_or_default(),
            block.name.unwrap_or_default(),
            block.input.unwrap_or(JsonValue::Null),
        ),
        "thinking" => Part::Text { text: block.thinking.unwrap_or_default(), thought: Some(true), thought_signatures: None },
        _ => Part::text(block.text.unwrap_or_default()),
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    id: Option<String>,
    model: Option<String>,
    content: Vec<AnthropicResponseContent>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicResponseContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    thinking: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<JsonValue>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Base64-decodes an inline attachment, used by tests and by hosts that
/// need to re-derive raw bytes from a [`Part::InlineData`].
pub fn decode_inline_data(base64: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD.decode(base64).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcore::channel::{CredentialRef, ProviderKind, RetryConfig};

    fn config() -> ChannelConfig {
        ChannelConfig {
            id: "c".into(),
            provider: ProviderKind::Anthropic,
            endpoint_url: "https://api.anthropic.com/v1/messages".into(),
            credential: CredentialRef::Named("test-key".into()),
            model: "claude-opus-4".into(),
            system_instruction: Some("Be helpful.".into()),
            tool_mode: ToolMode::FunctionCall,
            context_threshold: 100_000.0,
            context_threshold_is_percent: false,
            retry: RetryConfig::default(),
            custom_headers: Default::default(),
            custom_body_overlay: None,
            timeout_seconds: 60,
            prefer_stream: true,
            send_history_thoughts: false,
            send_history_thought_signatures: false,
            enabled: true,
        }
    }

    #[test]
    fn build_request_sets_auth_headers_from_resolved_credential() {
        let formatter = AnthropicFormatter;
        let history = vec![Message::user("hi")];
        let request = formatter.build_request(&history, &config(), &RequestOptions::default()).unwrap();
        assert_eq!(request.headers.get("x-api-key"), Some(&"test-key".to_string()));
        assert_eq!(request.headers.get("anthropic-version"), Some(&ANTHROPIC_VERSION.to_string()));
    }

    #[test]
    fn build_request_rejects_empty_history() {
        let formatter = AnthropicFormatter;
        let request = formatter.build_request(&[], &config(), &RequestOptions::default());
        assert!(request.is_err());
    }

    #[test]
    fn parse_response_extracts_tool_use_block() {
        let formatter = AnthropicFormatter;
        let body = json!({
            "id": "msg_1",
            "model": "claude-opus-4",
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
            "content": [{"type": "tool_use", "id": "call_1", "name": "read_file", "input": {"path": "x"}}],
        });
        let message = formatter.parse_response(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(matches!(&message.parts[0], Part::FunctionCall { name, .. } if name == "read_file"));
        assert_eq!(message.finish_reason, Some("tool_use".to_string()));
    }

    #[test]
    fn streamed_tool_use_accumulates_partial_json_across_chunks() {
        let formatter = AnthropicFormatter;
        let mut scratch = StreamScratch::new();
        formatter
            .parse_stream_chunk(
                &json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "call_1", "name": "read_file"}}),
                &mut scratch,
            )
            .unwrap();
        formatter
            .parse_stream_chunk(&json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"path\""}}), &mut scratch)
            .unwrap();
        formatter
            .parse_stream_chunk(&json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": ":\"x\"}"}}), &mut scratch)
            .unwrap();
        let delta = formatter.parse_stream_chunk(&json!({"type": "content_block_stop", "index": 0}), &mut scratch).unwrap();
        match &delta.parts[0] {
            Part::FunctionCall { name, args, .. } => {
                assert_eq!(name, "read_file");
                assert_eq!(args["path"], "x");
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
    }
}
