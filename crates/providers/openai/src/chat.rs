//! OpenAI Chat Completions dialect: `POST /chat/completions`.

use std::collections::HashMap;

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

#[derive(Default)]
pub struct OpenAiChatFormatter;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool<'a>>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction<'a>,
}

#[derive(Serialize)]
struct ChatFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a JsonValue,
}

impl ProviderFormatter for OpenAiChatFormatter {
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

        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &normalized {
            messages.extend(to_chat_messages(message));
        }
        if messages.is_empty() {
            return Err(EngineError::ValidationError("history produced no messages to send".into()));
        }

        let chat_tools = if config.tool_mode == ToolMode::FunctionCall && !options.skip_tools && !tools.is_empty() {
            Some(tools.iter().map(to_chat_tool).collect())
        } else {
            None
        };

        let body = ChatRequest { model: &config.model, messages, tools: chat_tools, stream: config.prefer_stream };

        let api_key = config.credential.resolve()?;
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("authorization".to_string(), format!("Bearer {api_key}"));
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
        let raw: ChatResponse = serde_json::from_slice(body).map_err(|e| EngineError::ParseError(format!("openai chat response: {e}")))?;
        let choice = raw.choices.into_iter().next().ok_or_else(|| EngineError::ParseError("no choices in response".into()))?;
        let mut parts = Vec::new();
        if let Some(content) = choice.message.content {
            if !content.is_empty() {
                parts.push(Part::text(content));
            }
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            let args: JsonValue = serde_json::from_str(&call.function.arguments).unwrap_or(JsonValue::Null);
            parts.push(Part::function_call(call.id, call.function.name, args));
        }
        Ok(ModelMessage {
            parts,
            finish_reason: choice.finish_reason,
            usage: raw.usage.map(|u| Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens }),
            model_version: raw.model,
            response_id: raw.id,
        })
    }

    fn parse_stream_chunk(&self, value: &JsonValue, scratch: &mut StreamScratch) -> Result<StreamDelta, EngineError> {
        let id = value.get("id").and_then(|v| v.as_str()).map(String::from);
        let model = value.get("model").and_then(|v| v.as_str()).map(String::from);
        let usage = value
            .get("usage")
            .and_then(|u| serde_json::from_value::<ChatUsage>(u.clone()).ok())
            .map(|u| Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens });

        let Some(choice) = value.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) else {
            return Ok(StreamDelta { response_id: id, model_version: model, usage, ..Default::default() });
        };

        let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).map(String::from);
        let mut parts = Vec::new();

        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                if !content.is_empty() {
                    parts.push(Part::text(content));
                }
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in tool_calls {
                    let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        scratch.insert(format!("call_{index}_id"), json!(id));
                    }
                    if let Some(name) = call.get("function").and_then(|f| f.get("name")).and_then(|v| v.as_str()) {
                        scratch.insert(format!("call_{index}_name"), json!(name));
                    }
                    if let Some(fragment) = call.get("function").and_then(|f| f.get("arguments")).and_then(|v| v.as_str()) {
                        let key = format!("call_{index}_args");
                        let existing = scratch.get(&key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                        scratch.insert(key, json!(format!("{existing}{fragment}")));
                    }
                }
            }
        }

        let done = finish_reason.is_some();
        if done {
            // Flush any tool calls accumulated in scratch into FunctionCall parts.
            let mut indices: Vec<u64> = scratch
                .keys()
                .filter_map(|k| k.strip_prefix("call_")?.split('_').next()?.parse().ok())
                .collect();
            indices.sort_unstable();
            indices.dedup();
            for index in indices {
                let id = scratch.remove(&format!("call_{index}_id")).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
                let name = scratch.remove(&format!("call_{index}_name")).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
                let args_str = scratch.remove(&format!("call_{index}_args")).and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
                let args = serde_json::from_str(&args_str).unwrap_or(JsonValue::Null);
                parts.push(Part::function_call(id, name, args));
            }
        }

        Ok(StreamDelta { parts, done, finish_reason, usage, model_version: model, response_id: id, event: None })
    }
}

fn to_chat_tool(tool: &Tool) -> ChatTool<'_> {
    ChatTool {
        tool_type: "function",
        function: ChatFunction { name: &tool.function.name, description: &tool.function.description, parameters: &tool.function.parameters },
    }
}

fn to_chat_messages(message: &Message) -> Vec<JsonValue> {
    let role = match message.role {
        Role::User => "user",
        Role::Model => "assistant",
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();
    let mut images = Vec::new();

    for part in &message.parts {
        match part {
            Part::Text { text: t, .. } => text.push_str(t),
            Part::FunctionCall { id, name, args } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": serde_json::to_string(args).unwrap_or_default()},
            })),
            Part::FunctionResponse { id, response, .. } => tool_results.push(json!({
                "role": "tool",
                "tool_call_id": id,
                "content": response.to_string(),
            })),
            Part::InlineData { mime_type, base64, .. } => images.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{mime_type};base64,{base64}")},
            })),
            Part::FileData { uri, .. } => images.push(json!({"type": "image_url", "image_url": {"url": uri}})),
            Part::InternalMarker { .. } => {}
        }
    }

    let mut out = Vec::new();
    if !tool_calls.is_empty() {
        out.push(json!({
            "role": role,
            "content": if text.is_empty() { JsonValue::Null } else { json!(text) },
            "tool_calls": tool_calls,
        }));
    } else if !images.is_empty() {
        let mut content = vec![json!({"type": "text", "text": text})];
        content.extend(images);
        out.push(json!({"role": role, "content": content}));
    } else {
        out.push(json!({"role": role, "content": text}));
    }
    out.extend(tool_results);
    out
}

#[derive(Deserialize)]
struct ChatResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatToolCallFunction,
}

#[derive(Deserialize)]
struct ChatToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcore::channel::{CredentialRef, ProviderKind, RetryConfig};

    fn config() -> ChannelConfig {
        ChannelConfig {
            id: "c".into(),
            provider: ProviderKind::OpenAiChat,
            endpoint_url: "https://api.openai.com/v1/chat/completions".into(),
            credential: CredentialRef::Named("key".into()),
            model: "gpt-4o".into(),
            system_instruction: None,
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
    fn build_request_uses_bearer_auth() {
        let formatter = OpenAiChatFormatter;
        let history = vec![Message::user("hi")];
        let request = formatter.build_request(&history, &config(), &RequestOptions::default()).unwrap();
        assert_eq!(request.headers.get("authorization"), Some(&"Bearer key".to_string()));
    }

    #[test]
    fn streamed_tool_call_arguments_accumulate_across_chunks_until_finish_reason() {
        let formatter = OpenAiChatFormatter;
        let mut scratch = StreamScratch::new();
        formatter
            .parse_stream_chunk(&json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": "{\"path\""}}]}}]}), &mut scratch)
            .unwrap();
        let delta = formatter
            .parse_stream_chunk(&json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": ":\"x\"}"}}]}}], "finish_reason": "tool_calls"}]}), &mut scratch)
            .unwrap();
        assert!(delta.done);
        match &delta.parts[0] {
            Part::FunctionCall { name, args, .. } => {
                assert_eq!(name, "read_file");
                assert_eq!(args["path"], "x");
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
    }

    #[test]
    fn parse_response_maps_usage_fields() {
        let formatter = OpenAiChatFormatter;
        let body = json!({
            "id": "chatcmpl_1", "model": "gpt-4o",
            "choices": [{"message": {"content": "hi", "tool_calls": null}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1},
        });
        let message = formatter.parse_response(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(message.usage.unwrap().input_tokens, 3);
    }
}
