//! OpenAI Responses dialect: `POST /responses`.
//!
//! Unlike Chat Completions, this dialect is stateful on OpenAI's side:
//! a response carries an id that can be threaded into the next turn's
//! `previous_response_id` instead of resending the full history, and the
//! stream has no single explicit "you're done" event in every case — a
//! connection can close after at least one output item without an
//! unambiguous terminal frame, which is what `infers_done_on_close` signals
//! to the caller's stream-consumption loop.

use std::collections::HashMap;

use http::Method;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use loopcore::channel::ChannelConfig;
use loopcore::error::EngineError;
use loopcore::formatter::{compose_system_instruction, HttpRequest, ModelMessage, ProviderFormatter, RequestOptions, StreamDelta, StreamScratch};
use loopcore::history::normalize_history;
use loopcore::message::{Message, Part, Role, INTERNAL_MARKER_MIME};
use loopcore::tool::{render_tool_block, Tool, ToolMode};
use loopcore::Usage;

#[derive(Default)]
pub struct OpenAiResponsesFormatter;

impl ProviderFormatter for OpenAiResponsesFormatter {
    fn build_request(
        &self,
        history: &[Message],
        config: &ChannelConfig,
        options: &RequestOptions<'_>,
    ) -> Result<HttpRequest, EngineError> {
        let normalized = normalize_history(history, config.tool_mode);
        let tools = options.tools.unwrap_or(&[]);
        let tool_block = if options.skip_tools { String::new() } else { render_tool_block(tools, config.tool_mode) };
        let instructions = compose_system_instruction(config, options.dynamic_system_prompt, &tool_block);

        // With a `previous_response_id`, only the messages after the marker
        // that recorded it need to be resent; OpenAI retains the rest.
        let input: Vec<JsonValue> = if options.previous_response_id.is_some() {
            messages_since_last_marker(&normalized)
        } else {
            normalized.iter().flat_map(to_response_items).collect()
        };

        if input.is_empty() && options.previous_response_id.is_none() {
            return Err(EngineError::ValidationError("history produced no input items to send".into()));
        }

        let response_tools = if config.tool_mode == ToolMode::FunctionCall && !options.skip_tools && !tools.is_empty() {
            Some(tools.iter().map(to_response_tool).collect::<Vec<_>>())
        } else {
            None
        };

        let mut body = json!({
            "model": config.model,
            "input": input,
            "instructions": instructions,
            "stream": config.prefer_stream,
        });
        if let Some(tools) = response_tools {
            body["tools"] = json!(tools);
        }
        if let Some(previous) = options.previous_response_id {
            body["previous_response_id"] = json!(previous);
        }
        if let Some(cache_key) = options.prompt_cache_key {
            body["prompt_cache_key"] = json!(cache_key);
        }
        if let Some(overlay) = &config.custom_body_overlay {
            merge_overlay(&mut body, overlay);
        }

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
        let raw: ResponsesBody = serde_json::from_slice(body).map_err(|e| EngineError::ParseError(format!("openai responses body: {e}")))?;
        let mut parts = Vec::new();
        for item in &raw.output {
            parts.extend(output_item_to_parts(item));
        }
        Ok(ModelMessage {
            parts,
            finish_reason: raw.status,
            usage: raw.usage.map(|u| Usage { input_tokens: u.input_tokens, output_tokens: u.output_tokens }),
            model_version: raw.model,
            response_id: raw.id,
        })
    }

    fn parse_stream_chunk(&self, value: &JsonValue, scratch: &mut StreamScratch) -> Result<StreamDelta, EngineError> {
        let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or_default();

        match event_type {
            "response.created" | "response.in_progress" => {
                let response_id = value.pointer("/response/id").and_then(|v| v.as_str()).map(String::from);
                Ok(StreamDelta { response_id, event: Some(event_type.into()), ..Default::default() })
            }
            "response.output_text.delta" => {
                let text = value.get("delta").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(StreamDelta { parts: vec![Part::text(text)], event: Some(event_type.into()), ..Default::default() })
            }
            "response.function_call_arguments.delta" => {
                let item_id = value.get("item_id").and_then(|v| v.as_str()).unwrap_or_default();
                let fragment = value.get("delta").and_then(|v| v.as_str()).unwrap_or_default();
                let key = format!("call_{item_id}_args");
                let existing = scratch.get(&key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                scratch.insert(key, json!(format!("{existing}{fragment}")));
                Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() })
            }
            "response.output_item.added" => {
                if let Some(item) = value.get("item") {
                    if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                        let item_id = item.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                        let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or(item_id);
                        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                        scratch.insert(format!("call_{item_id}_id"), json!(call_id));
                        scratch.insert(format!("call_{item_id}_name"), json!(name));
                    }
                }
                Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() })
            }
            "response.output_item.done" => {
                let item = value.get("item");
                if item.and_then(|i| i.get("type")).and_then(|v| v.as_str()) == Some("function_call") {
                    let item_id = item.and_then(|i| i.get("id")).and_then(|v| v.as_str()).unwrap_or_default();
                    let id = scratch
                        .remove(&format!("call_{item_id}_id"))
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| item_id.to_string());
                    let name = scratch
                        .remove(&format!("call_{item_id}_name"))
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default();
                    let args_str = scratch
                        .remove(&format!("call_{item_id}_args"))
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default();
                    let args = serde_json::from_str(&args_str).unwrap_or(JsonValue::Null);
                    Ok(StreamDelta { parts: vec![Part::function_call(id, name, args)], event: Some(event_type.into()), ..Default::default() })
                } else {
                    Ok(StreamDelta { event: Some(event_type.into()), ..Default::default() })
                }
            }
            "response.completed" | "response.failed" | "response.incomplete" => {
                let finish_reason = value.pointer("/response/status").and_then(|v| v.as_str()).map(String::from);
                let usage = value
                    .pointer("/response/usage")
                    .and_then(|u| serde_json::from_value::<ResponsesUsage>(u.clone()).ok())
                    .map(|u| Usage { input_tokens: u.input_tokens, output_tokens: u.output_tokens });
                let response_id = value.pointer("/response/id").and_then(|v| v.as_str()).map(String::from);
                Ok(StreamDelta { done: true, finish_reason, usage, response_id, event: Some(event_type.into()), ..Default::default() })
            }
            other => Ok(StreamDelta { event: Some(other.into()), ..Default::default() }),
        }
    }

    fn infers_done_on_close(&self) -> bool {
        true
    }
}

fn merge_overlay(body: &mut JsonValue, overlay: &JsonValue) {
    if let (Some(body_obj), Some(overlay_obj)) = (body.as_object_mut(), overlay.as_object()) {
        for (k, v) in overlay_obj {
            body_obj.insert(k.clone(), v.clone());
        }
    }
}

/// Finds the most recent `InternalMarker { kind: "openai-responses", .. }`
/// in `history` and returns only the items after it, converted to Responses
/// `input` entries — the marker records the `previous_response_id` that
/// already covers everything up to and including it.
fn messages_since_last_marker(history: &[Message]) -> Vec<JsonValue> {
    let marker_index = history.iter().rposition(|m| {
        m.parts.iter().any(|p| matches!(p, Part::InternalMarker { kind, .. } if kind == "openai-responses"))
            || m.parts.iter().any(|p| matches!(p, Part::InlineData { mime_type, .. } if mime_type == INTERNAL_MARKER_MIME))
    });
    let start = marker_index.map(|i| i + 1).unwrap_or(0);
    history[start..].iter().flat_map(to_response_items).collect()
}

fn to_response_tool(tool: &Tool) -> JsonValue {
    json!({
        "type": "function",
        "name": tool.function.name,
        "description": tool.function.description,
        "parameters": tool.function.parameters,
    })
}

fn to_response_items(message: &Message) -> Vec<JsonValue> {
    let role = match message.role {
        Role::User => "user",
        Role::Model => "assistant",
    };
    let mut items = Vec::new();
    let mut text = String::new();
    for part in &message.parts {
        match part {
            Part::Text { text: t, .. } => text.push_str(t),
            Part::FunctionCall { id, name, args } => items.push(json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": serde_json::to_string(args).unwrap_or_default(),
            })),
            Part::FunctionResponse { id, response, .. } => items.push(json!({
                "type": "function_call_output",
                "call_id": id,
                "output": response.to_string(),
            })),
            Part::InlineData { mime_type, base64, .. } => items.push(json!({
                "type": "message",
                "role": role,
                "content": [{"type": "input_image", "image_url": format!("data:{mime_type};base64,{base64}")}],
            })),
            Part::FileData { uri, .. } => items.push(json!({
                "type": "message",
                "role": role,
                "content": [{"type": "input_image", "image_url": uri}],
            })),
            Part::InternalMarker { .. } => {}
        }
    }
    if !text.is_empty() {
        items.insert(0, json!({"type": "message", "role": role, "content": [{"type": "input_text", "text": text}]}));
    }
    items
}

fn output_item_to_parts(item: &ResponsesOutputItem) -> Vec<Part> {
    match item.item_type.as_str() {
        "message" => item
            .content
            .iter()
            .flatten()
            .filter_map(|c| c.text.as_ref())
            .map(Part::text)
            .collect(),
        "function_call" => {
            let args = item.arguments.as_deref().and_then(|s| serde_json::from_str(s).ok()).unwrap_or(JsonValue::Null);
            vec![Part::function_call(
                item.call_id.clone().unwrap_or_default(),
                item.name.clone().unwrap_or_default(),
                args,
            )]
        }
        _ => Vec::new(),
    }
}

#[derive(Deserialize)]
struct ResponsesBody {
    id: Option<String>,
    model: Option<String>,
    status: Option<String>,
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
    usage: Option<ResponsesUsage>,
}

#[derive(Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Option<Vec<ResponsesContent>>,
    call_id: Option<String>,
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ResponsesContent {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponsesUsage {
    #[serde(default, alias = "input_tokens")]
    input_tokens: u32,
    #[serde(default, alias = "output_tokens")]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcore::channel::{CredentialRef, ProviderKind, RetryConfig};

    fn config() -> ChannelConfig {
        ChannelConfig {
            id: "c".into(),
            provider: ProviderKind::OpenAiResponses,
            endpoint_url: "https://api.openai.com/v1/responses".into(),
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
    fn build_request_with_previous_response_id_sends_only_messages_after_marker() {
        let formatter = OpenAiResponsesFormatter;
        let history = vec![
            Message::user("first"),
            {
                let mut m = Message::model("ack");
                m.parts.push(Part::InternalMarker { kind: "openai-responses".into(), payload: json!({"id": "resp_1"}) });
                m
            },
            Message::user("second"),
        ];
        let options = RequestOptions { previous_response_id: Some("resp_1"), ..Default::default() };
        let request = formatter.build_request(&history, &config(), &options).unwrap();
        let body: JsonValue = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["input"].as_array().unwrap().len(), 1);
        assert_eq!(body["previous_response_id"], "resp_1");
    }

    #[test]
    fn infers_done_on_close_is_true() {
        assert!(OpenAiResponsesFormatter.infers_done_on_close());
    }

    #[test]
    fn streamed_function_call_arguments_accumulate_until_output_item_done() {
        let formatter = OpenAiResponsesFormatter;
        let mut scratch = StreamScratch::new();
        formatter
            .parse_stream_chunk(
                &json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "read_file"}}),
                &mut scratch,
            )
            .unwrap();
        formatter
            .parse_stream_chunk(&json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"path\":"}), &mut scratch)
            .unwrap();
        formatter
            .parse_stream_chunk(&json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "\"x\"}"}), &mut scratch)
            .unwrap();
        let delta = formatter
            .parse_stream_chunk(&json!({"type": "response.output_item.done", "item": {"type": "function_call", "id": "fc_1"}}), &mut scratch)
            .unwrap();
        match &delta.parts[0] {
            Part::FunctionCall { id, name, args } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "read_file");
                assert_eq!(args["path"], "x");
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
    }

    #[test]
    fn parse_response_extracts_text_and_function_call_items() {
        let formatter = OpenAiResponsesFormatter;
        let body = json!({
            "id": "resp_1", "model": "gpt-4o", "status": "completed",
            "output": [
                {"type": "message", "content": [{"text": "hello"}]},
                {"type": "function_call", "call_id": "call_1", "name": "read_file", "arguments": "{\"path\":\"x\"}"},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let message = formatter.parse_response(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.usage.unwrap().output_tokens, 5);
    }
}
