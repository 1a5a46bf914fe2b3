//! Gemini dialect: `POST /v1beta/models/{model}:generateContent` and its
//! `streamGenerateContent?alt=sse` sibling.
//!
//! Gemini's request/response shape is `contents`/`parts`/`functionCall`/
//! `functionResponse`, closest to the canonical model of any dialect here,
//! but it is also the dialect subject to the 429-floor backoff spacing and
//! post-first-iteration jitter (`is_gemini_like`).

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
pub struct GeminiFormatter;

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiToolDeclaration>>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Serialize)]
struct GeminiToolDeclaration {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Serialize)]
struct GeminiFunctionDeclaration<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a JsonValue,
}

impl ProviderFormatter for GeminiFormatter {
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

        let contents: Vec<GeminiContent> = normalized.iter().map(to_gemini_content).collect();
        if contents.is_empty() {
            return Err(EngineError::ValidationError("history produced no contents to send".into()));
        }

        let system_instruction = if system.is_empty() {
            None
        } else {
            Some(GeminiContent { role: None, parts: vec![GeminiPart { text: Some(system), inline_data: None, function_call: None, function_response: None }] })
        };

        let gemini_tools = if config.tool_mode == ToolMode::FunctionCall && !options.skip_tools && !tools.is_empty() {
            Some(vec![GeminiToolDeclaration { function_declarations: tools.iter().map(to_gemini_declaration).collect() }])
        } else {
            None
        };

        let body = GeminiRequest { contents, system_instruction, tools: gemini_tools };

        let api_key = config.credential.resolve()?;
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-goog-api-key".to_string(), api_key);
        for (k, v) in &config.custom_headers {
            headers.insert(k.clone(), v.clone());
        }

        let mut url = config.endpoint_url.clone();
        if config.prefer_stream && !url.contains("streamGenerateContent") {
            url = url.replace(":generateContent", ":streamGenerateContent");
            if !url.contains("alt=sse") {
                url.push_str(if url.contains('?') { "&alt=sse" } else { "?alt=sse" });
            }
        }

        Ok(HttpRequest { method: Method::POST, url, headers, body: serde_json::to_vec(&body)?, stream: config.prefer_stream })
    }

    fn parse_response(&self, body: &[u8]) -> Result<ModelMessage, EngineError> {
        let raw: GeminiResponse = serde_json::from_slice(body).map_err(|e| EngineError::ParseError(format!("gemini response: {e}")))?;
        let candidate = raw.candidates.into_iter().next().ok_or_else(|| EngineError::ParseError("no candidates in response".into()))?;
        let parts = candidate.content.map(|c| c.parts.into_iter().map(gemini_part_to_part).collect()).unwrap_or_default();
        Ok(ModelMessage {
            parts,
            finish_reason: candidate.finish_reason,
            usage: raw.usage_metadata.map(|u| Usage { input_tokens: u.prompt_token_count, output_tokens: u.candidates_token_count }),
            model_version: raw.model_version,
            response_id: raw.response_id,
        })
    }

    fn parse_stream_chunk(&self, value: &JsonValue, _scratch: &mut StreamScratch) -> Result<StreamDelta, EngineError> {
        let raw: GeminiResponse = serde_json::from_value(value.clone()).map_err(|e| EngineError::ParseError(format!("gemini stream chunk: {e}")))?;
        let Some(candidate) = raw.candidates.into_iter().next() else {
            return Ok(StreamDelta {
                usage: raw.usage_metadata.map(|u| Usage { input_tokens: u.prompt_token_count, output_tokens: u.candidates_token_count }),
                model_version: raw.model_version,
                response_id: raw.response_id,
                ..Default::default()
            });
        };

        let parts = candidate.content.map(|c| c.parts.into_iter().map(gemini_part_to_part).collect()).unwrap_or_default();
        let done = candidate.finish_reason.is_some();

        Ok(StreamDelta {
            parts,
            done,
            finish_reason: candidate.finish_reason,
            usage: raw.usage_metadata.map(|u| Usage { input_tokens: u.prompt_token_count, output_tokens: u.candidates_token_count }),
            model_version: raw.model_version,
            response_id: raw.response_id,
            event: None,
        })
    }

    fn is_gemini_like(&self) -> bool {
        true
    }
}

fn to_gemini_declaration(tool: &Tool) -> GeminiFunctionDeclaration<'_> {
    GeminiFunctionDeclaration { name: &tool.function.name, description: &tool.function.description, parameters: &tool.function.parameters }
}

fn to_gemini_content(message: &Message) -> GeminiContent {
    let role = match message.role {
        Role::User => "user",
        Role::Model => "model",
    };
    GeminiContent { role: Some(role.into()), parts: message.parts.iter().map(part_to_gemini_part).collect() }
}

fn part_to_gemini_part(part: &Part) -> GeminiPart {
    match part {
        Part::Text { text, .. } => GeminiPart { text: Some(text.clone()), inline_data: None, function_call: None, function_response: None },
        Part::InlineData { mime_type, base64, .. } => GeminiPart {
            text: None,
            inline_data: Some(GeminiBlob { mime_type: mime_type.clone(), data: base64.clone() }),
            function_call: None,
            function_response: None,
        },
        Part::FileData { uri, .. } => GeminiPart { text: Some(format!("[file: {uri}]")), inline_data: None, function_call: None, function_response: None },
        Part::FunctionCall { id, name, args } => GeminiPart {
            text: None,
            inline_data: None,
            function_call: Some(GeminiFunctionCall { name: name.clone(), args: args.clone(), id: Some(id.clone()) }),
            function_response: None,
        },
        Part::FunctionResponse { id, name, response, .. } => GeminiPart {
            text: None,
            inline_data: None,
            function_call: None,
            function_response: Some(GeminiFunctionResponse { name: name.clone(), response: response.clone(), id: Some(id.clone()) }),
        },
        Part::InternalMarker { .. } => GeminiPart { text: None, inline_data: None, function_call: None, function_response: None },
    }
}

fn gemini_part_to_part(part: GeminiPart) -> Part {
    if let Some(call) = part.function_call {
        return Part::function_call(call.id.unwrap_or_default(), call.name, call.args);
    }
    if let Some(response) = part.function_response {
        return Part::function_response(response.id.unwrap_or_default(), response.name, response.response);
    }
    if let Some(blob) = part.inline_data {
        return Part::InlineData { mime_type: blob.mime_type, base64: blob.data, display_name: None };
    }
    Part::text(part.text.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
    response_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcore::channel::{CredentialRef, ProviderKind, RetryConfig};

    fn config() -> ChannelConfig {
        ChannelConfig {
            id: "c".into(),
            provider: ProviderKind::Gemini,
            endpoint_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".into(),
            credential: CredentialRef::Named("key".into()),
            model: "gemini-2.0-flash".into(),
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
    fn build_request_rewrites_url_for_streaming() {
        let formatter = GeminiFormatter;
        let history = vec![Message::user("hi")];
        let request = formatter.build_request(&history, &config(), &RequestOptions::default()).unwrap();
        assert!(request.url.contains("streamGenerateContent"));
        assert!(request.url.contains("alt=sse"));
        assert_eq!(request.headers.get("x-goog-api-key"), Some(&"key".to_string()));
    }

    #[test]
    fn is_gemini_like_is_true() {
        assert!(GeminiFormatter.is_gemini_like());
    }

    #[test]
    fn parse_response_maps_function_call_and_usage() {
        let formatter = GeminiFormatter;
        let body = json!({
            "candidates": [{"content": {"role": "model", "parts": [{"functionCall": {"name": "read_file", "args": {"path": "x"}}}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4},
        });
        let message = formatter.parse_response(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(matches!(&message.parts[0], Part::FunctionCall { name, .. } if name == "read_file"));
        assert_eq!(message.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn parse_stream_chunk_marks_done_when_finish_reason_present() {
        let formatter = GeminiFormatter;
        let mut scratch = StreamScratch::new();
        let chunk = json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}]});
        let delta = formatter.parse_stream_chunk(&chunk, &mut scratch).unwrap();
        assert!(delta.done);
    }
}
