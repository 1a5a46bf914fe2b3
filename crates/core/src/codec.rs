//! Translates tool-call encodings (native `FunctionCall` parts, inline XML,
//! inline fenced JSON) to and from the canonical [`Part::FunctionCall`]
//! shape, both live (as text streams in) and offline (over persisted
//! history).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::message::Part;
use crate::tool::ToolMode;

static XML_TOOL_USE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<tool_use>\s*<tool_name>(?P<name>.*?)</tool_name>\s*<parameters>(?P<params>.*?)</parameters>\s*</tool_use>").unwrap()
});

static JSON_TOOL_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<<<TOOL_CALL>>>(?P<body>.*?)<<<END_TOOL_CALL>>>").unwrap()
});

static PARAM_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(?P<key>[A-Za-z0-9_]+)>(?P<value>.*?)</(?P=key)>").unwrap());

fn synth_id() -> String {
    format!("fc_{}", uuid::Uuid::new_v4().simple())
}

/// A region of inline-encoded tool-call text found by [`scan_for_tool_call`].
pub struct ScannedCall {
    pub start: usize,
    pub end: usize,
    pub call: Part,
}

/// Scans `text` for the first complete inline tool-call encoding under
/// `mode`, returning its byte range and the synthesized [`Part::FunctionCall`].
/// When both XML and JSON regions are present, the earlier-starting one
/// wins (callers should try both modes and compare starts if `mode` is
/// ambiguous; in practice a channel fixes one mode for its whole lifetime).
pub fn scan_for_tool_call(text: &str, mode: ToolMode) -> Option<ScannedCall> {
    match mode {
        ToolMode::FunctionCall => None,
        ToolMode::Xml => scan_xml(text),
        ToolMode::Json => scan_json(text),
    }
}

fn scan_xml(text: &str) -> Option<ScannedCall> {
    let m = XML_TOOL_USE.captures(text)?;
    let whole = m.get(0).unwrap();
    let name = m.name("name")?.as_str().trim().to_string();
    let params_block = m.name("params")?.as_str();
    let mut args = serde_json::Map::new();
    for p in PARAM_TAG.captures_iter(params_block) {
        args.insert(p["key"].to_string(), JsonValue::String(p["value"].trim().to_string()));
    }
    Some(ScannedCall {
        start: whole.start(),
        end: whole.end(),
        call: Part::function_call(synth_id(), name, JsonValue::Object(args)),
    })
}

fn scan_json(text: &str) -> Option<ScannedCall> {
    let m = JSON_TOOL_CALL.captures(text)?;
    let whole = m.get(0).unwrap();
    let body = m.name("body")?.as_str().trim();
    let value: JsonValue = serde_json::from_str(body).ok()?;
    let name = value.get("tool")?.as_str()?.to_string();
    let args = value.get("parameters").cloned().unwrap_or(JsonValue::Object(Default::default()));
    Some(ScannedCall {
        start: whole.start(),
        end: whole.end(),
        call: Part::function_call(synth_id(), name, args),
    })
}

/// Rewrites a [`Part::FunctionCall`] into the xml/json inline text encoding
/// for dialects that don't support native tool calling.
pub fn encode_function_call(name: &str, args: &JsonValue, mode: ToolMode) -> String {
    match mode {
        ToolMode::FunctionCall => String::new(),
        ToolMode::Xml => {
            let mut params = String::new();
            if let JsonValue::Object(map) = args {
                for (k, v) in map {
                    let value_str = match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    params.push_str(&format!("<{k}>{value_str}</{k}>"));
                }
            }
            format!("<tool_use><tool_name>{name}</tool_name><parameters>{params}</parameters></tool_use>")
        }
        ToolMode::Json => {
            let payload = serde_json::json!({"tool": name, "parameters": args});
            format!("<<<TOOL_CALL>>>{}<<<END_TOOL_CALL>>>", payload)
        }
    }
}

/// Rewrites a [`Part::FunctionResponse`] into the xml/json inline text
/// encoding used by dialects that don't support native tool calling. The
/// multimodal children (if any) are NOT included here; callers re-emit
/// them as sibling `InlineData`/`FileData` parts per §4.2 rule 5.
pub fn encode_function_response(id: &str, name: &str, response: &JsonValue, mode: ToolMode) -> String {
    match mode {
        ToolMode::FunctionCall => String::new(),
        ToolMode::Xml => format!(
            "<tool_result><tool_use_id>{id}</tool_use_id><tool_name>{name}</tool_name><content>{}</content></tool_result>",
            response
        ),
        ToolMode::Json => {
            let payload = serde_json::json!({"tool_use_id": id, "tool": name, "response": response});
            format!("<<<TOOL_RESULT>>>{}<<<END_TOOL_RESULT>>>", payload)
        }
    }
}

/// Ensures every [`Part::FunctionCall`] in `parts` has a non-empty id,
/// synthesizing `fc_<random>` for ones a provider omitted.
pub fn ensure_function_call_ids(parts: &mut [Part]) {
    for part in parts.iter_mut() {
        if let Part::FunctionCall { id, .. } = part {
            if id.is_empty() {
                *id = synth_id();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn xml_round_trips_name_and_args() {
        let encoded = encode_function_call("read_file", &json!({"path": "x"}), ToolMode::Xml);
        let scanned = scan_for_tool_call(&format!("Here:\n{encoded}"), ToolMode::Xml).unwrap();
        match scanned.call {
            Part::FunctionCall { name, args, .. } => {
                assert_eq!(name, "read_file");
                assert_eq!(args["path"], "x");
            }
            _ => panic!("expected FunctionCall"),
        }
    }

    #[test]
    fn json_round_trips_name_and_args() {
        let encoded = encode_function_call("list_files", &json!({"path": "/tmp"}), ToolMode::Json);
        let scanned = scan_for_tool_call(&encoded, ToolMode::Json).unwrap();
        match scanned.call {
            Part::FunctionCall { name, args, .. } => {
                assert_eq!(name, "list_files");
                assert_eq!(args["path"], "/tmp");
            }
            _ => panic!("expected FunctionCall"),
        }
    }

    #[test]
    fn ensure_ids_only_fills_empty_ones() {
        let mut parts = vec![
            Part::function_call("", "a", json!({})),
            Part::function_call("kept", "b", json!({})),
        ];
        ensure_function_call_ids(&mut parts);
        match &parts[0] {
            Part::FunctionCall { id, .. } => assert!(id.starts_with("fc_")),
            _ => unreachable!(),
        }
        match &parts[1] {
            Part::FunctionCall { id, .. } => assert_eq!(id, "kept"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn function_call_mode_never_scans_text() {
        let encoded = encode_function_call("x", &json!({}), ToolMode::Xml);
        assert!(scan_for_tool_call(&encoded, ToolMode::FunctionCall).is_none());
    }
}
