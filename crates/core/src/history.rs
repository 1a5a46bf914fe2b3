//! Shared history-normalization steps every [`crate::formatter::ProviderFormatter`]
//! applies before serializing history into its own wire shape (§4.2).
//!
//! Centralized here so the xml/json tool-call rewrite and the coalescing
//! rule can't drift between dialects; a formatter's `build_request` should
//! call [`normalize_history`] first and then translate the result into its
//! own request body.

use crate::codec::{encode_function_call, encode_function_response};
use crate::message::{Message, Part, Role};
use crate::tool::ToolMode;

/// Runs the full §4.2 history-normalization pipeline:
/// 1. Strip internal markers.
/// 2. (Role aliasing happens at deserialization time into [`Role`]; nothing
///    to do here since the canonical model has no alias roles left.)
/// 3. Drop everything before the first `user` message.
/// 4. Coalesce consecutive same-role messages.
/// 5. For xml/json tool modes, rewrite function calls/responses into text.
pub fn normalize_history(history: &[Message], tool_mode: ToolMode) -> Vec<Message> {
    let stripped: Vec<Message> = history.iter().map(Message::without_internal_markers).collect();
    let from_first_user = drop_until_first_user(stripped);
    let coalesced = coalesce_same_role(from_first_user);
    rewrite_tool_calls(coalesced, tool_mode)
}

fn drop_until_first_user(history: Vec<Message>) -> Vec<Message> {
    match history.iter().position(|m| m.role == Role::User) {
        Some(idx) => history.into_iter().skip(idx).collect(),
        None => Vec::new(),
    }
}

fn coalesce_same_role(history: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(history.len());
    for message in history {
        if let Some(last) = out.last_mut() {
            if last.role == message.role {
                last.parts.extend(message.parts);
                continue;
            }
        }
        out.push(message);
    }
    out
}

fn rewrite_tool_calls(history: Vec<Message>, tool_mode: ToolMode) -> Vec<Message> {
    if tool_mode == ToolMode::FunctionCall {
        return history;
    }
    history
        .into_iter()
        .map(|mut message| {
            let mut rewritten = Vec::with_capacity(message.parts.len());
            for part in message.parts.drain(..) {
                match part {
                    Part::FunctionCall { name, args, .. } => {
                        rewritten.push(Part::text(encode_function_call(&name, &args, tool_mode)));
                    }
                    Part::FunctionResponse { id, name, response, parts } => {
                        rewritten.push(Part::text(encode_function_response(&id, &name, &response, tool_mode)));
                        for sibling in parts.into_iter().flatten() {
                            if matches!(sibling, Part::InlineData { .. } | Part::FileData { .. }) {
                                rewritten.push(sibling);
                            }
                        }
                    }
                    other => rewritten.push(other),
                }
            }
            message.parts = rewritten;
            message
        })
        .collect()
}

/// Down-converts text-bearing `InlineData` attachments (MIME `text/*`,
/// `application/json`, or containing `+xml`) into a text part with an
/// `Attachment (mime) name: ...` header, for dialects/turn options that
/// can't carry arbitrary inline binary blobs.
pub fn downconvert_text_attachments(history: Vec<Message>) -> Vec<Message> {
    history
        .into_iter()
        .map(|mut message| {
            message.parts = message
                .parts
                .into_iter()
                .map(|part| match &part {
                    Part::InlineData { mime_type, base64, display_name } if is_text_mime(mime_type) => {
                        let decoded = base64_decode_lossy(base64);
                        let name = display_name.clone().unwrap_or_default();
                        Part::text(format!("Attachment ({mime_type}) {name}:\n{decoded}"))
                    }
                    _ => part,
                })
                .collect();
            message
        })
        .collect()
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json" || mime.contains("+xml")
}

fn base64_decode_lossy(data: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(text: &str) -> Message {
        Message::user(text)
    }

    #[test]
    fn drops_leading_model_messages_before_first_user() {
        let history = vec![Message::model("stray"), user("hi")];
        let normalized = normalize_history(&history, ToolMode::FunctionCall);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].role, Role::User);
    }

    #[test]
    fn coalesces_consecutive_same_role_messages() {
        let history = vec![user("a"), user("b")];
        let normalized = normalize_history(&history, ToolMode::FunctionCall);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].parts.len(), 2);
    }

    #[test]
    fn xml_mode_rewrites_function_call_to_text() {
        let history = vec![Message::new(
            Role::Model,
            vec![Part::function_call("id1", "read_file", json!({"path": "x"}))],
        )];
        let normalized = normalize_history(&history, ToolMode::Xml);
        assert!(matches!(&normalized[0].parts[0], Part::Text { text, .. } if text.contains("read_file")));
    }

    #[test]
    fn function_response_multimodal_children_are_resurfaced_as_siblings() {
        let mut response = Part::function_response("id1", "screenshot", json!({"ok": true}));
        if let Part::FunctionResponse { parts, .. } = &mut response {
            *parts = Some(vec![Part::InlineData {
                mime_type: "image/png".into(),
                base64: "AAA=".into(),
                display_name: None,
            }]);
        }
        let history = vec![Message::new(Role::User, vec![response])];
        let normalized = normalize_history(&history, ToolMode::Json);
        assert_eq!(normalized[0].parts.len(), 2);
        assert!(matches!(normalized[0].parts[1], Part::InlineData { .. }));
    }

    #[test]
    fn internal_markers_are_stripped_before_other_steps() {
        let history = vec![Message::new(
            Role::User,
            vec![Part::text("hi"), Part::InternalMarker { kind: "k".into(), payload: json!(1) }],
        )];
        let normalized = normalize_history(&history, ToolMode::FunctionCall);
        assert_eq!(normalized[0].parts.len(), 1);
    }
}
