//! `ContextTrimmer` and `ContextAssembler` (§4.5/§4.6): turns full
//! conversation history plus static configuration into the exact
//! history/system-instruction/tool-list triple a [`crate::execution::ToolLoopDriver`]
//! iteration hands to a `ProviderFormatter`.

use serde_json::Value as JsonValue;

use loopcore::channel::ChannelConfig;
use loopcore::message::{Message, Part};
use loopcore::tool::Tool;

/// Tools always available in locate mode (§6 glossary), regardless of the
/// caller's own allow-list.
pub const LOCATE_MODE_TOOLS: &[&str] = &["search_in_files", "find_files", "read_file", "get_errors", "get_usages", "open_file"];

#[derive(Debug, Clone, Default)]
pub struct TrimSummary {
    pub full_history_count: usize,
    pub trimmed_history_count: usize,
    pub trim_start_index: usize,
    pub last_summary_index: Option<usize>,
}

/// Crude token estimate: one token per four characters of rendered text plus
/// the JSON encoding of any structured payload (function-call args, tool
/// responses). Good enough to keep trimming monotonic; not a tokenizer.
fn estimate_message_tokens(message: &Message) -> usize {
    let mut chars = 0usize;
    for part in &message.parts {
        chars += match part {
            Part::Text { text, .. } => text.len(),
            Part::FunctionCall { name, args, .. } => name.len() + args.to_string().len(),
            Part::FunctionResponse { name, response, .. } => name.len() + response.to_string().len(),
            Part::InlineData { base64, .. } => base64.len(),
            Part::FileData { uri, .. } => uri.len(),
            Part::InternalMarker { .. } => 0,
        };
    }
    chars / 4 + 4
}

pub(crate) fn estimate_history_tokens(history: &[Message]) -> usize {
    history.iter().map(estimate_message_tokens).sum()
}

/// Drops the oldest turns until the estimated token count is under the
/// configured threshold, never crossing `last_summary_index` and never
/// separating a `FunctionCall` from its paired `FunctionResponse`.
pub struct ContextTrimmer;

impl ContextTrimmer {
    pub fn trim(history: &[Message], threshold: f64, threshold_is_percent: bool, context_window_tokens: usize) -> (Vec<Message>, TrimSummary) {
        let last_summary_index = history.iter().enumerate().rev().find(|(_, m)| m.metadata.is_summary == Some(true)).map(|(i, _)| i);
        // The anchor message itself is always sent (it "replaces everything
        // before it for wire purposes", not everything including itself), so
        // dropping only ever considers messages strictly after it.
        let floor = last_summary_index.unwrap_or(0);
        let droppable_start = if last_summary_index.is_some() { floor + 1 } else { floor };

        let threshold_tokens = if threshold_is_percent {
            ((threshold / 100.0) * context_window_tokens as f64).round() as usize
        } else {
            threshold.round() as usize
        };

        let mut start = droppable_start;
        let mut total = estimate_history_tokens(&history[floor..]);

        while total > threshold_tokens && start < history.len() {
            let dropped = &history[start];
            let mut step = 1usize;
            if dropped.function_calls().first().is_some() {
                if let Some(next) = history.get(start + 1) {
                    if next.metadata.is_function_response == Some(true) {
                        step = 2;
                    }
                }
            }
            for msg in &history[start..(start + step).min(history.len())] {
                total = total.saturating_sub(estimate_message_tokens(msg));
            }
            start += step;
        }

        let mut trimmed = Vec::new();
        if let Some(idx) = last_summary_index {
            trimmed.push(history[idx].clone());
        }
        trimmed.extend(history[start..].iter().cloned());

        let trim_start_index = if last_summary_index.is_some() { floor } else { start };
        let summary = TrimSummary {
            full_history_count: history.len(),
            trimmed_history_count: trimmed.len(),
            trim_start_index,
            last_summary_index,
        };
        (trimmed, summary)
    }
}

/// Rendered, non-authoritative view of what a given turn's assembled context
/// contains; surfaced to hosts for debugging/UI purposes only.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub preview: String,
    pub modules: Vec<String>,
    pub tool_count: usize,
    pub mcp_tool_count: usize,
    pub trim_summary: TrimSummary,
}

impl ContextSnapshot {
    /// Splits a composed system instruction on the `====\n\n<TITLE>\n\n`
    /// module markers the source project's context dump uses, returning the
    /// list of module titles found.
    fn segment_modules(system_instruction: &str) -> Vec<String> {
        system_instruction
            .split("====\n\n")
            .skip(1)
            .filter_map(|segment| segment.split("\n\n").next())
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
            .collect()
    }

    fn build(system_instruction: &str, tools: &[Tool], trim_summary: TrimSummary) -> Self {
        let mcp_tool_count = tools.iter().filter(|t| t.function.name.starts_with("mcp_")).count();
        let preview: String = system_instruction.chars().take(280).collect();
        ContextSnapshot { preview, modules: Self::segment_modules(system_instruction), tool_count: tools.len(), mcp_tool_count, trim_summary }
    }
}

pub struct AssembledContext {
    pub history: Vec<Message>,
    pub system_instruction: String,
    pub tools: Vec<Tool>,
    pub snapshot: ContextSnapshot,
}

/// Inputs an assembler call needs beyond the static [`ChannelConfig`]: the
/// per-turn state a [`crate::flow::FlowFacade`] entry point has on hand.
#[derive(Debug, Clone, Default)]
pub struct AssemblyRequest {
    pub context_window_tokens: usize,
    pub pinned_prompt: Option<String>,
    pub pinned_selections: Vec<String>,
    pub dynamic_system_prompt: Option<String>,
    /// Restricts the tool list to this allow-list when set (locate mode uses
    /// [`LOCATE_MODE_TOOLS`] plus whatever the caller adds).
    pub tool_allow_list: Option<Vec<String>>,
    pub locate_mode: bool,
}

pub struct ContextAssembler;

impl ContextAssembler {
    pub fn assemble(history: &[Message], config: &ChannelConfig, all_tools: &[Tool], request: &AssemblyRequest) -> AssembledContext {
        let (trimmed, trim_summary) = ContextTrimmer::trim(history, config.context_threshold, config.context_threshold_is_percent, request.context_window_tokens);

        let tools = Self::filter_tools(all_tools, request);

        let system_instruction = Self::compose_system_instruction(config, request, &tools);

        let snapshot = ContextSnapshot::build(&system_instruction, &tools, trim_summary);

        AssembledContext { history: trimmed, system_instruction, tools, snapshot }
    }

    fn filter_tools(all_tools: &[Tool], request: &AssemblyRequest) -> Vec<Tool> {
        let mut allow_list = request.tool_allow_list.clone();
        if request.locate_mode {
            let mut names: Vec<String> = LOCATE_MODE_TOOLS.iter().map(|s| s.to_string()).collect();
            if let Some(extra) = &allow_list {
                names.extend(extra.iter().cloned());
            }
            allow_list = Some(names);
        }

        match allow_list {
            Some(names) => all_tools.iter().filter(|t| names.iter().any(|n| n == &t.function.name)).cloned().collect(),
            None => all_tools.to_vec(),
        }
    }

    fn compose_system_instruction(config: &ChannelConfig, request: &AssemblyRequest, tools: &[Tool]) -> String {
        let tool_block = loopcore::tool::render_tool_block(tools, config.tool_mode);
        let mut instruction = loopcore::formatter::compose_system_instruction(config, request.dynamic_system_prompt.as_deref(), &tool_block);

        if let Some(pinned) = &request.pinned_prompt {
            instruction.push_str("\n\n====\n\nPinned Instructions\n\n");
            instruction.push_str(pinned);
        }

        if !request.pinned_selections.is_empty() {
            instruction.push_str("\n\n====\n\nPinned Selections\n\n");
            for selection in &request.pinned_selections {
                instruction.push_str(selection);
                instruction.push_str("\n\n");
            }
        }

        if request.locate_mode {
            instruction.push_str("\n\n====\n\nLocate Mode\n\n");
            instruction.push_str("Restrict yourself to read-only inspection tools while locating the relevant code.");
        }

        instruction
    }

    /// Renders the `selectionReferences` a `FunctionResponse`-answering user
    /// message carries, as a single context block, for inclusion by callers
    /// that build such a message directly (outside of `assemble`).
    pub fn render_selection_references(selections: &[String]) -> JsonValue {
        JsonValue::Array(selections.iter().map(|s| JsonValue::String(s.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcore::message::{Message, Part, Role};
    use loopcore::tool::{FunctionTool, ToolMode};
    use serde_json::json;

    fn user_msg(text: &str) -> Message {
        Message::user(text)
    }

    #[test]
    fn trim_never_crosses_last_summary_index() {
        let mut history = vec![user_msg("a"), Message::model("b")];
        let mut summary = Message::model("summary");
        summary.metadata.is_summary = Some(true);
        history.push(summary);
        history.push(user_msg("c"));

        // Threshold is generous, so nothing after the anchor needs dropping;
        // this isolates the summary-barrier behavior from the drop loop.
        let (trimmed, summary_info) = ContextTrimmer::trim(&history, 1000.0, false, 1000);
        assert_eq!(summary_info.last_summary_index, Some(2));
        assert_eq!(summary_info.trim_start_index, 2);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].text(), "summary");
        assert_eq!(trimmed[1].text(), "c");
    }

    #[test]
    fn trim_drops_function_call_and_response_together() {
        let call = Message::new(Role::Model, vec![Part::function_call("fc_1", "read_file", json!({"path": "a"}))]);
        let mut response = Message::new(Role::User, vec![Part::function_response("fc_1", "read_file", json!({"ok": true}))]);
        response.metadata.is_function_response = Some(true);
        let history = vec![user_msg("long ".repeat(50).as_str()), call, response, user_msg("final")];

        // Threshold (20) is crossed by the first message (66 tokens) alone;
        // dropping it still leaves the call/response pair (9+9) over budget,
        // so both get dropped together in one step, leaving only "final".
        let (trimmed, summary) = ContextTrimmer::trim(&history, 20.0, false, 1000);
        assert_eq!(summary.last_summary_index, None);
        assert_eq!(summary.trim_start_index, 3);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].text(), "final");
    }

    #[test]
    fn locate_mode_restricts_tool_list() {
        let tool = |name: &str| Tool {
            tool_type: "function".into(),
            function: FunctionTool { name: name.into(), description: String::new(), parameters: json!({}) },
        };
        let tools = vec![tool("read_file"), tool("run_shell_command")];
        let request = AssemblyRequest { locate_mode: true, ..Default::default() };
        let filtered = ContextAssembler::filter_tools(&tools, &request);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].function.name, "read_file");
    }

    #[test]
    fn assemble_includes_pinned_prompt_and_selections() {
        let config = ChannelConfig {
            id: "cfg".into(),
            provider: loopcore::channel::ProviderKind::Anthropic,
            endpoint_url: "https://example".into(),
            credential: loopcore::channel::CredentialRef::EnvVar("X".into()),
            model: "m".into(),
            system_instruction: Some("base prompt".into()),
            tool_mode: ToolMode::FunctionCall,
            context_threshold: 32_000.0,
            context_threshold_is_percent: false,
            retry: Default::default(),
            custom_headers: Default::default(),
            custom_body_overlay: None,
            timeout_seconds: 120,
            prefer_stream: true,
            send_history_thoughts: false,
            send_history_thought_signatures: false,
            enabled: true,
        };
        let request = AssemblyRequest { pinned_prompt: Some("stay on task".into()), pinned_selections: vec!["src/lib.rs:1-10".into()], ..Default::default() };
        let assembled = ContextAssembler::assemble(&[], &config, &[], &request);
        assert!(assembled.system_instruction.contains("stay on task"));
        assert!(assembled.system_instruction.contains("src/lib.rs:1-10"));
    }
}
