//! `ToolRegistry`: the dispatch surface the driver calls into (§6). Concrete
//! tool implementations (file I/O, shell, search, ...) are out of scope —
//! the engine only ever sees declarations and an `invoke` operation.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use loopcore::message::Part;
use loopcore::tool::Tool;

/// Arguments for one [`ToolRegistry::invoke`] call.
pub struct ToolInvocation<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub args: &'a JsonValue,
    pub conversation_id: &'a str,
    pub message_index: usize,
    pub abort_signal: CancellationToken,
}

/// Outcome of a dispatched tool call. `cancelled`/`rejected` are mutually
/// exclusive with a successful `response`; both still produce a
/// `FunctionResponse` part so history stays pairwise-complete (§8's
/// tool-call-pairing invariant).
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub response: JsonValue,
    pub multimodal: Vec<Part>,
    pub cancelled: bool,
    pub rejected: bool,
}

impl ToolResult {
    pub fn ok(id: impl Into<String>, name: impl Into<String>, response: JsonValue) -> Self {
        Self { id: id.into(), name: name.into(), response, multimodal: Vec::new(), cancelled: false, rejected: false }
    }

    pub fn cancelled(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: serde_json::json!({"error": "Cancelled by user"}),
            multimodal: Vec::new(),
            cancelled: true,
            rejected: false,
        }
    }

    pub fn rejected(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), response: serde_json::json!({"rejected": true}), multimodal: Vec::new(), cancelled: false, rejected: true }
    }
}

/// Declarations-plus-dispatch surface the driver consumes. Implementations
/// own whatever concrete tool set the host wires up; `needs_confirmation`
/// lets destructive tools gate on user approval before `invoke` ever runs.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn get_declarations_filtered(&self, predicate: &dyn Fn(&Tool) -> bool) -> Vec<Tool>;

    async fn invoke(&self, call: ToolInvocation<'_>) -> ToolResult;

    fn needs_confirmation(&self, name: &str) -> bool;
}
