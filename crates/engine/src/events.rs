//! Driver output events (§6): the asynchronous ordered sequence a
//! [`crate::execution::ToolLoopDriver`] invocation yields to its caller.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use loopcore::formatter::StreamDelta;
use loopcore::message::Message;

use crate::error::DriverEventError;

/// A tool call awaiting dispatch or confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args: JsonValue,
}

/// The outcome of one dispatched tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub id: String,
    pub name: String,
    pub response: JsonValue,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub rejected: bool,
}

/// A named point at which a host may want to persist/display conversation
/// state (before/after a model call, before/after tool dispatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub label: String,
    pub message_index: usize,
}

/// One event in a driver's output sequence, in strict emission order
/// (`checkpoint? → (chunk*) → toolsExecuting? → toolIteration? → next
/// iteration or complete`, per §5's ordering guarantee).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DriverEvent {
    Chunk {
        conversation_id: String,
        chunk: StreamDelta,
    },
    Checkpoint {
        conversation_id: String,
        checkpoints: Vec<Checkpoint>,
        #[serde(default)]
        checkpoint_only: bool,
    },
    ToolsExecuting {
        conversation_id: String,
        content: Message,
        pending_tool_calls: Vec<PendingToolCall>,
    },
    AwaitingConfirmation {
        conversation_id: String,
        content: Message,
        pending_tool_calls: Vec<PendingToolCall>,
    },
    ToolIteration {
        conversation_id: String,
        content: Message,
        tool_results: Vec<ToolResultEvent>,
        #[serde(default)]
        checkpoints: Vec<Checkpoint>,
    },
    Complete {
        conversation_id: String,
        content: Message,
        checkpoints: Vec<Checkpoint>,
    },
    Cancelled {
        conversation_id: String,
    },
    Error {
        conversation_id: String,
        error: DriverEventError,
    },
}

impl DriverEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            DriverEvent::Chunk { conversation_id, .. }
            | DriverEvent::Checkpoint { conversation_id, .. }
            | DriverEvent::ToolsExecuting { conversation_id, .. }
            | DriverEvent::AwaitingConfirmation { conversation_id, .. }
            | DriverEvent::ToolIteration { conversation_id, .. }
            | DriverEvent::Complete { conversation_id, .. }
            | DriverEvent::Cancelled { conversation_id }
            | DriverEvent::Error { conversation_id, .. } => conversation_id,
        }
    }

    /// True once this event terminates the driver's output sequence: no
    /// further event is ever emitted for the same invocation afterward
    /// (the "cancellation terminality" / completion invariants of §8).
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverEvent::Complete { .. } | DriverEvent::Cancelled { .. } | DriverEvent::Error { .. } | DriverEvent::AwaitingConfirmation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_and_cancelled_and_error_and_awaiting_confirmation_are_terminal() {
        assert!(DriverEvent::Cancelled { conversation_id: "c".into() }.is_terminal());
        assert!(DriverEvent::AwaitingConfirmation { conversation_id: "c".into(), content: Message::model(""), pending_tool_calls: vec![] }.is_terminal());
    }

    #[test]
    fn chunk_is_not_terminal() {
        let event = DriverEvent::Chunk { conversation_id: "c".into(), chunk: StreamDelta::default() };
        assert!(!event.is_terminal());
    }
}
