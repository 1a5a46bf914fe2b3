//! Canonical message model, provider-formatter trait, and stream framing
//! for the conversation tool-loop engine.
//!
//! This crate defines the wire-protocol-agnostic core: the `Part`/`Message`
//! data model, the `ProviderFormatter` seam each dialect crate implements,
//! incremental SSE/JSON-lines framing, the stream accumulator, and the
//! tool-call codec. Provider dialects (`loopengine-provider-*`) and the
//! tool-loop driver (`loopengine`) build on top of these types.

/// Incremental folding of stream deltas into a single model message.
pub mod accumulator;

/// Per-conversation channel/provider configuration.
pub mod channel;

/// Tool-call encoding translation (native / xml / json).
pub mod codec;

/// Error taxonomy shared across the wire-protocol and engine layers.
pub mod error;

/// The `ProviderFormatter` trait and its request/response/delta types.
pub mod formatter;

/// Shared history-normalization pipeline (§4.2) every formatter applies
/// before translating into its own wire shape.
pub mod history;

/// Canonical `Part`/`Message`/`Conversation` data model.
pub mod message;

/// Incremental SSE / JSON-lines stream framing.
pub mod stream;

/// Tool declaration types (`Tool`, `ToolChoice`, `ToolMode`, schemas).
pub mod tool;

use serde::{Deserialize, Serialize};

/// A function call the model wants to make, in the provider's raw
/// string-encoded-arguments shape. Lifted into a
/// [`message::Part::FunctionCall`] once args are parsed as JSON.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// The function name and raw (string-encoded) arguments of a [`ToolCall`].
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Token usage for one request, accepting every provider's field-naming
/// convention via serde aliases.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Default)]
pub struct Usage {
    #[serde(
        alias = "prompt_tokens",
        alias = "input_tokens",
        alias = "prompt_eval_count",
        alias = "promptTokenCount"
    )]
    pub input_tokens: u32,
    #[serde(
        alias = "completion_tokens",
        alias = "output_tokens",
        alias = "eval_count",
        alias = "candidatesTokenCount"
    )]
    pub output_tokens: u32,
}
