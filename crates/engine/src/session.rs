//! `ConversationStore`: the sole conversation-global mutable state (§5),
//! consumed by the driver/facade and implemented by the host.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use loopcore::message::Message;

use crate::error::StoreError;

/// Persistence interface for conversation history and per-conversation
/// metadata (§6). Implementations MUST provide read-your-writes semantics
/// for a single conversation id and serialize writes per conversation id —
/// matching `SessionStore`'s "per-session locks rather than global locks"
/// discipline in the source project.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_history(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Read-only snapshot used for iteration logic; implementations may
    /// return a cheaper clone/reference than [`Self::get_history`] if their
    /// storage supports it, but the default behavior is identical.
    async fn get_history_ref(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.get_history(conversation_id).await
    }

    async fn get_message(&self, conversation_id: &str, index: usize) -> Result<Option<Message>, StoreError>;

    async fn add_content(&self, conversation_id: &str, message: Message) -> Result<(), StoreError>;

    async fn update_message(&self, conversation_id: &str, index: usize, message: Message) -> Result<(), StoreError>;

    /// Truncates history to `[0, from_index)`, returning the removed count.
    async fn delete_to_message(&self, conversation_id: &str, from_index: usize) -> Result<usize, StoreError>;

    async fn get_custom_metadata(&self, conversation_id: &str, key: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn set_custom_metadata(&self, conversation_id: &str, key: &str, value: Option<JsonValue>) -> Result<(), StoreError>;
}
