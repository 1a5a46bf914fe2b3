//! In-memory fixtures shared across this crate's test modules, mirroring the
//! source project's habit of keeping a single hand-rolled store/registry pair
//! under test scaffolding rather than a mocking framework.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use loopcore::message::Message;
use loopcore::tool::Tool;

use crate::error::StoreError;
use crate::session::ConversationStore;
use crate::tools::{ToolInvocation, ToolRegistry, ToolResult};

#[derive(Default)]
struct ConversationData {
    history: Vec<Message>,
    metadata: HashMap<String, JsonValue>,
}

/// A single-process, lock-per-call `ConversationStore`. Not meant for
/// production use: the coarse `Mutex<HashMap<..>>` is fine for tests because
/// nothing here holds the lock across an `.await`.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<String, ConversationData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, conversation_id: &str, history: Vec<Message>) {
        let mut guard = self.conversations.lock().unwrap();
        guard.entry(conversation_id.to_string()).or_default().history = history;
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get_history(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let guard = self.conversations.lock().unwrap();
        Ok(guard.get(conversation_id).map(|c| c.history.clone()).unwrap_or_default())
    }

    async fn get_message(&self, conversation_id: &str, index: usize) -> Result<Option<Message>, StoreError> {
        let guard = self.conversations.lock().unwrap();
        Ok(guard.get(conversation_id).and_then(|c| c.history.get(index).cloned()))
    }

    async fn add_content(&self, conversation_id: &str, message: Message) -> Result<(), StoreError> {
        let mut guard = self.conversations.lock().unwrap();
        guard.entry(conversation_id.to_string()).or_default().history.push(message);
        Ok(())
    }

    async fn update_message(&self, conversation_id: &str, index: usize, message: Message) -> Result<(), StoreError> {
        let mut guard = self.conversations.lock().unwrap();
        let data = guard.entry(conversation_id.to_string()).or_default();
        let slot = data.history.get_mut(index).ok_or(StoreError::MessageNotFound(index))?;
        *slot = message;
        Ok(())
    }

    async fn delete_to_message(&self, conversation_id: &str, from_index: usize) -> Result<usize, StoreError> {
        let mut guard = self.conversations.lock().unwrap();
        let data = guard.entry(conversation_id.to_string()).or_default();
        let removed = data.history.len().saturating_sub(from_index);
        data.history.truncate(from_index);
        Ok(removed)
    }

    async fn get_custom_metadata(&self, conversation_id: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let guard = self.conversations.lock().unwrap();
        Ok(guard.get(conversation_id).and_then(|c| c.metadata.get(key).cloned()))
    }

    async fn set_custom_metadata(&self, conversation_id: &str, key: &str, value: Option<JsonValue>) -> Result<(), StoreError> {
        let mut guard = self.conversations.lock().unwrap();
        let data = guard.entry(conversation_id.to_string()).or_default();
        match value {
            Some(v) => {
                data.metadata.insert(key.to_string(), v);
            }
            None => {
                data.metadata.remove(key);
            }
        }
        Ok(())
    }
}

/// A registry that echoes its arguments back as the response, used wherever a
/// test only cares about dispatch shape rather than any particular tool's
/// behavior.
pub struct EchoToolRegistry {
    pub declarations: Vec<Tool>,
    pub confirm_names: Vec<String>,
}

impl EchoToolRegistry {
    pub fn new(declarations: Vec<Tool>) -> Self {
        Self { declarations, confirm_names: Vec::new() }
    }

    pub fn with_confirmation(mut self, name: impl Into<String>) -> Self {
        self.confirm_names.push(name.into());
        self
    }
}

#[async_trait]
impl ToolRegistry for EchoToolRegistry {
    fn get_declarations_filtered(&self, predicate: &dyn Fn(&Tool) -> bool) -> Vec<Tool> {
        self.declarations.iter().filter(|t| predicate(t)).cloned().collect()
    }

    async fn invoke(&self, call: ToolInvocation<'_>) -> ToolResult {
        ToolResult::ok(call.id.to_string(), call.name.to_string(), call.args.clone())
    }

    fn needs_confirmation(&self, name: &str) -> bool {
        self.confirm_names.iter().any(|n| n == name)
    }
}
