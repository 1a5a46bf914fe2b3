//! `ContinuationCache` (§4.7): per-conversation provider-stateful handles,
//! persisted in [`crate::session::ConversationStore`] custom metadata under
//! the well-known keys from §6 (`openaiResponsesContinuation`,
//! `openaiResponsesFeatures`, `openaiResponsesPromptCacheKey`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::session::ConversationStore;

pub const CONTINUATION_KEY: &str = "openaiResponsesContinuation";
pub const FEATURES_KEY: &str = "openaiResponsesFeatures";
pub const PROMPT_CACHE_KEY_KEY: &str = "openaiResponsesPromptCacheKey";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContinuationState {
    pub config_id: String,
    pub previous_response_id: Option<String>,
    pub last_synced_history_length: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureFlags {
    pub config_id: String,
    #[serde(default)]
    pub disable_previous_response_id: bool,
    #[serde(default)]
    pub disable_prompt_cache_key: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptCacheKeyState {
    pub config_id: String,
    pub key: String,
}

/// What a formatter's `build_request` should be told for this turn: either
/// the full history, or a suffix plus the provider-side handle that covers
/// everything before it.
#[derive(Debug, Clone, Default)]
pub struct ContinuationHints {
    pub previous_response_id: Option<String>,
    pub prompt_cache_key: Option<String>,
    /// Index into the full history the formatter should start sending from.
    pub send_from_index: usize,
}

/// Loads, mutates, and persists [`ContinuationState`]/[`FeatureFlags`]/
/// [`PromptCacheKeyState`] for one conversation. One instance is constructed
/// fresh per [`crate::execution::ToolLoopDriver`] invocation via [`Self::load`].
pub struct ContinuationCache {
    continuation: Option<ContinuationState>,
    features: Option<FeatureFlags>,
    prompt_cache_key: Option<PromptCacheKeyState>,
}

impl ContinuationCache {
    pub async fn load(store: &dyn ConversationStore, conversation_id: &str) -> Result<Self, StoreError> {
        let continuation = store
            .get_custom_metadata(conversation_id, CONTINUATION_KEY)
            .await?
            .and_then(|v| serde_json::from_value(v).ok());
        let features = store
            .get_custom_metadata(conversation_id, FEATURES_KEY)
            .await?
            .and_then(|v| serde_json::from_value(v).ok());
        let prompt_cache_key = store
            .get_custom_metadata(conversation_id, PROMPT_CACHE_KEY_KEY)
            .await?
            .and_then(|v| serde_json::from_value(v).ok());
        Ok(Self { continuation, features, prompt_cache_key })
    }

    /// Computes the hints a request for `config_id` against `full_history_len`
    /// should carry, first applying the truncation-clears-continuation rule.
    pub async fn hints_for_request(
        &mut self,
        store: &dyn ConversationStore,
        conversation_id: &str,
        config_id: &str,
        full_history_len: usize,
    ) -> Result<ContinuationHints, StoreError> {
        self.clear_if_config_changed(store, conversation_id, config_id).await?;

        if let Some(state) = &self.continuation {
            if state.last_synced_history_length > full_history_len {
                self.clear_continuation(store, conversation_id).await?;
            }
        }

        let features = self.features.clone().unwrap_or_default();
        let mut hints = ContinuationHints::default();

        if let Some(state) = &self.continuation {
            if !features.disable_previous_response_id && state.last_synced_history_length > 0 && state.last_synced_history_length < full_history_len {
                hints.previous_response_id = state.previous_response_id.clone();
                hints.send_from_index = state.last_synced_history_length;
            }
        }

        if !features.disable_prompt_cache_key {
            hints.prompt_cache_key = Some(self.ensure_prompt_cache_key(store, conversation_id, config_id).await?);
        }

        Ok(hints)
    }

    /// Called after a successful completion that produced a response id.
    /// Partial (non-completed) streams must never call this (§4.7 write rules).
    pub async fn on_success(
        &mut self,
        store: &dyn ConversationStore,
        conversation_id: &str,
        config_id: &str,
        response_id: String,
        history_len_after: usize,
    ) -> Result<(), StoreError> {
        let state = ContinuationState {
            config_id: config_id.to_string(),
            previous_response_id: Some(response_id),
            last_synced_history_length: history_len_after,
        };
        store.set_custom_metadata(conversation_id, CONTINUATION_KEY, Some(serde_json::to_value(&state)?)).await?;
        self.continuation = Some(state);
        Ok(())
    }

    pub async fn clear_continuation(&mut self, store: &dyn ConversationStore, conversation_id: &str) -> Result<(), StoreError> {
        store.set_custom_metadata(conversation_id, CONTINUATION_KEY, None).await?;
        self.continuation = None;
        Ok(())
    }

    async fn clear_if_config_changed(&mut self, store: &dyn ConversationStore, conversation_id: &str, config_id: &str) -> Result<(), StoreError> {
        let changed = self.continuation.as_ref().map(|s| s.config_id != config_id).unwrap_or(false)
            || self.features.as_ref().map(|f| f.config_id != config_id).unwrap_or(false)
            || self.prompt_cache_key.as_ref().map(|k| k.config_id != config_id).unwrap_or(false);
        if changed {
            store.set_custom_metadata(conversation_id, CONTINUATION_KEY, None).await?;
            store.set_custom_metadata(conversation_id, FEATURES_KEY, None).await?;
            store.set_custom_metadata(conversation_id, PROMPT_CACHE_KEY_KEY, None).await?;
            self.continuation = None;
            self.features = None;
            self.prompt_cache_key = None;
        }
        Ok(())
    }

    async fn ensure_prompt_cache_key(&mut self, store: &dyn ConversationStore, conversation_id: &str, config_id: &str) -> Result<String, StoreError> {
        if let Some(existing) = &self.prompt_cache_key {
            if existing.config_id == config_id {
                return Ok(existing.key.clone());
            }
        }
        let state = PromptCacheKeyState { config_id: config_id.to_string(), key: Uuid::new_v4().to_string() };
        store.set_custom_metadata(conversation_id, PROMPT_CACHE_KEY_KEY, Some(serde_json::to_value(&state)?)).await?;
        let key = state.key.clone();
        self.prompt_cache_key = Some(state);
        Ok(key)
    }

    /// Disables `previous_response_id` for this conversation/config after a
    /// provider 4xx whose body mentions it, and clears any stale handle.
    pub async fn disable_previous_response_id(&mut self, store: &dyn ConversationStore, conversation_id: &str, config_id: &str) -> Result<(), StoreError> {
        let mut features = self.features.clone().unwrap_or_else(|| FeatureFlags { config_id: config_id.to_string(), ..Default::default() });
        features.disable_previous_response_id = true;
        store.set_custom_metadata(conversation_id, FEATURES_KEY, Some(serde_json::to_value(&features)?)).await?;
        self.features = Some(features);
        self.clear_continuation(store, conversation_id).await
    }

    /// Disables `prompt_cache_key` for this conversation/config after a
    /// provider 4xx whose body mentions it, and clears the stored key.
    pub async fn disable_prompt_cache_key(&mut self, store: &dyn ConversationStore, conversation_id: &str, config_id: &str) -> Result<(), StoreError> {
        let mut features = self.features.clone().unwrap_or_else(|| FeatureFlags { config_id: config_id.to_string(), ..Default::default() });
        features.disable_prompt_cache_key = true;
        store.set_custom_metadata(conversation_id, FEATURES_KEY, Some(serde_json::to_value(&features)?)).await?;
        self.features = Some(features);
        store.set_custom_metadata(conversation_id, PROMPT_CACHE_KEY_KEY, None).await?;
        self.prompt_cache_key = None;
        Ok(())
    }
}

/// Heuristic classifiers for the two 4xx-body-substring-triggered fallbacks
/// (§4.7). Exposed as free functions (not methods) so a pluggable classifier
/// can replace them per §9's locale-dependence caveat.
pub fn body_mentions_previous_response_id(body: &str) -> bool {
    body.contains("previous_response_id")
}

pub fn body_mentions_prompt_cache_key(body: &str) -> bool {
    body.contains("prompt_cache_key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryStore;

    #[tokio::test]
    async fn fresh_conversation_has_no_hints() {
        let store = InMemoryStore::new();
        let mut cache = ContinuationCache::load(&store, "c1").await.unwrap();
        let hints = cache.hints_for_request(&store, "c1", "cfg", 3).await.unwrap();
        assert!(hints.previous_response_id.is_none());
        assert!(hints.prompt_cache_key.is_some());
    }

    #[tokio::test]
    async fn on_success_then_growth_yields_suffix_and_previous_response_id() {
        let store = InMemoryStore::new();
        let mut cache = ContinuationCache::load(&store, "c1").await.unwrap();
        cache.on_success(&store, "c1", "cfg", "resp_1".into(), 2).await.unwrap();
        let hints = cache.hints_for_request(&store, "c1", "cfg", 4).await.unwrap();
        assert_eq!(hints.previous_response_id, Some("resp_1".to_string()));
        assert_eq!(hints.send_from_index, 2);
    }

    #[tokio::test]
    async fn truncated_history_clears_continuation() {
        let store = InMemoryStore::new();
        let mut cache = ContinuationCache::load(&store, "c1").await.unwrap();
        cache.on_success(&store, "c1", "cfg", "resp_1".into(), 5).await.unwrap();
        let hints = cache.hints_for_request(&store, "c1", "cfg", 2).await.unwrap();
        assert!(hints.previous_response_id.is_none());
    }

    #[tokio::test]
    async fn config_change_clears_everything() {
        let store = InMemoryStore::new();
        let mut cache = ContinuationCache::load(&store, "c1").await.unwrap();
        cache.on_success(&store, "c1", "cfg-a", "resp_1".into(), 2).await.unwrap();
        let hints = cache.hints_for_request(&store, "c1", "cfg-b", 4).await.unwrap();
        assert!(hints.previous_response_id.is_none());
    }

    #[tokio::test]
    async fn disabling_previous_response_id_clears_continuation_but_keeps_cache_key() {
        let store = InMemoryStore::new();
        let mut cache = ContinuationCache::load(&store, "c1").await.unwrap();
        cache.on_success(&store, "c1", "cfg", "resp_1".into(), 2).await.unwrap();
        cache.disable_previous_response_id(&store, "c1", "cfg").await.unwrap();
        let hints = cache.hints_for_request(&store, "c1", "cfg", 4).await.unwrap();
        assert!(hints.previous_response_id.is_none());
        assert!(hints.prompt_cache_key.is_some());
    }

    #[test]
    fn body_classifiers_match_expected_substrings() {
        assert!(body_mentions_previous_response_id("Invalid previous_response_id"));
        assert!(body_mentions_prompt_cache_key("unknown prompt_cache_key field"));
        assert!(!body_mentions_previous_response_id("totally unrelated"));
    }
}
