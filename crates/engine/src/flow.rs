//! `FlowFacade` (§4.10): the host-facing entry points — `chat`, `retry`,
//! `editAndRetry`, `handleToolConfirmation`, `deleteToIndex`,
//! `summarizeContext` — plus locate-mode's carry-over bookkeeping.
//!
//! Generalizes the source project's session-level entry points the same way
//! `execution.rs` generalizes `execute_cycle_state_machine`: one facade type
//! owns preconditions, checkpoint emission, and invalidation of the
//! stateful caches (`ContinuationCache`) that a raw `ToolLoopDriver::run`
//! call must not have to reason about itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use loopcore::channel::ChannelConfig;
use loopcore::error::EngineError;
use loopcore::formatter::{ModelMessage, ProviderFormatter, RequestOptions};
use loopcore::message::{Message, Part, Role};
use loopcore::tool::{Tool, ToolMode};

use crate::config::EngineConfig;
use crate::context::estimate_history_tokens;
use crate::continuation::ContinuationCache;
use crate::events::PendingToolCall;
use crate::execution::{ChannelManager, DriveInput, DriverEventSink, IssuedResponse, RetryPolicy, ToolLoopDriver};
use crate::session::ConversationStore;
use crate::tools::{ToolInvocation, ToolRegistry, ToolResult};

const PINNED_PROMPT_KEY: &str = "pinnedPrompt";
const PINNED_SELECTIONS_KEY: &str = "pinnedSelections";
const LOCATE_CARRYOVER_KEY: &str = "locateCarryover";

/// Tools locate mode restricts the turn to; kept in sync with
/// [`crate::context::LOCATE_MODE_TOOLS`].
pub use crate::context::LOCATE_MODE_TOOLS;

/// Shared per-turn inputs every entry point threads down into
/// [`ToolLoopDriver::run`].
#[derive(Clone)]
pub struct TurnSettings {
    pub config: ChannelConfig,
    pub tools: Vec<Tool>,
    pub tool_allow_list: Option<Vec<String>>,
    pub locate_mode: bool,
    pub context_window_tokens: usize,
    pub abort: CancellationToken,
    pub engine_config: EngineConfig,
}

pub struct ChatRequest {
    pub conversation_id: String,
    pub settings: TurnSettings,
    pub user_parts: Vec<Part>,
    pub selection_references: Vec<String>,
    pub dynamic_system_prompt: Option<String>,
    pub create_checkpoint: bool,
}

pub struct RetryRequest {
    pub conversation_id: String,
    pub settings: TurnSettings,
}

pub struct EditAndRetryRequest {
    pub conversation_id: String,
    pub settings: TurnSettings,
    pub target_index: usize,
    pub new_parts: Vec<Part>,
}

pub struct ToolConfirmationRequest {
    pub conversation_id: String,
    pub settings: TurnSettings,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub confirmed_ids: HashSet<String>,
    pub annotation: Option<String>,
}

pub struct SummarizeContextRequest {
    pub conversation_id: String,
    pub config: ChannelConfig,
    pub range_start: usize,
    pub range_end: usize,
    pub abort: CancellationToken,
}

/// Coordinates [`ToolLoopDriver`] invocations per conversation: loads/writes
/// the per-conversation state a single entry point call needs beyond the
/// persisted history (pinned prompt/selections, locate-mode carry-over,
/// continuation cache invalidation), and serializes entry points for the
/// same conversation id behind a `tokio::sync::Mutex<()>` per §5.
pub struct FlowFacade {
    store: Arc<dyn ConversationStore>,
    tools: Arc<dyn ToolRegistry>,
    channels: Arc<dyn ChannelManager>,
    driver: ToolLoopDriver,
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlowFacade {
    pub fn new(store: Arc<dyn ConversationStore>, tools: Arc<dyn ToolRegistry>, channels: Arc<dyn ChannelManager>) -> Self {
        let driver = ToolLoopDriver::new(store.clone(), tools.clone(), channels.clone());
        Self { store, tools, channels, driver, locks: StdMutex::new(HashMap::new()) }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.driver = self.driver.with_retry_policy(retry);
        self
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(conversation_id.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    async fn load_pinned(&self, conversation_id: &str) -> Result<(Option<String>, Vec<String>), EngineError> {
        let prompt = self
            .store
            .get_custom_metadata(conversation_id, PINNED_PROMPT_KEY)
            .await
            .map_err(EngineError::from)?
            .and_then(|v| v.as_str().map(String::from));
        let selections = self
            .store
            .get_custom_metadata(conversation_id, PINNED_SELECTIONS_KEY)
            .await
            .map_err(EngineError::from)?
            .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
            .unwrap_or_default();
        Ok((prompt, selections))
    }

    /// `chat(req)` (§4.10): validates the config is enabled, applies any
    /// pending locate-mode carry-over to a non-locate turn, appends the user
    /// message, and runs the driver as a fresh (`isFirstMessage=true`) turn.
    pub async fn chat(&self, req: ChatRequest, sink: &dyn DriverEventSink) -> Result<(), EngineError> {
        if !req.settings.config.enabled {
            return Err(EngineError::ConfigDisabled(req.settings.config.id.clone()));
        }

        let guard = self.conversation_lock(&req.conversation_id);
        let _permit = guard.lock_owned().await;

        let mut parts = req.user_parts;
        if !req.settings.locate_mode {
            if let Some(carryover) = self
                .store
                .get_custom_metadata(&req.conversation_id, LOCATE_CARRYOVER_KEY)
                .await
                .map_err(EngineError::from)?
            {
                if let Some(note) = carryover.get("note").and_then(|v| v.as_str()) {
                    parts.insert(0, Part::text(format!("[context from a prior locate pass]\n{note}\n")));
                }
                self.store.set_custom_metadata(&req.conversation_id, LOCATE_CARRYOVER_KEY, None).await.map_err(EngineError::from)?;
            }
        }

        let mut message = Message::new(Role::User, parts);
        if !req.selection_references.is_empty() {
            message.metadata.selection_references = Some(req.selection_references);
        }
        self.store.add_content(&req.conversation_id, message).await.map_err(EngineError::from)?;

        let (pinned_prompt, pinned_selections) = self.load_pinned(&req.conversation_id).await?;

        self.run_driver(
            &req.conversation_id,
            &req.settings,
            req.dynamic_system_prompt,
            pinned_prompt,
            pinned_selections,
            true,
            req.create_checkpoint,
            sink,
        )
        .await;

        if req.settings.locate_mode {
            self.record_locate_carryover(&req.conversation_id).await?;
        }

        Ok(())
    }

    /// `retry(req)` (§4.10): recovers orphaned `FunctionCall`s at the tail of
    /// history, clears any OpenAI-Responses continuation handle, and re-runs
    /// the driver over existing history.
    pub async fn retry(&self, req: RetryRequest, sink: &dyn DriverEventSink) -> Result<(), EngineError> {
        let guard = self.conversation_lock(&req.conversation_id);
        let _permit = guard.lock_owned().await;

        let history = self.store.get_history(&req.conversation_id).await.map_err(EngineError::from)?;
        if history.is_empty() {
            return Err(EngineError::NoHistory);
        }

        if let Some(last) = history.last() {
            if last.role == Role::Model {
                let orphaned: Vec<PendingToolCall> = last
                    .function_calls()
                    .into_iter()
                    .map(|(id, name, args)| PendingToolCall { id: id.to_string(), name: name.to_string(), args: args.clone() })
                    .collect();
                if !orphaned.is_empty() {
                    let message_index = history.len();
                    let results = self.dispatch_tools(&req.conversation_id, &orphaned, message_index, &req.settings.abort).await;
                    let response_message = compose_function_response_message(&results);
                    self.store.add_content(&req.conversation_id, response_message).await.map_err(EngineError::from)?;
                }
            }
        }

        let mut continuation_cache = ContinuationCache::load(self.store.as_ref(), &req.conversation_id).await.map_err(EngineError::from)?;
        continuation_cache.clear_continuation(self.store.as_ref(), &req.conversation_id).await.map_err(EngineError::from)?;

        let (pinned_prompt, pinned_selections) = self.load_pinned(&req.conversation_id).await?;

        self.run_driver(&req.conversation_id, &req.settings, None, pinned_prompt, pinned_selections, false, false, sink).await;
        Ok(())
    }

    /// `editAndRetry(req)` (§4.10): replaces a user message's parts,
    /// truncates everything after it, clears continuation, and re-runs.
    pub async fn edit_and_retry(&self, req: EditAndRetryRequest, sink: &dyn DriverEventSink) -> Result<(), EngineError> {
        let guard = self.conversation_lock(&req.conversation_id);
        let _permit = guard.lock_owned().await;

        let target = self
            .store
            .get_message(&req.conversation_id, req.target_index)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::MessageNotFound(req.target_index.to_string()))?;
        if target.role != Role::User {
            return Err(EngineError::InvalidMessageRole(format!("index {} is not a user message", req.target_index)));
        }

        let mut edited = target;
        edited.parts = req.new_parts;
        self.store.update_message(&req.conversation_id, req.target_index, edited).await.map_err(EngineError::from)?;
        self.store.delete_to_message(&req.conversation_id, req.target_index + 1).await.map_err(EngineError::from)?;

        let mut continuation_cache = ContinuationCache::load(self.store.as_ref(), &req.conversation_id).await.map_err(EngineError::from)?;
        continuation_cache.clear_continuation(self.store.as_ref(), &req.conversation_id).await.map_err(EngineError::from)?;

        let (pinned_prompt, pinned_selections) = self.load_pinned(&req.conversation_id).await?;

        self.run_driver(&req.conversation_id, &req.settings, None, pinned_prompt, pinned_selections, false, false, sink).await;
        Ok(())
    }

    /// `handleToolConfirmation(req)` (§4.10): dispatches confirmed calls,
    /// synthesizes rejected responses for the rest, appends the composite
    /// `user`/`isFunctionResponse` message (plus an optional annotation), and
    /// continues the loop with `isFirstMessage=false`.
    pub async fn handle_tool_confirmation(&self, req: ToolConfirmationRequest, sink: &dyn DriverEventSink) -> Result<(), EngineError> {
        if req.pending_tool_calls.is_empty() {
            return Err(EngineError::NoFunctionCalls);
        }

        let guard = self.conversation_lock(&req.conversation_id);
        let _permit = guard.lock_owned().await;

        let history = self.store.get_history(&req.conversation_id).await.map_err(EngineError::from)?;
        let message_index = history.len();

        let (confirmed, rejected): (Vec<PendingToolCall>, Vec<PendingToolCall>) =
            req.pending_tool_calls.iter().cloned().partition(|c| req.confirmed_ids.contains(&c.id));

        let mut results = self.dispatch_tools(&req.conversation_id, &confirmed, message_index, &req.settings.abort).await;
        for call in rejected {
            results.push(ToolResult::rejected(call.id.clone(), call.name.clone()));
        }

        let response_message = compose_function_response_message(&results);
        self.store.add_content(&req.conversation_id, response_message).await.map_err(EngineError::from)?;

        if let Some(annotation) = req.annotation {
            self.store.add_content(&req.conversation_id, Message::user(annotation)).await.map_err(EngineError::from)?;
        }

        let (pinned_prompt, pinned_selections) = self.load_pinned(&req.conversation_id).await?;

        self.run_driver(&req.conversation_id, &req.settings, None, pinned_prompt, pinned_selections, false, false, sink).await;
        Ok(())
    }

    /// `deleteToIndex(req)` (§4.10): truncates history at `index` and clears
    /// continuation. Persisted checkpoints have no separate store entity in
    /// this design (a `Checkpoint` is a `message_index` carried on a driver
    /// event, not a row `ConversationStore` tracks), so there is nothing
    /// further to delete there.
    pub async fn delete_to_index(&self, conversation_id: &str, index: usize) -> Result<usize, EngineError> {
        let guard = self.conversation_lock(conversation_id);
        let _permit = guard.lock_owned().await;

        let removed = self.store.delete_to_message(conversation_id, index).await.map_err(EngineError::from)?;

        let mut continuation_cache = ContinuationCache::load(self.store.as_ref(), conversation_id).await.map_err(EngineError::from)?;
        continuation_cache.clear_continuation(self.store.as_ref(), conversation_id).await.map_err(EngineError::from)?;

        Ok(removed)
    }

    /// `summarizeContext(req)` (§4.10, supplement): requests a summary over
    /// `[range_start, range_end)`, writes it as a single
    /// `user/isSummary=true` message in that message's place, and re-appends
    /// whatever followed the summarized range.
    pub async fn summarize_context(&self, req: SummarizeContextRequest) -> Result<(), EngineError> {
        let guard = self.conversation_lock(&req.conversation_id);
        let _permit = guard.lock_owned().await;

        let history = self.store.get_history(&req.conversation_id).await.map_err(EngineError::from)?;
        if history.is_empty() {
            return Err(EngineError::NoHistory);
        }

        let end = req.range_end.min(history.len());
        let start = req.range_start.min(end);
        let selected = &history[start..end];
        if selected.is_empty() {
            return Err(EngineError::ValidationError("summarizeContext range is empty".into()));
        }

        let mut compaction_history: Vec<Message> = selected.iter().map(Message::without_internal_markers).collect();
        compaction_history.push(Message::user(
            "Summarize the conversation above concisely. Preserve essential facts, decisions, file paths, and any pending tasks. Respond with the summary text only.",
        ));

        let mut config = req.config.clone();
        config.prefer_stream = false;
        config.tool_mode = ToolMode::FunctionCall;

        let formatter = self.channels.formatter(config.provider);
        let original_token_estimate = estimate_history_tokens(selected);

        let message = self.call_model_once(&formatter, &config, &compaction_history, &req.abort).await?;
        let summary_text: String = message
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, thought: None | Some(false), .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if summary_text.trim().is_empty() {
            return Err(EngineError::ParseError("compaction call produced no summary text".into()));
        }

        let mut summary_message = Message::user(summary_text);
        summary_message.metadata.is_summary = Some(true);
        summary_message.metadata.task_context = Some(json!({
            "originalMessageCount": selected.len(),
            "originalTokenEstimate": original_token_estimate,
            "range": [start, end],
        }));

        self.store.delete_to_message(&req.conversation_id, start).await.map_err(EngineError::from)?;
        self.store.add_content(&req.conversation_id, summary_message).await.map_err(EngineError::from)?;
        for message in &history[end..] {
            self.store.add_content(&req.conversation_id, message.clone()).await.map_err(EngineError::from)?;
        }

        let mut continuation_cache = ContinuationCache::load(self.store.as_ref(), &req.conversation_id).await.map_err(EngineError::from)?;
        continuation_cache.clear_continuation(self.store.as_ref(), &req.conversation_id).await.map_err(EngineError::from)?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_driver(
        &self,
        conversation_id: &str,
        settings: &TurnSettings,
        dynamic_system_prompt: Option<String>,
        pinned_prompt: Option<String>,
        pinned_selections: Vec<String>,
        is_first_message: bool,
        create_before_model_checkpoint: bool,
        sink: &dyn DriverEventSink,
    ) {
        let input = DriveInput {
            conversation_id: conversation_id.to_string(),
            config: settings.config.clone(),
            tools: settings.tools.clone(),
            dynamic_system_prompt,
            tool_allow_list: settings.tool_allow_list.clone(),
            locate_mode: settings.locate_mode,
            context_window_tokens: settings.context_window_tokens,
            is_first_message,
            create_before_model_checkpoint,
            pinned_prompt,
            pinned_selections,
            abort: settings.abort.clone(),
            engine_config: &settings.engine_config,
        };
        self.driver.run(input, sink).await;
    }

    async fn dispatch_tools(&self, conversation_id: &str, calls: &[PendingToolCall], message_index: usize, abort: &CancellationToken) -> Vec<ToolResult> {
        futures::future::join_all(calls.iter().map(|call| {
            let invocation = ToolInvocation { id: &call.id, name: &call.name, args: &call.args, conversation_id, message_index, abort_signal: abort.clone() };
            self.tools.invoke(invocation)
        }))
        .await
    }

    /// Stores a short locate-mode carry-over note so the next normal turn
    /// can prepend what this locate pass found (§6 glossary: "locate mode").
    async fn record_locate_carryover(&self, conversation_id: &str) -> Result<(), EngineError> {
        let history = self.store.get_history(conversation_id).await.map_err(EngineError::from)?;
        let Some(last) = history.last() else { return Ok(()) };
        if last.role != Role::Model || !last.function_calls().is_empty() {
            return Ok(());
        }
        let note: String = last.text().chars().take(500).collect();
        if note.trim().is_empty() {
            return Ok(());
        }
        self.store
            .set_custom_metadata(conversation_id, LOCATE_CARRYOVER_KEY, Some(json!({ "note": note })))
            .await
            .map_err(EngineError::from)
    }

    /// Single-shot, non-streaming model call used by `summarizeContext`: no
    /// continuation cache, no tool declarations, bounded retry via
    /// [`RetryPolicy`]. `config.prefer_stream` is forced `false` by the
    /// caller so [`ChannelManager::issue`] always returns
    /// [`IssuedResponse::Complete`].
    async fn call_model_once(&self, formatter: &Arc<dyn ProviderFormatter>, config: &ChannelConfig, history: &[Message], abort: &CancellationToken) -> Result<ModelMessage, EngineError> {
        let options = RequestOptions { tools: None, dynamic_system_prompt: None, previous_response_id: None, prompt_cache_key: None, skip_tools: true };
        let retry = RetryPolicy::default();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = formatter.build_request(history, config, &options)?;
            match self.channels.issue(&request, abort).await {
                Ok(IssuedResponse::Complete(bytes)) => return formatter.parse_response(&bytes),
                Ok(IssuedResponse::Stream(_)) => {
                    return Err(EngineError::InvalidState("compaction call unexpectedly streamed".into()));
                }
                Err(error) if config.retry.retry_enabled && attempt <= config.retry.max_retries && retry.is_retryable(&error) => {
                    let delay = retry.delay_for(attempt, config.retry.base_interval_ms, formatter.is_gemini_like(), &error);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = abort.cancelled() => return Err(EngineError::CancelledError),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Builds the composite `user`/`isFunctionResponse` message for a batch of
/// dispatched tool results: multimodal parts first, then the
/// `FunctionResponse` parts themselves, matching
/// [`crate::execution::ToolLoopDriver::run`]'s ordering.
fn compose_function_response_message(results: &[ToolResult]) -> Message {
    let mut multimodal = Vec::new();
    let mut response_parts = Vec::new();
    for result in results {
        multimodal.extend(result.multimodal.clone());
        response_parts.push(Part::function_response(result.id.clone(), result.name.clone(), result.response.clone()));
    }
    let mut parts = multimodal;
    parts.extend(response_parts);
    let mut message = Message::new(Role::User, parts);
    message.metadata.is_function_response = Some(true);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{EchoToolRegistry, InMemoryStore};
    use async_trait::async_trait;
    use loopcore::channel::{CredentialRef, ProviderKind, RetryConfig};
    use loopcore::formatter::HttpRequest;

    fn config() -> ChannelConfig {
        ChannelConfig {
            id: "cfg".into(),
            provider: ProviderKind::OpenAiChat,
            endpoint_url: "https://api.openai.com/v1/chat/completions".into(),
            credential: CredentialRef::Named("key".into()),
            model: "gpt-4o".into(),
            system_instruction: None,
            tool_mode: ToolMode::FunctionCall,
            context_threshold: 100_000.0,
            context_threshold_is_percent: false,
            retry: RetryConfig::default(),
            custom_headers: Default::default(),
            custom_body_overlay: None,
            timeout_seconds: 60,
            prefer_stream: false,
            send_history_thoughts: false,
            send_history_thought_signatures: false,
            enabled: true,
        }
    }

    struct StubChannels {
        formatter: Arc<dyn ProviderFormatter>,
        response: Vec<u8>,
    }

    #[async_trait]
    impl ChannelManager for StubChannels {
        fn formatter(&self, _provider: ProviderKind) -> Arc<dyn ProviderFormatter> {
            self.formatter.clone()
        }

        async fn issue(&self, _request: &HttpRequest, _abort: &CancellationToken) -> Result<IssuedResponse, EngineError> {
            Ok(IssuedResponse::Complete(self.response.clone()))
        }
    }

    fn chat_response(text: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "chatcmpl_1",
            "model": "gpt-4o",
            "choices": [{"message": {"content": text, "tool_calls": null}, "finish_reason": "stop"}],
        }))
        .unwrap()
    }

    fn settings(channels: Arc<dyn ChannelManager>) -> (Arc<InMemoryStore>, FlowFacade) {
        let store = Arc::new(InMemoryStore::new());
        let tools = Arc::new(EchoToolRegistry::new(vec![]));
        let facade = FlowFacade::new(store.clone(), tools, channels);
        (store, facade)
    }

    struct NullSink;
    impl DriverEventSink for NullSink {
        fn emit(&self, _event: crate::events::DriverEvent) {}
    }

    #[tokio::test]
    async fn chat_rejects_disabled_config() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let channels = Arc::new(StubChannels { formatter, response: chat_response("hi") });
        let (_store, facade) = settings(channels);

        let mut disabled = config();
        disabled.enabled = false;

        let req = ChatRequest {
            conversation_id: "c1".into(),
            settings: TurnSettings {
                config: disabled,
                tools: vec![],
                tool_allow_list: None,
                locate_mode: false,
                context_window_tokens: 100_000,
                abort: CancellationToken::new(),
                engine_config: EngineConfig::default(),
            },
            user_parts: vec![Part::text("hi")],
            selection_references: vec![],
            dynamic_system_prompt: None,
            create_checkpoint: false,
        };
        let result = facade.chat(req, &NullSink).await;
        assert!(matches!(result, Err(EngineError::ConfigDisabled(_))));
    }

    #[tokio::test]
    async fn chat_appends_user_message_and_completes() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let channels = Arc::new(StubChannels { formatter, response: chat_response("hello there") });
        let (store, facade) = settings(channels);

        let req = ChatRequest {
            conversation_id: "c1".into(),
            settings: TurnSettings {
                config: config(),
                tools: vec![],
                tool_allow_list: None,
                locate_mode: false,
                context_window_tokens: 100_000,
                abort: CancellationToken::new(),
                engine_config: EngineConfig::default(),
            },
            user_parts: vec![Part::text("hi")],
            selection_references: vec![],
            dynamic_system_prompt: None,
            create_checkpoint: false,
        };
        facade.chat(req, &NullSink).await.unwrap();

        let history = store.get_history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].text(), "hello there");
    }

    #[tokio::test]
    async fn delete_to_index_truncates_and_clears_continuation() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let channels = Arc::new(StubChannels { formatter, response: chat_response("x") });
        let (store, facade) = settings(channels);
        store.seed("c1", vec![Message::user("a"), Message::model("b"), Message::user("c")]);

        let removed = facade.delete_to_index("c1", 1).await.unwrap();
        assert_eq!(removed, 2);
        let history = store.get_history("c1").await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn summarize_context_replaces_range_with_summary_message() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let channels = Arc::new(StubChannels { formatter, response: chat_response("concise summary") });
        let (store, facade) = settings(channels);
        store.seed("c1", vec![Message::user("a"), Message::model("b"), Message::user("keep me")]);

        let req = SummarizeContextRequest {
            conversation_id: "c1".into(),
            config: config(),
            range_start: 0,
            range_end: 2,
            abort: CancellationToken::new(),
        };
        facade.summarize_context(req).await.unwrap();

        let history = store.get_history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].metadata.is_summary, Some(true));
        assert_eq!(history[0].text(), "concise summary");
        assert_eq!(history[1].text(), "keep me");
    }

    #[tokio::test]
    async fn edit_and_retry_rejects_non_user_target() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let channels = Arc::new(StubChannels { formatter, response: chat_response("x") });
        let (store, facade) = settings(channels);
        store.seed("c1", vec![Message::user("a"), Message::model("b")]);

        let req = EditAndRetryRequest {
            conversation_id: "c1".into(),
            settings: TurnSettings {
                config: config(),
                tools: vec![],
                tool_allow_list: None,
                locate_mode: false,
                context_window_tokens: 100_000,
                abort: CancellationToken::new(),
                engine_config: EngineConfig::default(),
            },
            target_index: 1,
            new_parts: vec![Part::text("edited")],
        };
        let result = facade.edit_and_retry(req, &NullSink).await;
        assert!(matches!(result, Err(EngineError::InvalidMessageRole(_))));
    }

    #[tokio::test]
    async fn handle_tool_confirmation_rejects_when_nothing_pending() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let channels = Arc::new(StubChannels { formatter, response: chat_response("x") });
        let (_store, facade) = settings(channels);

        let req = ToolConfirmationRequest {
            conversation_id: "c1".into(),
            settings: TurnSettings {
                config: config(),
                tools: vec![],
                tool_allow_list: None,
                locate_mode: false,
                context_window_tokens: 100_000,
                abort: CancellationToken::new(),
                engine_config: EngineConfig::default(),
            },
            pending_tool_calls: vec![],
            confirmed_ids: HashSet::new(),
            annotation: None,
        };
        let result = facade.handle_tool_confirmation(req, &NullSink).await;
        assert!(matches!(result, Err(EngineError::NoFunctionCalls)));
    }
}
