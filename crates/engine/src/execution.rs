//! `ToolLoopDriver` (§4.8) and `RetryPolicy` (§4.9): the per-conversation
//! state machine that drives model calls and tool dispatch to completion,
//! plus the transport seam (`ChannelManager`) it issues requests through.
//!
//! Generalizes the source project's `execute_cycle_state_machine`
//! (`ExecutionState::{BeforeLlmCall,CallLlm,AfterLlm,ProcessingToolCalls,
//! WaitingForEvent,Complete,Stopped,Cancelled}`) and its `llm_retry.rs`
//! (`call_llm_with_retry`/`calculate_rate_limit_wait`/`wait_with_cancellation`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use loopcore::channel::{ChannelConfig, ProviderKind};
use loopcore::codec::{ensure_function_call_ids, scan_for_tool_call};
use loopcore::error::EngineError;
use loopcore::formatter::{HttpRequest, ProviderFormatter, RequestOptions};
use loopcore::message::{Message, MessageMetadata, Part, Role};
use loopcore::stream::{Frame, StreamFramer};
use loopcore::tool::Tool;
use loopcore::accumulator::StreamAccumulator;

use crate::config::EngineConfig;
use crate::context::{AssemblyRequest, ContextAssembler};
use crate::continuation::{body_mentions_previous_response_id, body_mentions_prompt_cache_key, ContinuationCache};
use crate::events::{Checkpoint, DriverEvent, PendingToolCall, ToolResultEvent};
use crate::session::ConversationStore;
use crate::tools::{ToolInvocation, ToolRegistry};

/// Emission sink for one driver invocation's output sequence. A thin trait
/// over a channel so hosts can forward events into whatever transport they
/// use (SSE, websocket, an in-process `mpsc`), mirroring the source
/// project's `EventSink`/`event_bus` split between "what happened" and
/// "how it's delivered".
pub trait DriverEventSink: Send + Sync {
    fn emit(&self, event: DriverEvent);
}

/// A sink backed by an unbounded `tokio::sync::mpsc` channel.
pub struct ChannelEventSink(pub tokio::sync::mpsc::UnboundedSender<DriverEvent>);

impl DriverEventSink for ChannelEventSink {
    fn emit(&self, event: DriverEvent) {
        let _ = self.0.send(event);
    }
}

/// Either a fully-buffered response body or a byte stream, as issued by a
/// [`ChannelManager`].
pub enum IssuedResponse {
    Complete(Vec<u8>),
    Stream(futures::stream::BoxStream<'static, Result<bytes::Bytes, EngineError>>),
}

/// Transport seam between the driver and the network: resolves a
/// [`ProviderFormatter`] for a dialect and issues an [`HttpRequest`] built
/// from it. Corresponds to §6's `ChannelManager.generate`.
#[async_trait::async_trait]
pub trait ChannelManager: Send + Sync {
    fn formatter(&self, provider: ProviderKind) -> Arc<dyn ProviderFormatter>;

    async fn issue(&self, request: &HttpRequest, abort: &CancellationToken) -> Result<IssuedResponse, EngineError>;

    /// Declarations a host preview surface can show without dispatching a
    /// real request, per §6's `getToolDeclarationsForPreview`.
    fn tool_declarations_for_preview(&self, tools: &[Tool]) -> Vec<Tool> {
        tools.to_vec()
    }
}

/// `reqwest`-backed [`ChannelManager`], gated behind the `http-client`
/// feature so embedders can swap in their own transport against the same
/// trait.
#[cfg(feature = "http-client")]
pub struct HttpChannelManager {
    client: reqwest::Client,
    formatters: HashMap<ProviderKind, Arc<dyn ProviderFormatter>>,
}

#[cfg(feature = "http-client")]
impl HttpChannelManager {
    pub fn new(client: reqwest::Client, formatters: HashMap<ProviderKind, Arc<dyn ProviderFormatter>>) -> Self {
        Self { client, formatters }
    }
}

#[cfg(feature = "http-client")]
#[async_trait::async_trait]
impl ChannelManager for HttpChannelManager {
    fn formatter(&self, provider: ProviderKind) -> Arc<dyn ProviderFormatter> {
        self.formatters.get(&provider).cloned().expect("no formatter registered for provider")
    }

    async fn issue(&self, request: &HttpRequest, abort: &CancellationToken) -> Result<IssuedResponse, EngineError> {
        let mut builder = self.client.request(request.method.clone(), request.url.as_str()).body(request.body.clone());
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = tokio::select! {
            result = builder.send() => result.map_err(EngineError::from)?,
            _ = abort.cancelled() => return Err(EngineError::CancelledError),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ApiError { status: status.as_u16(), body });
        }

        if request.stream {
            let stream = response.bytes_stream().map(|chunk| chunk.map_err(EngineError::from));
            Ok(IssuedResponse::Stream(Box::pin(stream)))
        } else {
            let bytes = response.bytes().await.map_err(EngineError::from)?;
            Ok(IssuedResponse::Complete(bytes.to_vec()))
        }
    }
}

/// Error classification plus backoff computation for one retryable model
/// call (§4.9). `jitter_ms` is pluggable so tests can make delays
/// deterministic; production code leaves it at the `rand`-backed default.
pub struct RetryPolicy {
    jitter_ms: Box<dyn Fn(u64) -> u64 + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { jitter_ms: Box::new(|bound| if bound == 0 { 0 } else { rand::thread_rng().gen_range(0..bound) }) }
    }
}

const GEMINI_RATE_LIMIT_FLOOR_MS: u64 = 15_000;

impl RetryPolicy {
    pub fn with_jitter(jitter_ms: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        Self { jitter_ms: Box::new(jitter_ms) }
    }

    /// Whether `error` is even eligible for a retry attempt, independent of
    /// `retryEnabled`/attempt-count bookkeeping the driver tracks itself.
    pub fn is_retryable(&self, error: &EngineError) -> bool {
        !matches!(error, EngineError::CancelledError | EngineError::ValidationError(_) | EngineError::ParseError(_) | EngineError::ConfigNotFound(_) | EngineError::ConfigDisabled(_))
            && error.is_transient()
    }

    fn is_gemini_rate_limited(&self, error: &EngineError) -> bool {
        matches!(error, EngineError::ApiError { status, body }
            if *status == 429 || body.contains("RESOURCE_EXHAUSTED"))
    }

    /// Delay before attempt `attempt` (1-indexed), per the exponential
    /// backoff rule with a Gemini-specific rate-limit floor.
    pub fn delay_for(&self, attempt: u32, base_interval_ms: u64, is_gemini_like: bool, error: &EngineError) -> Duration {
        let exponential = base_interval_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        if is_gemini_like && self.is_gemini_rate_limited(error) {
            let jitter = (self.jitter_ms)(500);
            Duration::from_millis(GEMINI_RATE_LIMIT_FLOOR_MS.max(exponential) + jitter)
        } else {
            Duration::from_millis(exponential)
        }
    }
}

/// Inputs a single [`ToolLoopDriver::run`] invocation needs beyond the
/// conversation's persisted history.
pub struct DriveInput<'a> {
    pub conversation_id: String,
    pub config: ChannelConfig,
    pub tools: Vec<Tool>,
    pub dynamic_system_prompt: Option<String>,
    pub tool_allow_list: Option<Vec<String>>,
    pub locate_mode: bool,
    pub context_window_tokens: usize,
    pub is_first_message: bool,
    pub create_before_model_checkpoint: bool,
    /// Persisted `pinnedPrompt` custom-metadata value (§6), threaded through
    /// to `ContextAssembler` unchanged every iteration of this drive.
    pub pinned_prompt: Option<String>,
    /// Persisted `pinnedSelections` custom-metadata value (§6).
    pub pinned_selections: Vec<String>,
    pub abort: CancellationToken,
    pub engine_config: &'a EngineConfig,
}

pub struct ToolLoopDriver {
    store: Arc<dyn ConversationStore>,
    tools: Arc<dyn ToolRegistry>,
    channels: Arc<dyn ChannelManager>,
    retry: RetryPolicy,
}

impl ToolLoopDriver {
    pub fn new(store: Arc<dyn ConversationStore>, tools: Arc<dyn ToolRegistry>, channels: Arc<dyn ChannelManager>) -> Self {
        Self { store, tools, channels, retry: RetryPolicy::default() }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, input: DriveInput<'_>, sink: &dyn DriverEventSink) {
        let conversation_id = input.conversation_id.as_str();
        let mut iteration: i64 = 1;
        let mut checkpoint_before_model = input.create_before_model_checkpoint;

        loop {
            if input.abort.is_cancelled() {
                sink.emit(DriverEvent::Cancelled { conversation_id: conversation_id.to_string() });
                return;
            }

            if !input.engine_config.is_unbounded() && iteration > input.engine_config.max_iterations {
                sink.emit(DriverEvent::Error {
                    conversation_id: conversation_id.to_string(),
                    error: EngineError::MaxToolIterations(input.engine_config.max_iterations as u32).into(),
                });
                return;
            }

            let formatter = self.channels.formatter(input.config.provider);

            if iteration >= 2 && formatter.is_gemini_like() {
                let sleep_ms = input.engine_config.gemini_min_interval_ms + rand::thread_rng().gen_range(0..input.engine_config.gemini_jitter_ms.max(1));
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                    _ = input.abort.cancelled() => {
                        sink.emit(DriverEvent::Cancelled { conversation_id: conversation_id.to_string() });
                        return;
                    }
                }
            }

            let history = match self.store.get_history(conversation_id).await {
                Ok(h) => h,
                Err(e) => {
                    sink.emit(DriverEvent::Error { conversation_id: conversation_id.to_string(), error: EngineError::from(e).into() });
                    return;
                }
            };

            if checkpoint_before_model {
                sink.emit(DriverEvent::Checkpoint {
                    conversation_id: conversation_id.to_string(),
                    checkpoints: vec![Checkpoint { label: "before-model".into(), message_index: history.len() }],
                    checkpoint_only: true,
                });
            }
            checkpoint_before_model = true;

            let assembly_request = AssemblyRequest {
                context_window_tokens: input.context_window_tokens,
                pinned_prompt: input.pinned_prompt.clone(),
                pinned_selections: input.pinned_selections.clone(),
                dynamic_system_prompt: if iteration == 1 && input.is_first_message { input.dynamic_system_prompt.clone() } else { None },
                tool_allow_list: input.tool_allow_list.clone(),
                locate_mode: input.locate_mode,
            };
            let assembled = ContextAssembler::assemble(&history, &input.config, &input.tools, &assembly_request);

            let mut continuation_cache = match ContinuationCache::load(self.store.as_ref(), conversation_id).await {
                Ok(c) => c,
                Err(e) => {
                    sink.emit(DriverEvent::Error { conversation_id: conversation_id.to_string(), error: EngineError::from(e).into() });
                    return;
                }
            };

            let outcome = self
                .run_model_call(&formatter, &input, &assembled.history, &assembled.tools, &assembled.system_instruction, &mut continuation_cache, sink, conversation_id)
                .await;

            let model_message = match outcome {
                ModelCallOutcome::Success(message) => message,
                ModelCallOutcome::Cancelled(partial) => {
                    if let Some(partial) = partial {
                        if !partial.parts.is_empty() {
                            let mut cancelled_message = Message::new(Role::Model, partial.parts);
                            cancelled_message.metadata = MessageMetadata {
                                usage: partial.usage,
                                finish_reason: Some("cancelled".to_string()),
                                model_version: partial.model_version,
                                ..Default::default()
                            };
                            let _ = self.store.add_content(conversation_id, cancelled_message).await;
                        }
                    }
                    sink.emit(DriverEvent::Cancelled { conversation_id: conversation_id.to_string() });
                    return;
                }
                ModelCallOutcome::Failed(error) => {
                    sink.emit(DriverEvent::Error { conversation_id: conversation_id.to_string(), error: error.into() });
                    return;
                }
            };

            let mut parts = model_message.parts;
            ensure_function_call_ids(&mut parts);

            let mut response_message = Message::new(Role::Model, parts);
            response_message.metadata = MessageMetadata {
                usage: model_message.usage,
                finish_reason: model_message.finish_reason.clone(),
                model_version: model_message.model_version,
                context_snapshot: Some(assembled.snapshot.preview.clone()),
                ..Default::default()
            };

            if let Err(e) = self.store.add_content(conversation_id, response_message.clone()).await {
                sink.emit(DriverEvent::Error { conversation_id: conversation_id.to_string(), error: EngineError::from(e).into() });
                return;
            }

            let suppress_continuation_write = model_message.finish_reason.as_deref() == Some("stream_closed");
            if !suppress_continuation_write {
                if let Some(response_id) = model_message.response_id {
                    let history_len_after = self.store.get_history(conversation_id).await.map(|h| h.len()).unwrap_or(0);
                    let _ = continuation_cache.on_success(self.store.as_ref(), conversation_id, &input.config.id, response_id, history_len_after).await;
                }
            }

            let pending_calls = response_message.function_calls().into_iter().map(|(id, name, args)| PendingToolCall { id: id.to_string(), name: name.to_string(), args: args.clone() }).collect::<Vec<_>>();

            if pending_calls.is_empty() {
                sink.emit(DriverEvent::Complete {
                    conversation_id: conversation_id.to_string(),
                    content: response_message,
                    checkpoints: vec![Checkpoint { label: "complete".into(), message_index: self.store.get_history(conversation_id).await.map(|h| h.len()).unwrap_or(0) }],
                });
                return;
            }

            let needs_confirmation = pending_calls.iter().any(|c| self.tools.needs_confirmation(&c.name));
            if needs_confirmation {
                sink.emit(DriverEvent::AwaitingConfirmation { conversation_id: conversation_id.to_string(), content: response_message, pending_tool_calls: pending_calls });
                return;
            }

            sink.emit(DriverEvent::ToolsExecuting { conversation_id: conversation_id.to_string(), content: response_message.clone(), pending_tool_calls: pending_calls.clone() });

            let message_index = self.store.get_history(conversation_id).await.map(|h| h.len()).unwrap_or(0);
            let dispatched = futures::future::join_all(pending_calls.iter().map(|call| {
                let invocation = ToolInvocation { id: &call.id, name: &call.name, args: &call.args, conversation_id, message_index, abort_signal: input.abort.clone() };
                self.tools.invoke(invocation)
            }))
            .await;

            let mut multimodal = Vec::new();
            let mut response_parts = Vec::new();
            let mut tool_results = Vec::new();
            let mut any_cancelled = false;

            for result in &dispatched {
                response_parts.push(Part::function_response(result.id.clone(), result.name.clone(), result.response.clone()));
                multimodal.extend(result.multimodal.clone());
                any_cancelled |= result.cancelled;
                tool_results.push(ToolResultEvent { id: result.id.clone(), name: result.name.clone(), response: result.response.clone(), cancelled: result.cancelled, rejected: result.rejected });
            }

            let mut combined_parts = multimodal;
            combined_parts.extend(response_parts);
            let mut function_response_message = Message::new(Role::User, combined_parts);
            function_response_message.metadata.is_function_response = Some(true);

            if let Err(e) = self.store.add_content(conversation_id, function_response_message.clone()).await {
                sink.emit(DriverEvent::Error { conversation_id: conversation_id.to_string(), error: EngineError::from(e).into() });
                return;
            }

            sink.emit(DriverEvent::ToolIteration { conversation_id: conversation_id.to_string(), content: function_response_message, tool_results, checkpoints: vec![] });

            if any_cancelled {
                return;
            }

            iteration += 1;
        }
    }

    async fn run_model_call(
        &self,
        formatter: &Arc<dyn ProviderFormatter>,
        input: &DriveInput<'_>,
        history: &[Message],
        tools: &[Tool],
        system_instruction: &str,
        continuation_cache: &mut ContinuationCache,
        sink: &dyn DriverEventSink,
        conversation_id: &str,
    ) -> ModelCallOutcome {
        let mut config = input.config.clone();
        config.system_instruction = Some(system_instruction.to_string());

        let mut attempt = 0u32;
        let mut fallback_count = 0u32;
        let mut skip_previous_response_id = false;
        let mut skip_prompt_cache_key = false;

        loop {
            attempt += 1;

            let hints = match continuation_cache.hints_for_request(self.store.as_ref(), conversation_id, &input.config.id, history.len()).await {
                Ok(h) => h,
                Err(e) => return ModelCallOutcome::Failed(EngineError::from(e)),
            };

            let previous_response_id = if skip_previous_response_id { None } else { hints.previous_response_id.clone() };
            let prompt_cache_key = if skip_prompt_cache_key { None } else { hints.prompt_cache_key.clone() };
            let send_from = if previous_response_id.is_some() { hints.send_from_index } else { 0 };

            let options = RequestOptions {
                tools: Some(tools),
                dynamic_system_prompt: None,
                previous_response_id: previous_response_id.as_deref(),
                prompt_cache_key: prompt_cache_key.as_deref(),
                skip_tools: false,
            };

            let request = match formatter.build_request(&history[send_from..], &config, &options) {
                Ok(r) => r,
                Err(e) => return ModelCallOutcome::Failed(e),
            };

            match self.consume_request(formatter, &request, input, sink, conversation_id).await {
                Ok(message) => return ModelCallOutcome::Success(message),
                Err(ModelCallError::Cancelled(partial)) => return ModelCallOutcome::Cancelled(partial),
                Err(ModelCallError::Fatal(error)) => return ModelCallOutcome::Failed(error),
                Err(ModelCallError::Retryable(error)) => {
                    if let EngineError::ApiError { status, body } = &error {
                        if fallback_count < 2 && (400..500).contains(status) {
                            if !skip_previous_response_id && body_mentions_previous_response_id(body) {
                                skip_previous_response_id = true;
                                let _ = continuation_cache.disable_previous_response_id(self.store.as_ref(), conversation_id, &input.config.id).await;
                                fallback_count += 1;
                                continue;
                            }
                            if !skip_prompt_cache_key && body_mentions_prompt_cache_key(body) {
                                skip_prompt_cache_key = true;
                                let _ = continuation_cache.disable_prompt_cache_key(self.store.as_ref(), conversation_id, &input.config.id).await;
                                fallback_count += 1;
                                continue;
                            }
                        }
                    }

                    if !input.config.retry.retry_enabled || attempt > input.config.retry.max_retries || !self.retry.is_retryable(&error) {
                        return ModelCallOutcome::Failed(error);
                    }

                    let delay = self.retry.delay_for(attempt, input.config.retry.base_interval_ms, formatter.is_gemini_like(), &error);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = input.abort.cancelled() => return ModelCallOutcome::Cancelled(None),
                    }
                }
            }
        }
    }

    async fn consume_request(
        &self,
        formatter: &Arc<dyn ProviderFormatter>,
        request: &HttpRequest,
        input: &DriveInput<'_>,
        sink: &dyn DriverEventSink,
        conversation_id: &str,
    ) -> Result<loopcore::formatter::ModelMessage, ModelCallError> {
        let issued = match self.channels.issue(request, &input.abort).await {
            Ok(issued) => issued,
            Err(e) => return Err(classify(e, None)),
        };

        match issued {
            IssuedResponse::Complete(bytes) => formatter.parse_response(&bytes).map_err(|e| ModelCallError::Fatal(e)),
            IssuedResponse::Stream(mut stream) => {
                let mut framer = StreamFramer::new();
                let mut scratch = HashMap::new();
                let mut accumulator = StreamAccumulator::new(input.config.tool_mode);
                let idle_timeout = input.engine_config.stream_idle_timeout();
                let mut received_any = false;

                loop {
                    let next = tokio::select! {
                        item = tokio::time::timeout(idle_timeout, stream.next()) => item,
                        _ = input.abort.cancelled() => {
                            return Err(ModelCallError::Cancelled(Some(accumulator.into_message())));
                        }
                    };

                    let item = match next {
                        Ok(Some(Ok(bytes))) => bytes,
                        Ok(Some(Err(e))) => return Err(classify(e, Some(accumulator.into_message()))),
                        Ok(None) => break,
                        Err(_) => return Err(ModelCallError::Fatal(EngineError::TimeoutError("stream idle timeout".into()))),
                    };

                    received_any = true;
                    for frame in framer.feed(&item) {
                        self.apply_frame(frame, formatter, &mut scratch, &mut accumulator, sink, conversation_id);
                    }
                    if accumulator.is_done() {
                        break;
                    }
                }

                match framer.finish() {
                    Ok(frames) => {
                        for frame in frames {
                            self.apply_frame(frame, formatter, &mut scratch, &mut accumulator, sink, conversation_id);
                        }
                    }
                    Err(e) => return Err(ModelCallError::Fatal(e)),
                }

                if !accumulator.is_done() {
                    if formatter.infers_done_on_close() && received_any {
                        let mut message = accumulator.into_message();
                        message.finish_reason = Some("stream_closed".to_string());
                        return Ok(message);
                    }
                    return Err(ModelCallError::Retryable(EngineError::NetworkError("stream ended unexpectedly".into())));
                }

                Ok(accumulator.into_message())
            }
        }
    }

    fn apply_frame(
        &self,
        frame: Frame,
        formatter: &Arc<dyn ProviderFormatter>,
        scratch: &mut HashMap<String, serde_json::Value>,
        accumulator: &mut StreamAccumulator,
        sink: &dyn DriverEventSink,
        conversation_id: &str,
    ) {
        match frame {
            Frame::StreamEnd => {}
            Frame::Value(value) => {
                let delta = match formatter.parse_stream_chunk(&value, scratch) {
                    Ok(d) => d,
                    Err(_) => return,
                };
                accumulator.push(delta.clone());
                sink.emit(DriverEvent::Chunk { conversation_id: conversation_id.to_string(), chunk: delta });
            }
        }
    }
}

enum ModelCallOutcome {
    Success(loopcore::formatter::ModelMessage),
    Cancelled(Option<loopcore::formatter::ModelMessage>),
    Failed(EngineError),
}

enum ModelCallError {
    Retryable(EngineError),
    Fatal(EngineError),
    Cancelled(Option<loopcore::formatter::ModelMessage>),
}

fn classify(error: EngineError, partial: Option<loopcore::formatter::ModelMessage>) -> ModelCallError {
    if matches!(error, EngineError::CancelledError) {
        ModelCallError::Cancelled(partial)
    } else if error.is_transient() {
        ModelCallError::Retryable(error)
    } else {
        ModelCallError::Fatal(error)
    }
}

/// Scans an already-accumulated text part for an inline xml/json tool call,
/// used by callers that need offline (non-streaming) extraction over a
/// persisted message rather than the accumulator's live path.
pub fn extract_inline_tool_call(text: &str, mode: loopcore::tool::ToolMode) -> Option<Part> {
    scan_for_tool_call(text, mode).map(|scanned| scanned.call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_utils::{EchoToolRegistry, InMemoryStore};
    use futures::stream;
    use loopcore::channel::{ChannelConfig, CredentialRef, ProviderKind, RetryConfig};

    fn config() -> ChannelConfig {
        ChannelConfig {
            id: "cfg".into(),
            provider: ProviderKind::OpenAiChat,
            endpoint_url: "https://api.openai.com/v1/chat/completions".into(),
            credential: CredentialRef::Named("key".into()),
            model: "gpt-4o".into(),
            system_instruction: None,
            tool_mode: loopcore::tool::ToolMode::FunctionCall,
            context_threshold: 100_000.0,
            context_threshold_is_percent: false,
            retry: RetryConfig::default(),
            custom_headers: Default::default(),
            custom_body_overlay: None,
            timeout_seconds: 60,
            prefer_stream: true,
            send_history_thoughts: false,
            send_history_thought_signatures: false,
            enabled: true,
        }
    }

    /// Yields one SSE chunk with partial text, then hangs forever: used to
    /// exercise mid-stream cancellation without racing a real network call.
    struct HangingStreamChannels {
        formatter: Arc<dyn ProviderFormatter>,
    }

    #[async_trait::async_trait]
    impl ChannelManager for HangingStreamChannels {
        fn formatter(&self, _provider: ProviderKind) -> Arc<dyn ProviderFormatter> {
            self.formatter.clone()
        }

        async fn issue(&self, _request: &HttpRequest, _abort: &CancellationToken) -> Result<IssuedResponse, EngineError> {
            let first = bytes::Bytes::from(
                "data: {\"id\":\"chatcmpl_1\",\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
            );
            let body = stream::unfold(0u8, move |state| {
                let first = first.clone();
                async move {
                    if state == 0 {
                        let item: Result<bytes::Bytes, EngineError> = Ok(first);
                        Some((item, 1))
                    } else {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        None
                    }
                }
            });
            Ok(IssuedResponse::Stream(Box::pin(body)))
        }
    }

    struct NullSink;
    impl DriverEventSink for NullSink {
        fn emit(&self, _event: crate::events::DriverEvent) {}
    }

    #[tokio::test]
    async fn cancellation_mid_stream_persists_partial_model_message() {
        let formatter: Arc<dyn ProviderFormatter> = Arc::new(loopengine_provider_openai::OpenAiChatFormatter);
        let store = Arc::new(InMemoryStore::new());
        let tools = Arc::new(EchoToolRegistry::new(vec![]));
        let channels = Arc::new(HangingStreamChannels { formatter });
        let driver = ToolLoopDriver::new(store.clone(), tools, channels);

        store.seed("c1", vec![Message::user("hi")]);
        let abort = CancellationToken::new();
        let abort_clone = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort_clone.cancel();
        });

        let input = DriveInput {
            conversation_id: "c1".into(),
            config: config(),
            tools: vec![],
            dynamic_system_prompt: None,
            tool_allow_list: None,
            locate_mode: false,
            context_window_tokens: 100_000,
            is_first_message: true,
            create_before_model_checkpoint: false,
            pinned_prompt: None,
            pinned_selections: vec![],
            abort,
            engine_config: &EngineConfig::default(),
        };
        driver.run(input, &NullSink).await;

        let history = store.get_history("c1").await.unwrap();
        assert_eq!(history.len(), 2, "partial model message should be persisted on cancellation");
        let persisted = &history[1];
        assert_eq!(persisted.role, Role::Model);
        assert_eq!(persisted.text(), "partial");
        assert_eq!(persisted.metadata.finish_reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn retry_policy_never_retries_validation_or_parse_errors() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(&EngineError::ValidationError("bad".into())));
        assert!(!policy.is_retryable(&EngineError::ParseError("bad".into())));
        assert!(!policy.is_retryable(&EngineError::CancelledError));
    }

    #[test]
    fn retry_policy_retries_transient_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&EngineError::NetworkError("x".into())));
        assert!(policy.is_retryable(&EngineError::ApiError { status: 500, body: String::new() }));
    }

    #[test]
    fn gemini_rate_limit_floors_delay_at_fifteen_seconds() {
        let policy = RetryPolicy::with_jitter(|_| 0);
        let error = EngineError::ApiError { status: 429, body: String::new() };
        let delay = policy.delay_for(1, 1000, true, &error);
        assert_eq!(delay, Duration::from_millis(GEMINI_RATE_LIMIT_FLOOR_MS));
    }

    #[test]
    fn non_gemini_errors_use_plain_exponential_backoff() {
        let policy = RetryPolicy::with_jitter(|_| 0);
        let error = EngineError::NetworkError("x".into());
        let delay = policy.delay_for(3, 1000, false, &error);
        assert_eq!(delay, Duration::from_millis(4000));
    }
}
