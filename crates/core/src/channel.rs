//! Per-conversation channel configuration: which provider, which model,
//! which credentials, and the knobs `ContextTrimmer`/`RetryPolicy` read.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::tool::ToolMode;

/// Indirection over a raw API key so a [`ChannelConfig`] is safe to log and
/// serialize. The resolver that turns this into an actual secret (env var
/// lookup, injected vault value, ...) lives in the engine crate; `loopcore`
/// only needs to know a key reference exists, never the key itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRef {
    /// Look up an environment variable by name at request time.
    EnvVar(String),
    /// Opaque reference into whatever secret store the host wires up.
    Named(String),
}

impl CredentialRef {
    /// Resolves the credential to its actual secret value. `EnvVar` reads
    /// the named environment variable at request time; `Named` is treated
    /// as already holding the resolved value, since the secret store that
    /// would otherwise back it is a host concern outside this crate's scope.
    pub fn resolve(&self) -> Result<String, crate::error::EngineError> {
        match self {
            CredentialRef::EnvVar(name) => std::env::var(name)
                .map_err(|_| crate::error::EngineError::ConfigNotFound(format!("env var {name} not set"))),
            CredentialRef::Named(value) => Ok(value.clone()),
        }
    }
}

/// Backoff/retry knobs consumed by `RetryPolicy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_base_interval_ms")]
    pub base_interval_ms: u64,
    #[serde(default)]
    pub retry_enabled: bool,
}

impl RetryConfig {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_base_interval_ms() -> u64 {
        1000
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            base_interval_ms: Self::default_base_interval_ms(),
            retry_enabled: true,
        }
    }
}

/// The wire dialect a [`ChannelConfig`] targets. Drives which
/// `ProviderFormatter` implementation `ContextAssembler`/`ToolLoopDriver`
/// select for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    OpenAiChat,
    OpenAiResponses,
    Anthropic,
}

/// A named, persisted provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub id: String,
    pub provider: ProviderKind,
    pub endpoint_url: String,
    pub credential: CredentialRef,
    pub model: String,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub tool_mode: ToolMode,
    /// Absolute token count, or a percentage (0.0-1.0) of the model's
    /// context window, depending on `context_threshold_is_percent`.
    #[serde(default = "ChannelConfig::default_context_threshold")]
    pub context_threshold: f64,
    #[serde(default)]
    pub context_threshold_is_percent: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default)]
    pub custom_body_overlay: Option<JsonValue>,
    #[serde(default = "ChannelConfig::default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "ChannelConfig::default_true")]
    pub prefer_stream: bool,
    #[serde(default)]
    pub send_history_thoughts: bool,
    #[serde(default)]
    pub send_history_thought_signatures: bool,
    #[serde(default)]
    pub enabled: bool,
}

impl ChannelConfig {
    fn default_context_threshold() -> f64 {
        32_000.0
    }
    fn default_timeout_seconds() -> u64 {
        120
    }
    fn default_true() -> bool {
        true
    }
}

impl Default for ToolMode {
    fn default() -> Self {
        ToolMode::FunctionCall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_defaults_are_conservative() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.retry_enabled);
    }

    #[test]
    fn channel_config_deserializes_with_sparse_json() {
        let raw = serde_json::json!({
            "id": "default",
            "provider": "anthropic",
            "endpointUrl": "https://api.anthropic.com/v1/messages",
            "credential": {"env_var": "ANTHROPIC_API_KEY"},
            "model": "claude-opus",
        });
        let config: ChannelConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.timeout_seconds, 120);
        assert!(config.prefer_stream);
        assert!(!config.enabled);
    }
}
