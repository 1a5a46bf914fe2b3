//! Engine-wide configuration, independent of any single conversation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide tuning knobs for [`crate::execution::ToolLoopDriver`] and
/// [`crate::execution::RetryPolicy`], deserialized the way the source
/// project's large typed config structs are: `#[serde(default)]` fields
/// plus a hand-written `Default` impl, rather than requiring every field in
/// on-disk TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// `-1` (or any negative value) means unbounded.
    #[serde(default = "EngineConfig::default_max_iterations")]
    pub max_iterations: i64,
    /// Floor delay before a Gemini-dialect request on iteration ≥ 2, to
    /// avoid tripping the provider's per-second rate limiter.
    #[serde(default = "EngineConfig::default_gemini_min_interval_ms")]
    pub gemini_min_interval_ms: u64,
    #[serde(default = "EngineConfig::default_gemini_jitter_ms")]
    pub gemini_jitter_ms: u64,
    /// Rolling idle timeout for a streaming request: reset on every
    /// received byte rather than a single fixed deadline (§5).
    #[serde(default = "EngineConfig::default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
}

impl EngineConfig {
    fn default_max_iterations() -> i64 {
        25
    }
    fn default_gemini_min_interval_ms() -> u64 {
        1500
    }
    fn default_gemini_jitter_ms() -> u64 {
        500
    }
    fn default_stream_idle_timeout_ms() -> u64 {
        30_000
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_iterations < 0
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::default_max_iterations(),
            gemini_min_interval_ms: Self::default_gemini_min_interval_ms(),
            gemini_jitter_ms: Self::default_gemini_jitter_ms(),
            stream_idle_timeout_ms: Self::default_stream_idle_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_bounds_iterations() {
        let config = EngineConfig::default();
        assert!(!config.is_unbounded());
        assert_eq!(config.max_iterations, 25);
    }

    #[test]
    fn negative_max_iterations_is_unbounded() {
        let config = EngineConfig { max_iterations: -1, ..EngineConfig::default() };
        assert!(config.is_unbounded());
    }
}
