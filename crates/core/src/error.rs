//! Error taxonomy shared by the wire-protocol layer and the engine that
//! drives it.
//!
//! Every fallible boundary in `loopcore` and its provider-formatter crates
//! returns `Result<T, EngineError>`. The engine crate maps these onto driver
//! events rather than propagating raw errors to callers.

use thiserror::Error;

/// Errors that can occur while building requests, parsing responses, or
/// running the tool loop against a provider.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Referenced channel configuration does not exist.
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    /// Referenced channel configuration exists but is disabled.
    #[error("config disabled: {0}")]
    ConfigDisabled(String),

    /// A request could not be constructed from the given history/config.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// The provider returned a non-success HTTP status.
    #[error("api error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// Transport-level failure (DNS, connection reset, TLS, ...).
    #[error("network error: {0}")]
    NetworkError(String),

    /// The request exceeded its configured deadline.
    #[error("timeout error: {0}")]
    TimeoutError(String),

    /// A response or stream chunk could not be parsed into the canonical
    /// model. Never retried: retrying a malformed response wastes a request.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The caller cancelled the in-flight operation. Terminal: never
    /// retried, always short-circuits to a `Cancelled` event.
    #[error("cancelled")]
    CancelledError,

    /// The tool loop reached its configured iteration bound without the
    /// model producing a final answer.
    #[error("max tool iterations reached ({0})")]
    MaxToolIterations(u32),

    /// `retry`/`editAndRetry`/`summarizeContext` were called on a
    /// conversation with no persisted history.
    #[error("no history")]
    NoHistory,

    /// A driver operation was requested while the driver was in a state
    /// that does not accept it (e.g. confirming tools with none pending).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `handleToolConfirmation` was called but the last message has no
    /// pending function calls.
    #[error("no function calls pending confirmation")]
    NoFunctionCalls,

    /// `deleteToIndex`/`updateMessage` referenced an id absent from the
    /// conversation.
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// A message carried a role outside `{user, model}`.
    #[error("invalid message role: {0}")]
    InvalidMessageRole(String),

    /// JSON (de)serialization failure not otherwise classified above.
    #[error("json error: {0}")]
    JsonError(String),
}

impl EngineError {
    /// Stable string code for the taxonomy entry, for logging and for
    /// mapping onto driver error events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            EngineError::ConfigDisabled(_) => "CONFIG_DISABLED",
            EngineError::ValidationError(_) => "VALIDATION_ERROR",
            EngineError::ApiError { .. } => "API_ERROR",
            EngineError::NetworkError(_) => "NETWORK_ERROR",
            EngineError::TimeoutError(_) => "TIMEOUT_ERROR",
            EngineError::ParseError(_) => "PARSE_ERROR",
            EngineError::CancelledError => "CANCELLED_ERROR",
            EngineError::MaxToolIterations(_) => "MAX_TOOL_ITERATIONS",
            EngineError::NoHistory => "NO_HISTORY",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::NoFunctionCalls => "NO_FUNCTION_CALLS",
            EngineError::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            EngineError::InvalidMessageRole(_) => "INVALID_MESSAGE_ROLE",
            EngineError::JsonError(_) => "JSON_ERROR",
        }
    }

    /// Whether `RetryPolicy` should consider retrying this error at all.
    /// Final rate-limit/backoff decisions still live in the engine crate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::NetworkError(_) | EngineError::TimeoutError(_) | EngineError::ApiError { .. }
        )
    }
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::TimeoutError(err.to_string())
        } else {
            EngineError::NetworkError(err.to_string())
        }
    }
}

impl From<http::Error> for EngineError {
    fn from(err: http::Error) -> Self {
        EngineError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::JsonError(format!("{} at line {} column {}", err, err.line(), err.column()))
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        EngineError::ValidationError(format!("invalid url: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy_names() {
        assert_eq!(EngineError::NoHistory.code(), "NO_HISTORY");
        assert_eq!(
            EngineError::ApiError { status: 429, body: String::new() }.code(),
            "API_ERROR"
        );
    }

    #[test]
    fn only_network_timeout_and_api_are_transient() {
        assert!(EngineError::NetworkError("x".into()).is_transient());
        assert!(EngineError::TimeoutError("x".into()).is_transient());
        assert!(EngineError::ApiError { status: 500, body: "x".into() }.is_transient());
        assert!(!EngineError::ParseError("x".into()).is_transient());
        assert!(!EngineError::CancelledError.is_transient());
    }
}
