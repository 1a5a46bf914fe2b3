//! Error taxonomy for the driver/engine layer, built on top of
//! [`loopcore::error::EngineError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use loopcore::error::EngineError;

/// Typed payload of a driver [`crate::events::DriverEvent::Error`] event.
///
/// `From<EngineError>` mirrors the source project's `From<AgentError> for
/// AcpError` mapping: one stable string code plus a human message, with
/// optional structured details for API-level failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverEventError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<EngineError> for DriverEventError {
    fn from(err: EngineError) -> Self {
        let details = match &err {
            EngineError::ApiError { status, body } => Some(format!("status={status} body={body}")),
            _ => None,
        };
        DriverEventError { code: err.code().to_string(), message: err.to_string(), details }
    }
}

/// Errors a [`crate::session::ConversationStore`] implementation may return.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("message not found at index {0}")]
    MessageNotFound(usize),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConversationNotFound(id) => EngineError::ConfigNotFound(id),
            StoreError::MessageNotFound(idx) => EngineError::MessageNotFound(idx.to_string()),
            StoreError::Backend(msg) => EngineError::InvalidState(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_carries_status_and_body_in_details() {
        let err = EngineError::ApiError { status: 429, body: "rate limited".into() };
        let event: DriverEventError = err.into();
        assert_eq!(event.code, "API_ERROR");
        assert!(event.details.unwrap().contains("429"));
    }

    #[test]
    fn non_api_errors_have_no_details() {
        let event: DriverEventError = EngineError::NoHistory.into();
        assert!(event.details.is_none());
    }
}
