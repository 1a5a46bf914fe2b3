//! OpenAI wire dialects: Chat Completions and Responses, as two distinct
//! [`loopcore::formatter::ProviderFormatter`] implementations sharing one
//! crate since both speak to the same account/credential surface.

mod chat;
mod responses;

pub use chat::OpenAiChatFormatter;
pub use responses::OpenAiResponsesFormatter;
