//! Error types for the conversation engine.

use noor_core::error::NoorError;

/// Errors from the conversation engine.
///
/// The first six variants are the user-visible outcome of a request; the
/// rest reject a call before anything is sent.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("daily limit reached{}", reset_suffix(.reset_time))]
    LimitReached { reset_time: Option<String> },
    #[error("generation error: {0}")]
    Generation(String),
    #[error("malformed stream event: {0}")]
    MalformedEvent(String),
    #[error("stream ended without a terminal event")]
    IncompleteStream,
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("session error: {0}")]
    Session(String),
}

fn reset_suffix(reset_time: &Option<String>) -> String {
    match reset_time {
        Some(t) => format!(" (resets in {})", t),
        None => String::new(),
    }
}

impl From<NoorError> for ChatError {
    fn from(err: NoorError) -> Self {
        ChatError::Session(err.to_string())
    }
}
