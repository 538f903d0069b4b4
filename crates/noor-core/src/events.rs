use serde::{Deserialize, Serialize};

/// Cross-cutting signals the conversation engine raises for its presentation
/// layer.
///
/// Delivered over an explicitly injected channel rather than broadcast, so
/// the front-end decides how to surface them (auth prompt, upgrade prompt,
/// spinner).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineNotice {
    /// The service rejected the credential; the user should sign in again.
    AuthRequired,

    /// The daily quota is exhausted.
    LimitReached {
        /// Server-supplied or locally computed time until the quota resets.
        reset_time: String,
    },

    /// A request was accepted and its answer is now streaming.
    StreamStarted { conversation_id: String },

    /// The in-flight request reached a terminal state (done, error or stop).
    StreamFinished { conversation_id: String },
}

impl EngineNotice {
    /// Short machine-readable name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineNotice::AuthRequired => "auth_required",
            EngineNotice::LimitReached { .. } => "limit_reached",
            EngineNotice::StreamStarted { .. } => "stream_started",
            EngineNotice::StreamFinished { .. } => "stream_finished",
        }
    }
}
