//! Mapping of server history turns onto local conversations.

use noor_core::types::{derive_title, Conversation, HistoryTurn, Message};

/// Build the conversation restored from one history turn.
///
/// The conversation takes the turn's id, a title derived from the query,
/// and exactly one user message followed by one finalized assistant message.
pub fn conversation_from_turn(turn: HistoryTurn, title_max_chars: usize) -> Conversation {
    let mut user = Message::user(turn.query.trim());
    user.created_at = turn.created_at;

    let sources = turn.sources.filter(|s| !s.is_empty());
    let mut assistant = Message::assistant_complete(turn.response, sources);
    assistant.created_at = turn.created_at;

    Conversation {
        title: derive_title(&turn.query, title_max_chars),
        id: turn.id,
        messages: vec![user, assistant],
        created_at: turn.created_at,
    }
}
