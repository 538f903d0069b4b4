//! Conversation store: the set of conversations, the active selection, and
//! the message mutators the request controller applies stream events with.
//!
//! Invariants kept by every operation:
//! - the store is never empty and `active_id` names an existing conversation;
//! - at most one conversation has no messages;
//! - messages are append-only, except the trailing assistant message while
//!   it is streaming.

use noor_core::types::{derive_title, Conversation, HistoryTurn, Message, Verse, DEFAULT_TITLE};

use crate::error::ChatError;
use crate::history::conversation_from_turn;

/// Owns every conversation of the session.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    active_id: String,
    title_max_chars: usize,
}

impl ConversationStore {
    /// A store holding a single empty, active conversation.
    pub fn new(title_max_chars: usize) -> Self {
        let conv = Conversation::new();
        Self {
            active_id: conv.id.clone(),
            conversations: vec![conv],
            title_max_chars,
        }
    }

    // -- Reads --

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// The active conversation.
    pub fn current(&self) -> &Conversation {
        // The store is never empty, and `active_id` always resolves.
        self.get(&self.active_id)
            .unwrap_or_else(|| &self.conversations[0])
    }

    pub fn current_messages(&self) -> &[Message] {
        &self.current().messages
    }

    // -- Public entry points --

    /// Switch to a fresh conversation, reusing an existing empty one if any.
    ///
    /// Returns the id of the now-active conversation.
    pub fn new_chat(&mut self) -> &str {
        if let Some(empty) = self.conversations.iter().find(|c| c.is_empty()) {
            self.active_id = empty.id.clone();
        } else {
            let conv = Conversation::new();
            self.active_id = conv.id.clone();
            self.conversations.insert(0, conv);
        }
        &self.active_id
    }

    /// Make `id` the active conversation.
    pub fn select_conversation(&mut self, id: &str) -> Result<(), ChatError> {
        if !self.contains(id) {
            return Err(ChatError::ConversationNotFound(id.to_string()));
        }
        self.active_id = id.to_string();
        Ok(())
    }

    /// Remove a conversation.
    ///
    /// Removing the active one selects the first remaining conversation;
    /// removing the last one leaves a single fresh empty conversation.
    pub fn delete_conversation(&mut self, id: &str) -> Result<(), ChatError> {
        let index = self
            .conversations
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
        self.conversations.remove(index);

        if self.conversations.is_empty() {
            let fresh = Conversation::new();
            self.active_id = fresh.id.clone();
            self.conversations.push(fresh);
        } else if self.active_id == id {
            self.active_id = self.conversations[0].id.clone();
        }
        Ok(())
    }

    // -- Controller mutators --

    /// Append a user message and its streaming assistant placeholder.
    ///
    /// The first turn of a conversation fixes its title.
    pub fn append_turn(
        &mut self,
        conversation_id: &str,
        user: Message,
        assistant: Message,
    ) -> Result<(), ChatError> {
        let title_max_chars = self.title_max_chars;
        let conv = self
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        if conv.is_empty() {
            conv.title = derive_title(&user.content, title_max_chars);
        }
        conv.messages.push(user);
        conv.messages.push(assistant);
        Ok(())
    }

    /// Attach cited sources to the streaming message. Returns whether the
    /// message was found and still streaming.
    pub fn apply_sources(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        sources: Vec<Verse>,
    ) -> bool {
        match self.streaming_message_mut(conversation_id, message_id) {
            Some(msg) => {
                msg.sources = Some(sources);
                true
            }
            None => false,
        }
    }

    /// Append a token to the streaming message.
    pub fn append_token(&mut self, conversation_id: &str, message_id: &str, token: &str) -> bool {
        match self.streaming_message_mut(conversation_id, message_id) {
            Some(msg) => {
                msg.content.push_str(token);
                true
            }
            None => false,
        }
    }

    /// Mark the streaming message complete, optionally replacing its content
    /// with an error text.
    pub fn finalize(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        error_text: Option<&str>,
    ) -> bool {
        match self.streaming_message_mut(conversation_id, message_id) {
            Some(msg) => {
                if let Some(text) = error_text {
                    msg.content = text.to_string();
                }
                msg.is_streaming = false;
                true
            }
            None => false,
        }
    }

    /// Remove an optimistic turn entirely.
    ///
    /// A conversation left empty gets its default title back and is merged
    /// with any other empty conversation.
    pub fn retract_turn(
        &mut self,
        conversation_id: &str,
        user_message_id: &str,
        assistant_message_id: &str,
    ) -> bool {
        let Some(conv) = self.get_mut(conversation_id) else {
            return false;
        };
        let before = conv.messages.len();
        conv.messages
            .retain(|m| m.id != user_message_id && m.id != assistant_message_id);
        let removed = conv.messages.len() != before;
        if conv.is_empty() {
            conv.title = DEFAULT_TITLE.to_string();
            self.collapse_empty(Some(conversation_id));
        }
        removed
    }

    // -- History --

    /// Merge server history into the store.
    ///
    /// Each unseen turn becomes its own conversation, appended in server
    /// order after the local ones. Exactly one empty conversation remains:
    /// when `remembered_active` names an empty session it keeps that id, so a
    /// restored session does not orphan it. Selection moves to
    /// `remembered_active` when it exists, otherwise stays put.
    pub fn reconcile_history(&mut self, turns: Vec<HistoryTurn>, remembered_active: Option<&str>) {
        let title_max_chars = self.title_max_chars;
        let restored: Vec<Conversation> = turns
            .into_iter()
            .filter(|t| !self.contains(&t.id))
            .map(|t| conversation_from_turn(t, title_max_chars))
            .collect();
        let restored_count = restored.len();
        self.conversations.extend(restored);

        let remembered_is_known = remembered_active.is_some_and(|id| self.contains(id));
        let keep = match remembered_active {
            Some(id) if self.get(id).is_some_and(Conversation::is_empty) => Some(id.to_string()),
            _ => self
                .conversations
                .iter()
                .find(|c| c.is_empty())
                .map(|c| c.id.clone()),
        };
        self.collapse_empty(keep.as_deref());

        if let Some(empty) = self.conversations.iter_mut().find(|c| c.is_empty()) {
            // Adopt the remembered id for an empty session it no longer matches.
            if let Some(id) = remembered_active.filter(|_| !remembered_is_known) {
                if self.active_id == empty.id {
                    self.active_id = id.to_string();
                }
                empty.id = id.to_string();
            }
        } else {
            let fresh = match remembered_active.filter(|_| !remembered_is_known) {
                Some(id) => Conversation::with_id(id),
                None => Conversation::new(),
            };
            self.conversations.insert(0, fresh);
        }

        match remembered_active {
            Some(id) if self.contains(id) => self.active_id = id.to_string(),
            _ if self.contains(&self.active_id) => {}
            _ => self.active_id = self.conversations[0].id.clone(),
        }

        tracing::info!(
            restored = restored_count,
            total = self.conversations.len(),
            active = %self.active_id,
            "History reconciled"
        );
    }

    // -- Private helpers --

    fn get_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    /// The trailing message of a conversation, if it has the given id and is
    /// still streaming.
    fn streaming_message_mut(
        &mut self,
        conversation_id: &str,
        message_id: &str,
    ) -> Option<&mut Message> {
        self.get_mut(conversation_id)?
            .messages
            .last_mut()
            .filter(|m| m.id == message_id && m.is_streaming)
    }

    /// Drop every empty conversation except `keep` (or the first empty one).
    fn collapse_empty(&mut self, keep: Option<&str>) {
        let keep = keep
            .filter(|id| self.get(id).is_some_and(Conversation::is_empty))
            .map(str::to_string)
            .or_else(|| {
                self.conversations
                    .iter()
                    .find(|c| c.is_empty())
                    .map(|c| c.id.clone())
            });
        let Some(keep) = keep else {
            return;
        };

        self.conversations.retain(|c| !c.is_empty() || c.id == keep);
        if !self.contains(&self.active_id) {
            self.active_id = keep;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
