//! Conversation history - the ordered prompt context sent to the engine.

use std::sync::Arc;

use crate::{ChatMessage, LumenError, MessageRole, Result};

/// Append-only log of chat messages.
///
/// The first entry, when present, is always the system prompt. Entries are
/// never edited or removed; the only way to start over is [`reset`].
///
/// [`reset`]: ConversationHistory::reset
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(system_prompt: &str) -> Self {
        let mut history = Self::new();
        history.reset(system_prompt);
        history
    }

    /// Replace the whole history with a single system message.
    pub fn reset(&mut self, system_prompt: &str) {
        self.messages.clear();
        self.messages.push(ChatMessage::system(system_prompt));
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) -> Result<()> {
        match (role, self.messages.is_empty()) {
            (MessageRole::System, false) => Err(LumenError::History(
                "system message only allowed at position 0".into(),
            )),
            (MessageRole::User | MessageRole::Assistant, true) => Err(LumenError::History(
                "history must start with a system message".into(),
            )),
            _ => {
                self.messages.push(ChatMessage::new(role, content));
                Ok(())
            }
        }
    }

    /// Immutable ordered copy for submission to the engine.
    pub fn snapshot(&self) -> Arc<[ChatMessage]> {
        Arc::from(self.messages.as_slice())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }
}
