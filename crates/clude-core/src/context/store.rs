//! Ordered message store for one session.
//!
//! Message 0 is always the composed system prompt; everything after it is
//! append-only for the lifetime of the session. Trimming replaces the tail
//! wholesale (see `budget`), never reorders.

use crate::ai::types::{ChatMessage, MessageContent, Role};

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the composed system prompt at index 0.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let message = ChatMessage::system(prompt.into());
        match self.messages.first() {
            Some(first) if first.role == Role::System => self.messages[0] = message,
            _ => self.messages.insert(0, message),
        }
    }

    pub fn system_prompt(&self) -> Option<&ChatMessage> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.append(ChatMessage::user(text.into()));
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.append(ChatMessage::assistant(text.into()));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replace everything after the system prompt. Used by the budgeter.
    pub fn replace_tail(&mut self, tail: Vec<ChatMessage>) {
        let system = self
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();
        self.messages.clear();
        if let Some(system) = system {
            self.messages.push(system);
        }
        self.messages.extend(tail);
    }

    /// Non-system tail, oldest first.
    pub fn tail(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect()
    }

    /// Total characters across all message contents.
    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.char_len()).sum()
    }

    /// Last assistant text, if any. Used for final-answer extraction.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
    }
}

impl MessageStore {
    /// Build from an existing transcript (resume path).
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn content_of(&self, index: usize) -> Option<&MessageContent> {
        self.messages.get(index).map(|m| &m.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_stays_at_index_zero() {
        let mut store = MessageStore::new();
        store.append_user("hello");
        store.set_system_prompt("you are an agent");
        assert_eq!(store.messages()[0].role, Role::System);
        assert_eq!(store.messages()[1].text(), "hello");

        store.set_system_prompt("refreshed");
        assert_eq!(store.len(), 2);
        assert_eq!(store.messages()[0].text(), "refreshed");
    }

    #[test]
    fn replace_tail_preserves_system() {
        let mut store = MessageStore::new();
        store.set_system_prompt("sys");
        store.append_user("a");
        store.append_assistant("b");

        store.replace_tail(vec![ChatMessage::user("only")]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.messages()[0].text(), "sys");
        assert_eq!(store.messages()[1].text(), "only");
    }

    #[test]
    fn last_assistant_text_finds_most_recent() {
        let mut store = MessageStore::new();
        store.append_assistant("first");
        store.append_user("q");
        store.append_assistant("second");
        assert_eq!(store.last_assistant_text().unwrap(), "second");
    }
}
