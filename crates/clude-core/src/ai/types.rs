//! Chat message types for backend communication.
//!
//! These are wire-adjacent types: the request builder maps them 1:1 onto the
//! chat-completion JSON body.

use serde::{Deserialize, Serialize};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single content part. Either text or a reference to an inline media item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Media {
        media_type: String,
        base64_data: String,
    },
}

/// Message content: plain text or a list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flattened text view. Media parts contribute nothing.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    /// Approximate character length, counting media parts by their payload.
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Media { base64_data, .. } => base64_data.len(),
                })
                .sum(),
        }
    }

    /// Append `other` onto `self`, used when collapsing same-role runs.
    /// Text+Text joins with a blank line; anything involving parts becomes
    /// a parts list with the original ordering preserved.
    fn merge(self, other: MessageContent) -> MessageContent {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => {
                if a.is_empty() {
                    Self::Text(b)
                } else if b.is_empty() {
                    Self::Text(a)
                } else {
                    Self::Text(format!("{}\n\n{}", a, b))
                }
            }
            (a, b) => {
                let mut parts = a.into_parts();
                parts.extend(b.into_parts());
                Self::Parts(parts)
            }
        }
    }

    fn into_parts(self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![ContentPart::Text { text }]
                }
            }
            Self::Parts(parts) => parts,
        }
    }
}

/// One chat turn. Immutable once appended to the message store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Minimal user turn inserted when a sequence would otherwise start with an
/// assistant message after the system prefix.
const BRIDGING_USER_TEXT: &str = "(continue)";

/// Repair a message sequence for the backend:
/// 1. collapse consecutive same-role messages by concatenation,
/// 2. insert a synthetic minimal `user` turn if the first non-system
///    message is `assistant`,
/// 3. never reorder.
///
/// Post-condition: no two adjacent non-system messages share a role, and the
/// first non-system message is `user`.
pub fn normalize_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role && message.role != Role::System => {
                let merged = std::mem::replace(&mut last.content, MessageContent::Text(String::new()))
                    .merge(message.content.clone());
                last.content = merged;
            }
            Some(last) if last.role == Role::System && message.role == Role::System => {
                // System prefix collapses too, so message 0 stays the single
                // composed system prompt.
                let merged = std::mem::replace(&mut last.content, MessageContent::Text(String::new()))
                    .merge(message.content.clone());
                last.content = merged;
            }
            _ => out.push(message.clone()),
        }
    }

    // The first non-system message must be `user`.
    if let Some(first_non_system) = out.iter().position(|m| m.role != Role::System) {
        if out[first_non_system].role == Role::Assistant {
            out.insert(first_non_system, ChatMessage::user(BRIDGING_USER_TEXT));
        }
    }

    out
}
