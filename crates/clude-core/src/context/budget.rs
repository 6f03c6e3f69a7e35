//! Token accounting and priority-based history trimming.
//!
//! Messages carry an implicit priority; when the estimated prompt exceeds
//! the utilization threshold, the tail is dropped from the lowest priority
//! upward. The role-alternation invariant is re-established after every
//! trim.

use crate::ai::types::{normalize_messages, ChatMessage, Role};

/// Characters per token for the estimate. Coarse but stable.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message overhead (role tags, separators) in tokens.
const PER_MESSAGE_OVERHEAD: usize = 4;

/// How many trailing non-system messages count as RECENT (~5 turns).
const RECENT_WINDOW: usize = 10;

/// How many trailing messages belong to the current step (WORKING).
const WORKING_WINDOW: usize = 2;

/// Trim priority, highest retention first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessagePriority {
    Protected,
    Working,
    Recent,
    Relevant,
    Archival,
}

/// Estimate prompt tokens for a message sequence.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.content.char_len() / CHARS_PER_TOKEN + PER_MESSAGE_OVERHEAD)
        .sum()
}

#[derive(Debug, Clone)]
pub struct ContextBudgeter {
    pub max_context_tokens: usize,
    pub reserved_output_tokens: usize,
    pub utilization_threshold: f32,
    pub max_history_messages: usize,
}

impl ContextBudgeter {
    pub fn new(
        max_context_tokens: usize,
        reserved_output_tokens: usize,
        utilization_threshold: f32,
        max_history_messages: usize,
    ) -> Self {
        Self {
            max_context_tokens,
            reserved_output_tokens,
            utilization_threshold,
            max_history_messages,
        }
    }

    /// Tokens available to the prompt itself.
    pub fn prompt_budget(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_output_tokens)
    }

    /// Trim threshold in tokens.
    fn threshold(&self) -> usize {
        (self.max_context_tokens as f32 * self.utilization_threshold) as usize
    }

    pub fn needs_trim(&self, messages: &[ChatMessage]) -> bool {
        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        estimate_tokens(messages) > self.threshold() || non_system > self.max_history_messages
    }

    /// Classify one message by position and salience.
    fn priority(
        &self,
        index: usize,
        total: usize,
        message: &ChatMessage,
        salient: &[String],
    ) -> MessagePriority {
        if message.role == Role::System {
            return MessagePriority::Protected;
        }
        if index + WORKING_WINDOW >= total {
            return MessagePriority::Working;
        }
        if index + RECENT_WINDOW >= total {
            return MessagePriority::Recent;
        }
        let text = message.text();
        if !salient.is_empty()
            && salient
                .iter()
                .any(|token| !token.is_empty() && text.contains(token.as_str()))
        {
            return MessagePriority::Relevant;
        }
        MessagePriority::Archival
    }

    /// Drop messages from the lowest priority upward until the sequence fits
    /// both the token threshold and the history-length fuse, then repair
    /// role alternation. Never reorders survivors.
    pub fn trim(&self, messages: &[ChatMessage], salient: &[String]) -> Vec<ChatMessage> {
        let total = messages.len();
        let mut keep: Vec<(MessagePriority, &ChatMessage)> = messages
            .iter()
            .enumerate()
            .map(|(i, m)| (self.priority(i, total, m, salient), m))
            .collect();

        for level in [
            MessagePriority::Archival,
            MessagePriority::Relevant,
            MessagePriority::Recent,
        ] {
            if self.fits(&keep) {
                break;
            }
            // Drop oldest-first within the level until the sequence fits.
            loop {
                let Some(pos) = keep.iter().position(|(p, _)| *p == level) else {
                    break;
                };
                keep.remove(pos);
                if self.fits(&keep) {
                    break;
                }
            }
        }

        let survivors: Vec<ChatMessage> = keep.into_iter().map(|(_, m)| m.clone()).collect();
        // Trimming can leave system followed by assistant, or two same-role
        // neighbors; normalization repairs both.
        normalize_messages(&survivors)
    }

    fn fits(&self, keep: &[(MessagePriority, &ChatMessage)]) -> bool {
        let non_system = keep
            .iter()
            .filter(|(_, m)| m.role != Role::System)
            .count();
        if non_system > self.max_history_messages {
            return false;
        }
        let tokens: usize = keep
            .iter()
            .map(|(_, m)| m.content.char_len() / CHARS_PER_TOKEN + PER_MESSAGE_OVERHEAD)
            .sum();
        tokens <= self.threshold()
    }
}
