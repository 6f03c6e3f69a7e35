//! LLM I/O: message types, the chat chokepoint, and output parsing.

pub mod backoff;
pub mod client;
pub mod degenerate;
pub mod parser;
pub mod types;

pub use client::{ChatBackend, ChatRequest, ChatResponse, HttpBackend, LlmClient, ScriptedBackend};
pub use parser::{parse_assistant_output, AssistantOutput, ControlFrame, ParsedToolCall};
pub use types::{normalize_messages, ChatMessage, ContentPart, MessageContent, Role};
