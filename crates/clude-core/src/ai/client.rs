//! The single chokepoint for model calls.
//!
//! `LlmClient::chat` owns the whole request path: message normalization,
//! context trimming, request/response events, the wall-clock timeout, the
//! transport retry policy, and the degenerate-output kill switch. Nothing
//! else in the crate talks to the backend.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::events::{EventKind, TurnEmitter};
use crate::audit::payload_digest;
use crate::config::CoreConfig;
use crate::context::{estimate_tokens, ContextBudgeter, MessageStore};
use crate::error::LlmError;
use crate::redact::redact;

use super::backoff::{with_retry, RetryConfig};
use super::degenerate;
use super::types::{normalize_messages, ChatMessage, MessageContent, Role};

/// Request against the chat-completion contract.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// The backend contract: one chat-completion endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

// ── HTTP backend ───────────────────────────────────────────────────────

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                match &m.content {
                    MessageContent::Text(text) => json!({"role": role, "content": text}),
                    MessageContent::Parts(parts) => json!({"role": role, "content": parts}),
                }
            })
            .collect();

        let body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let mut http = self.client.post(&self.base_url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LlmError::Transport(format!("server error {}", status)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                message: redact(&message),
            });
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("malformed response body: {}", e)))?;

        // Contract shape first; tolerate the common chat-completions shape.
        let text = value
            .get("text")
            .and_then(|t| t.as_str())
            .or_else(|| {
                value
                    .pointer("/choices/0/message/content")
                    .and_then(|t| t.as_str())
            })
            .unwrap_or_default()
            .to_string();

        let usage = value.get("usage").map(|u| TokenUsage {
            prompt_tokens: u
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize,
        });

        Ok(ChatResponse { text, usage })
    }
}

// ── Scripted backend (tests, dry runs) ─────────────────────────────────

/// Returns a queued sequence of responses and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.responses.lock().push_back(Ok(text.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().push(request.clone());
        match self.responses.lock().pop_front() {
            Some(Ok(text)) => Ok(ChatResponse { text, usage: None }),
            Some(Err(error)) => Err(error),
            None => Ok(ChatResponse {
                text: String::new(),
                usage: None,
            }),
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────────

pub struct LlmClient {
    backend: Arc<dyn ChatBackend>,
    config: CoreConfig,
    budgeter: ContextBudgeter,
    retry: RetryConfig,
}

impl LlmClient {
    pub fn new(backend: Arc<dyn ChatBackend>, config: CoreConfig) -> Self {
        let budgeter = ContextBudgeter::new(
            config.max_context_tokens,
            config.reserved_output_tokens,
            config.utilization_threshold,
            config.bounds.max_history_messages,
        );
        let retry = RetryConfig {
            max_retries: config.bounds.max_llm_retries_on_transport,
            ..Default::default()
        };
        Self {
            backend,
            config,
            budgeter,
            retry,
        }
    }

    /// From the standard HTTP backend described by the config.
    pub fn from_config(config: CoreConfig) -> Self {
        let backend = Arc::new(HttpBackend::new(
            config.llm_base_url.clone(),
            config.api_key.clone(),
        ));
        Self::new(backend, config)
    }

    /// Current context utilization for the store, for fidelity selection.
    pub fn utilization(&self, store: &MessageStore) -> f32 {
        estimate_tokens(store.messages()) as f32 / self.config.max_context_tokens as f32
    }

    /// One model call over the session transcript. Normalizes, trims,
    /// emits events, enforces bounds, and screens the output.
    pub async fn chat(
        &self,
        store: &mut MessageStore,
        emitter: &TurnEmitter,
        cancel: &CancellationToken,
        salient: &[String],
    ) -> Result<String, LlmError> {
        // Trim under the budgeter before building the request.
        if self.budgeter.needs_trim(store.messages()) {
            let trimmed = self.budgeter.trim(store.messages(), salient);
            let dropped = store.len().saturating_sub(trimmed.len());
            tracing::debug!(dropped, "context trimmed before LLM call");
            let tail: Vec<ChatMessage> = trimmed
                .into_iter()
                .filter(|m| m.role != Role::System)
                .collect();
            store.replace_tail(tail);
        }

        let messages = normalize_messages(store.messages());
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.sampling_temperature,
            max_tokens: self.config.bounds.max_llm_output_tokens,
        };

        self.execute(request, emitter, cancel).await
    }

    /// Small standalone call (classification, replanning prompts) that does
    /// not involve the session store.
    pub async fn complete_simple(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: usize,
        emitter: &TurnEmitter,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_message),
            ],
            temperature: self.config.sampling_temperature,
            max_tokens: max_tokens.min(self.config.bounds.max_llm_output_tokens),
        };
        self.execute(request, emitter, cancel).await
    }

    async fn execute(
        &self,
        request: ChatRequest,
        emitter: &TurnEmitter,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let prompt_tokens = estimate_tokens(&request.messages);
        let request_digest = payload_digest(&json!({
            "model": request.model,
            "message_count": request.messages.len(),
            "prompt_tokens_est": prompt_tokens,
        }));

        emitter.emit(
            EventKind::LlmRequest,
            json!({
                "digest": request_digest,
                "message_count": request.messages.len(),
                "prompt_tokens_est": prompt_tokens,
                "max_tokens": request.max_tokens,
            }),
        );

        let timeout = self.config.llm_timeout;
        let call = with_retry(&self.retry, || {
            let request = request.clone();
            async move {
                match tokio::time::timeout(timeout, self.backend.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(timeout.as_secs())),
                }
            }
        });

        let outcome = tokio::select! {
            outcome = call => outcome,
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                emitter.emit(
                    EventKind::LlmError,
                    json!({
                        "kind": error_kind(&error),
                        "message": redact(&error.to_string()),
                    }),
                );
                return Err(error);
            }
        };

        // Kill switch for pathological output.
        if let Some(report) = degenerate::detect(&response.text) {
            emitter.emit(
                EventKind::LlmError,
                json!({
                    "kind": report.kind.as_str(),
                    "ratio": report.ratio,
                    "preview": redact(&report.truncated),
                }),
            );
            return Err(LlmError::Degenerate(report.kind.as_str().to_string()));
        }

        let preview: String = response.text.chars().take(200).collect();
        emitter.emit(
            EventKind::LlmResponse,
            json!({
                "chars": response.text.len(),
                "preview": redact(&preview),
                "completion_tokens": response.usage.as_ref().map(|u| u.completion_tokens),
            }),
        );

        Ok(response.text)
    }
}

fn error_kind(error: &LlmError) -> &'static str {
    match error {
        LlmError::Transport(_) => "transport",
        LlmError::Rejected { .. } => "rejected",
        LlmError::Timeout(_) => "timeout",
        LlmError::Degenerate(_) => "repetition",
        LlmError::Protocol(_) => "protocol",
        LlmError::Cancelled => "cancelled",
    }
}
