use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// Single-shot prompt: one system instruction plus one user payload.
    pub fn prompt(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            max_tokens: 512,
            temperature: 0.7,
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

/// LLM completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error type for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Trait for text-generation providers. Used both for persona replies and
/// for the narrative calls of the reflection pipeline.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

/// Run a completion with a hard deadline. Elapsed deadlines surface as
/// `LlmError::Timeout` so callers handle them like any other failure.
pub async fn complete_within<P: LlmProvider + ?Sized>(
    provider: &P,
    request: CompletionRequest,
    limit: Duration,
) -> Result<CompletionResponse, LlmError> {
    match tokio::time::timeout(limit, provider.complete(request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(provider = provider.name(), ?limit, "LLM call timed out");
            Err(LlmError::Timeout(limit))
        }
    }
}

/// Mock provider that always returns the same text.
#[derive(Debug, Clone)]
pub struct MockProvider {
    pub response: String,
}

impl MockProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into() }
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        let content = self.response.clone();
        Box::pin(async move {
            Ok(CompletionResponse { content, input_tokens: 10, output_tokens: 20 })
        })
    }
}

/// Mock provider that replays a queue of outcomes, one per call.
/// Once the queue is drained every further call fails.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, String>>>,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn then_reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    /// Queue a failing call.
    pub fn then_fail(self, reason: impl Into<String>) -> Self {
        self.push(Err(reason.into()));
        self
    }

    fn push(&self, item: Result<String, String>) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.push_back(item);
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).push(request);
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(content)) => {
                    Ok(CompletionResponse { content, input_tokens: 10, output_tokens: 20 })
                }
                Some(Err(reason)) => Err(LlmError::RequestFailed(reason)),
                None => Err(LlmError::Unavailable("script exhausted".into())),
            }
        })
    }
}

/// Mock provider that always fails.
#[derive(Debug, Clone, Default)]
pub struct FailingProvider;

impl LlmProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        Box::pin(async { Err(LlmError::Unavailable("failing provider".into())) })
    }
}

/// Mock provider that never answers before the given delay.
#[derive(Debug, Clone)]
pub struct StalledProvider {
    pub delay: Duration,
}

impl LlmProvider for StalledProvider {
    fn name(&self) -> &str {
        "stalled"
    }

    fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(CompletionResponse { content: "too late".into(), input_tokens: 0, output_tokens: 0 })
        })
    }
}
