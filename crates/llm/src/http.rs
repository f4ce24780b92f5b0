//! HTTP-based LLM providers.
//!
//! Two wire dialects are spoken: OpenAI-style chat completions (OpenAI,
//! Gemini's compatibility endpoint, DeepSeek, local gateways) and Anthropic's
//! Messages API. The dialect and default host follow from the model name.

use crate::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model-name prefixes and the host each one defaults to.
const HOSTS: &[(&[&str], &str)] = &[
    (&["gpt-", "o1-", "o3-", "o4-"], "https://api.openai.com/v1"),
    (&["claude-"], "https://api.anthropic.com"),
    (&["gemini-"], "https://generativelanguage.googleapis.com/v1beta/openai"),
    (&["deepseek-"], "https://api.deepseek.com"),
];

/// Request/response shape a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    ChatCompletions,
    Messages,
}

impl Dialect {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().starts_with("claude-") { Self::Messages } else { Self::ChatCompletions }
    }
}

/// Default host for a model, or the OpenAI host when the prefix is unknown.
pub fn default_host(model: &str) -> &'static str {
    let m = model.to_lowercase();
    HOSTS
        .iter()
        .find(|(prefixes, _)| prefixes.iter().any(|p| m.starts_with(p)))
        .map_or(HOSTS[0].1, |&(_, host)| host)
}

// ── Wire types ──

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for Turn<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        Turn { role, content: &m.content }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatReply {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Turn<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct MessagesReply {
    content: Vec<Block>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl ChatReply {
    fn into_response(self) -> CompletionResponse {
        let content = self.choices.into_iter().next().and_then(|c| c.message.content).unwrap_or_default();
        let (input_tokens, output_tokens) =
            self.usage.map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
        CompletionResponse { content, input_tokens, output_tokens }
    }
}

impl MessagesReply {
    fn into_response(self) -> CompletionResponse {
        let content = self
            .content
            .into_iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text),
                Block::Other => None,
            })
            .collect();
        let (input_tokens, output_tokens) = self.usage.map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
        CompletionResponse { content, input_tokens, output_tokens }
    }
}

// ── Provider ──

/// Text generation over HTTP. One instance per role (replier or narrator).
pub struct HttpProvider {
    role: &'static str,
    dialect: Dialect,
    model: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(role: &'static str, model: String, api_key: String, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| default_host(&model).to_owned());
        Self {
            role,
            dialect: Dialect::for_model(&model),
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_owned(),
            model,
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        match self.dialect {
            Dialect::Messages => format!("{}/v1/messages", self.base_url),
            Dialect::ChatCompletions => format!("{}/chat/completions", self.base_url),
        }
    }

    /// POST a body and decode the success payload. Non-2xx statuses become
    /// [`LlmError`] variants through [`status_error`].
    async fn post<B: Serialize, R: DeserializeOwned>(&self, body: &B) -> Result<R, LlmError> {
        let builder = self.client.post(self.endpoint()).json(body);
        let builder = match self.dialect {
            Dialect::Messages => {
                builder.header("x-api-key", &self.api_key).header("anthropic-version", ANTHROPIC_VERSION)
            }
            Dialect::ChatCompletions => builder.bearer_auth(&self.api_key),
        };

        let resp = builder.send().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }
        resp.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))
    }

    async fn send(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = match self.dialect {
            Dialect::ChatCompletions => {
                let body = ChatBody {
                    model: &self.model,
                    messages: request.messages.iter().map(Turn::from).collect(),
                    max_tokens: request.max_tokens,
                    temperature: request.temperature,
                };
                self.post::<_, ChatReply>(&body).await?.into_response()
            }
            Dialect::Messages => {
                // system prompt travels outside the turn list
                let body = MessagesBody {
                    model: &self.model,
                    max_tokens: request.max_tokens,
                    system: request.messages.iter().find(|m| m.role == Role::System).map(|m| m.content.as_str()),
                    messages: request.messages.iter().filter(|m| m.role != Role::System).map(Turn::from).collect(),
                    temperature: request.temperature,
                };
                self.post::<_, MessagesReply>(&body).await?.into_response()
            }
        };

        tracing::debug!(
            role = self.role,
            model = %self.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "completion received"
        );
        Ok(response)
    }
}

/// 429 is rate limiting, 5xx means the backend is down, anything else is a bad request.
fn status_error(status: reqwest::StatusCode, body: String) -> LlmError {
    match status.as_u16() {
        429 => LlmError::RateLimited,
        500..=599 => LlmError::Unavailable(format!("{status}: {body}")),
        _ => LlmError::RequestFailed(format!("{status}: {body}")),
    }
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        self.role
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        Box::pin(self.send(request))
    }
}

/// Build a provider from `model_var`, `PERSONA_LLM_API_KEY`, and optionally
/// `PERSONA_LLM_BASE_URL`. `None` when the model or key is missing.
pub fn from_env_with_model_var(role: &'static str, model_var: &str) -> Option<HttpProvider> {
    let model = std::env::var(model_var).ok().filter(|m| !m.trim().is_empty())?;
    let api_key = std::env::var("PERSONA_LLM_API_KEY").ok()?;
    let base_url = std::env::var("PERSONA_LLM_BASE_URL").ok();
    Some(HttpProvider::new(role, model, api_key, base_url))
}

/// Reply provider from `PERSONA_LLM_MODEL`.
pub fn from_env() -> Option<HttpProvider> {
    from_env_with_model_var("replier", "PERSONA_LLM_MODEL")
}

/// Narrative provider from `PERSONA_NARRATIVE_MODEL`.
pub fn narrative_from_env() -> Option<HttpProvider> {
    from_env_with_model_var("narrator", "PERSONA_NARRATIVE_MODEL")
}
