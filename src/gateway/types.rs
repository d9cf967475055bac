//! Core types for the completion gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request through the gateway carries attribution so usage records can
/// say which code path issued the call and which grading job it belonged to.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Grading job this request is part of (one per CLI run, for example).
    pub job_id: Option<Uuid>,
    /// Which code path made this call, e.g. "grading::batch".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Completion services speaking the OpenAI-compatible chat-completions protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Perplexity,
    OpenRouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Perplexity => "perplexity",
            Provider::OpenRouter => "openrouter",
        }
    }

    /// Prefix of the environment variables configuring this provider
    /// (`<PREFIX>_API_KEY`, `<PREFIX>_BASE_URL`, `<PREFIX>_TIMEOUT_SECONDS`).
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OPENAI",
            Provider::Perplexity => "PERPLEXITY",
            Provider::OpenRouter => "OPENROUTER",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::Perplexity => "https://api.perplexity.ai",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAI => "gpt-4o",
            Provider::Perplexity => "llama-3.1-sonar-small-128k-online",
            Provider::OpenRouter => "openai/gpt-4o",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "perplexity" => Some(Provider::Perplexity),
            "openrouter" => Some(Provider::OpenRouter),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat model specification: which provider serves it and its model id there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatModel {
    /// OpenAI model, e.g. "gpt-4o"
    OpenAI(String),
    /// Perplexity model, e.g. "llama-3.1-sonar-small-128k-online"
    Perplexity(String),
    /// OpenRouter model, e.g. "openai/gpt-4o"
    OpenRouter(String),
}

impl ChatModel {
    pub fn new(provider: Provider, model_id: impl Into<String>) -> Self {
        let id = model_id.into();
        match provider {
            Provider::OpenAI => ChatModel::OpenAI(id),
            Provider::Perplexity => ChatModel::Perplexity(id),
            Provider::OpenRouter => ChatModel::OpenRouter(id),
        }
    }

    /// Provider default model.
    pub fn default_for(provider: Provider) -> Self {
        Self::new(provider, provider.default_model())
    }

    pub fn openai(model_id: impl Into<String>) -> Self {
        ChatModel::OpenAI(model_id.into())
    }

    pub fn perplexity(model_id: impl Into<String>) -> Self {
        ChatModel::Perplexity(model_id.into())
    }

    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenAI(id) | ChatModel::Perplexity(id) | ChatModel::OpenRouter(id) => id,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            ChatModel::OpenAI(_) => Provider::OpenAI,
            ChatModel::Perplexity(_) => Provider::Perplexity,
            ChatModel::OpenRouter(_) => Provider::OpenRouter,
        }
    }
}

impl Default for ChatModel {
    fn default() -> Self {
        ChatModel::default_for(Provider::OpenAI)
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,
    /// Penalty on repeated tokens.
    pub frequency_penalty: Option<f32>,
    /// Perplexity only: restrict web search to recent sources ("month", "year").
    pub search_recency_filter: Option<String>,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            search_recency_filter: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = Some(penalty);
        self
    }

    pub fn search_recency(mut self, filter: impl Into<String>) -> Self {
        self.search_recency_filter = Some(filter.into());
        self
    }

    /// Total characters across all message bodies.
    pub fn input_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated content, trimmed.
    pub content: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Cost in nanodollars.
    pub cost_nanodollars: i64,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Provider request id (x-request-id), if sent.
    pub request_id: Option<String>,
}

impl ChatResponse {
    /// Placeholder used when recording usage for failed calls.
    pub(crate) fn empty() -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Unknown("error".to_string()),
            request_id: None,
        }
    }
}
