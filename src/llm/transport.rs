use crate::config::Config;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;

/// Output budget, carried under whichever parameter name the model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBudget {
    MaxTokens(u32),
    MaxCompletionTokens(u32),
}

/// One chat-completions call: a system and a user message, JSON-object output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: Option<f32>,
    pub token_budget: TokenBudget,
}

/// The first choice of a completion. Both fields are `None` when no choice came back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub content: Option<String>,
    pub refusal: Option<String>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            refusal: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        param: Option<String>,
    },
    #[error("backend error: {0}")]
    Api(String),
    #[error("invalid request: {0}")]
    Build(String),
}

impl TransportError {
    /// Whether resending the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited(_)
                | TransportError::Timeout
                | TransportError::Network(_)
                | TransportError::Api(_)
        )
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, TransportError>;
}

/// OpenAI-compatible chat-completions endpoint.
pub struct OpenAiTransport {
    client: Client<OpenAIConfig>,
}

impl OpenAiTransport {
    pub fn new(config: &Config, api_key: &str) -> anyhow::Result<Self> {
        let openai_config = OpenAIConfig::new()
            .with_api_base(&config.openai_base_url)
            .with_api_key(api_key);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.openai_timeout_secs))
            .build()?;

        // One HTTP request per call; retries happen in `LlmClient`
        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Ok(Self {
            client: Client::with_config(openai_config)
                .with_http_client(http)
                .with_backoff(no_retry),
        })
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, TransportError> {
        let openai_request = build_request(request).map_err(map_openai_error)?;
        let response = self
            .client
            .chat()
            .create(openai_request)
            .await
            .map_err(map_openai_error)?;

        let Some(choice) = response.choices.into_iter().next() else {
            return Ok(ChatReply::default());
        };
        Ok(ChatReply {
            content: choice.message.content,
            refusal: choice.message.refusal,
        })
    }
}

// `max_tokens` is deprecated upstream but still the only name older models accept
#[allow(deprecated)]
pub(crate) fn build_request(
    request: &ChatRequest,
) -> Result<CreateChatCompletionRequest, OpenAIError> {
    let messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system_prompt.clone())
            .build()?
            .into(),
        ChatCompletionRequestUserMessageArgs::default()
            .content(request.user_prompt.clone())
            .build()?
            .into(),
    ];

    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(&request.model)
        .messages(messages)
        .response_format(ResponseFormat::JsonObject);
    if let Some(temperature) = request.temperature {
        args.temperature(temperature);
    }
    match request.token_budget {
        TokenBudget::MaxTokens(n) => {
            args.max_tokens(n);
        }
        TokenBudget::MaxCompletionTokens(n) => {
            args.max_completion_tokens(n);
        }
    }
    args.build()
}

fn map_openai_error(err: OpenAIError) -> TransportError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => TransportError::Timeout,
        OpenAIError::Reqwest(e) => TransportError::Network(e.to_string()),
        OpenAIError::ApiError(api) => classify_api_error(api.message, api.r#type, api.param),
        OpenAIError::InvalidArgument(msg) => TransportError::Build(msg),
        other => TransportError::Api(other.to_string()),
    }
}

/// Maps an error body returned by the backend onto a transport error kind.
pub(crate) fn classify_api_error(
    message: String,
    kind: Option<String>,
    param: Option<String>,
) -> TransportError {
    let kind = kind.unwrap_or_default();
    let lower = message.to_lowercase();

    if kind.contains("rate_limit") || lower.contains("rate limit") {
        TransportError::RateLimited(message)
    } else if kind == "authentication_error"
        || lower.contains("incorrect api key")
        || lower.contains("invalid_api_key")
    {
        TransportError::Unauthorized(message)
    } else if kind == "invalid_request_error" {
        TransportError::BadRequest { message, param }
    } else {
        TransportError::Api(message)
    }
}
