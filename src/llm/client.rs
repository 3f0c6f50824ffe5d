use crate::config::Config;
use crate::llm::transport::{
    ChatReply, ChatRequest, ChatTransport, OpenAiTransport, TokenBudget, TransportError,
};
use crate::llm::StructuredReply;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 600;
// Reasoning models can spend a large part of the budget before emitting visible text;
// too small a budget yields a 200 OK with empty content.
const REASONING_MAX_OUTPUT_TOKENS: u32 = 2000;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const MAX_BACKOFF_SECS: u64 = 8;

const REASONING_MODEL_PREFIXES: &[&str] = &["gpt-5", "o1", "o3", "o4"];

/// Which token-budget parameter name the backend accepts for this client's model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenParam {
    Unknown,
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenParam {
    pub fn name(&self) -> &'static str {
        match self {
            TokenParam::Unknown => "unknown",
            TokenParam::MaxTokens => "max_tokens",
            TokenParam::MaxCompletionTokens => "max_completion_tokens",
        }
    }

    fn budget(&self, tokens: u32) -> TokenBudget {
        match self {
            TokenParam::MaxCompletionTokens => TokenBudget::MaxCompletionTokens(tokens),
            TokenParam::MaxTokens | TokenParam::Unknown => TokenBudget::MaxTokens(tokens),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion backend is not configured (missing OPENAI_API_KEY)")]
    NotConfigured,
    #[error("model refused to answer: {0}")]
    Refusal(String),
    #[error("empty completion response")]
    EmptyResponse,
    #[error("completion is not a valid JSON object: {0}")]
    InvalidJson(String),
    #[error("completion does not match the expected schema: {0}")]
    Schema(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::NotConfigured => false,
            LlmError::Refusal(_)
            | LlmError::EmptyResponse
            | LlmError::InvalidJson(_)
            | LlmError::Schema(_) => true,
            LlmError::Transport(e) => e.is_transient(),
        }
    }
}

/// Result of a single attempt, as seen by the retry loop.
enum Attempt<T> {
    Done(T),
    Retryable(LlmError),
    Fatal(LlmError),
}

impl<T> From<Result<T, LlmError>> for Attempt<T> {
    fn from(result: Result<T, LlmError>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Request-shape fix suggested by a backend rejection.
#[derive(Debug, PartialEq, Eq)]
enum Correction {
    UseTokenParam(TokenParam),
    DropTemperature,
}

fn correction_for(message: &str, param: Option<&str>) -> Option<Correction> {
    let mentions_both = message.contains("max_tokens") && message.contains("max_completion_tokens");
    if mentions_both {
        if message.contains("max_tokens' is not supported")
            || message.contains("Use 'max_completion_tokens' instead")
        {
            return Some(Correction::UseTokenParam(TokenParam::MaxCompletionTokens));
        }
        if message.contains("max_completion_tokens' is not supported")
            || message.contains("Use 'max_tokens' instead")
        {
            return Some(Correction::UseTokenParam(TokenParam::MaxTokens));
        }
    }

    let lower = message.to_lowercase();
    let unsupported = lower.contains("unsupported") || lower.contains("not supported");
    match param {
        Some("max_tokens") if unsupported => {
            return Some(Correction::UseTokenParam(TokenParam::MaxCompletionTokens))
        }
        Some("max_completion_tokens") if unsupported => {
            return Some(Correction::UseTokenParam(TokenParam::MaxTokens))
        }
        _ => {}
    }

    if lower.contains("temperature") && (unsupported || message.contains("Only the default")) {
        return Some(Correction::DropTemperature);
    }
    None
}

pub fn is_reasoning_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    // Routed names look like "openai/gpt-5-mini"
    let base = model.rsplit('/').next().unwrap_or(&model);
    REASONING_MODEL_PREFIXES.iter().any(|p| base.starts_with(p))
}

/// Delay before retry number `attempt + 1`: 1s, 2s, 4s, then 8s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

fn with_schema_instruction<T: StructuredReply>(system_prompt: &str) -> String {
    let schema = schemars::schema_for!(T);
    let schema_json = serde_json::to_string(&schema).unwrap_or_default();
    format!(
        "{}\n\nRespond with a single JSON object that conforms to this JSON Schema:\n{}",
        system_prompt.trim_end(),
        schema_json
    )
}

fn parse_reply<T: StructuredReply>(reply: ChatReply) -> Result<T, LlmError> {
    let content = reply.content.as_deref().map(str::trim).unwrap_or("");
    if content.is_empty() {
        return Err(match reply.refusal.filter(|r| !r.trim().is_empty()) {
            Some(refusal) => LlmError::Refusal(refusal),
            None => LlmError::EmptyResponse,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| LlmError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(LlmError::InvalidJson("expected a single JSON object".to_string()));
    }
    let parsed: T = serde_json::from_value(value).map_err(|e| LlmError::Schema(e.to_string()))?;
    parsed.validate().map_err(LlmError::Schema)?;
    Ok(parsed)
}

pub struct LlmClient {
    transport: Option<Arc<dyn ChatTransport>>,
    model: String,
    max_retries: u32,
    token_param: Mutex<TokenParam>,
}

impl LlmClient {
    /// Builds a client for the configured backend. Without an API key the client is
    /// left unconfigured and every request fails with [`LlmError::NotConfigured`].
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let transport = match config.openai_api_key.as_deref() {
            Some(key) => Some(Arc::new(OpenAiTransport::new(config, key)?) as Arc<dyn ChatTransport>),
            None => None,
        };
        Ok(Self {
            transport,
            model: config.openai_model.clone(),
            max_retries: config.openai_max_retries,
            token_param: Mutex::new(TokenParam::Unknown),
        })
    }

    pub fn with_transport(
        transport: Arc<dyn ChatTransport>,
        model: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            transport: Some(transport),
            model: model.into(),
            max_retries,
            token_param: Mutex::new(TokenParam::Unknown),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Currently cached token-parameter choice.
    pub fn token_param(&self) -> TokenParam {
        *self.token_param.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Resolves the token parameter, guessing from the model name on first use.
    fn negotiate_token_param(&self) -> TokenParam {
        let mut current = self.token_param.lock().unwrap_or_else(|p| p.into_inner());
        if *current == TokenParam::Unknown {
            *current = if is_reasoning_model(&self.model) {
                TokenParam::MaxCompletionTokens
            } else {
                TokenParam::MaxTokens
            };
            debug!("Token parameter for {}: guessed {}", self.model, current.name());
        }
        *current
    }

    /// Records the parameter the backend asked for. Returns false if it was already in use.
    fn flip_token_param(&self, to: TokenParam) -> bool {
        let mut current = self.token_param.lock().unwrap_or_else(|p| p.into_inner());
        if *current == to {
            return false;
        }
        *current = to;
        true
    }

    fn max_output_tokens(&self) -> u32 {
        if is_reasoning_model(&self.model) {
            REASONING_MAX_OUTPUT_TOKENS
        } else {
            DEFAULT_MAX_OUTPUT_TOKENS
        }
    }

    /// Asks the model for a JSON object of type `T`, retrying transient failures with
    /// exponential backoff (`max_retries` extra attempts, delays capped at 8s).
    pub async fn request_structured<T: StructuredReply>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T, LlmError> {
        let transport = self.transport.as_ref().ok_or(LlmError::NotConfigured)?;
        let system_prompt = with_schema_instruction::<T>(system_prompt);
        let total_attempts = self.max_retries + 1;

        let mut attempt = 0u32;
        loop {
            match self
                .attempt_once::<T>(transport.as_ref(), &system_prompt, user_prompt)
                .await
            {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) => {
                    if attempt + 1 >= total_attempts {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        "Completion call failed (attempt {}/{}): {}. Retrying in {}",
                        attempt + 1,
                        total_attempts,
                        e,
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once<T: StructuredReply>(
        &self,
        transport: &dyn ChatTransport,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Attempt<T> {
        let max_out = self.max_output_tokens();
        let mut request = ChatRequest {
            model: self.model.clone(),
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            temperature: (!is_reasoning_model(&self.model)).then_some(DEFAULT_TEMPERATURE),
            token_budget: self.negotiate_token_param().budget(max_out),
        };
        let mut token_param_corrected = false;
        let mut temperature_dropped = false;

        let reply = loop {
            match transport.complete(&request).await {
                Ok(reply) => break reply,
                Err(TransportError::BadRequest { message, param }) => {
                    match correction_for(&message, param.as_deref()) {
                        Some(Correction::UseTokenParam(to))
                            if !token_param_corrected && self.flip_token_param(to) =>
                        {
                            debug!(
                                "Backend rejected token parameter for {}; switching to {}",
                                self.model,
                                to.name()
                            );
                            request.token_budget = to.budget(max_out);
                            token_param_corrected = true;
                        }
                        Some(Correction::DropTemperature)
                            if !temperature_dropped && request.temperature.is_some() =>
                        {
                            debug!("Backend rejected temperature for {}; omitting it", self.model);
                            request.temperature = None;
                            temperature_dropped = true;
                        }
                        _ => {
                            return Attempt::Fatal(
                                TransportError::BadRequest { message, param }.into(),
                            )
                        }
                    }
                }
                Err(e) => return Err::<T, _>(LlmError::from(e)).into(),
            }
        };

        parse_reply::<T>(reply).into()
    }
}
