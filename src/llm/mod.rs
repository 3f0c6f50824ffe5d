pub mod client;
pub mod transport;

pub use client::{LlmClient, LlmError, TokenParam};
pub use transport::{ChatReply, ChatRequest, ChatTransport, OpenAiTransport, TokenBudget, TransportError};

/// A JSON object the model is asked to produce.
///
/// The JSON schema is derived from the type and sent along with the prompt;
/// `validate` covers constraints the schema cannot express.
pub trait StructuredReply: serde::de::DeserializeOwned + schemars::JsonSchema + Send {
    fn validate(&self) -> Result<(), String>;
}
