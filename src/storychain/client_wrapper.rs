//! Provider-neutral message types and the [`ClientWrapper`] trait.
//!
//! A `ClientWrapper` is a wrapper around a specific cloud LLM service. It does not keep track
//! of the conversation; that is the job of a [`Conversation`](crate::conversation::Conversation)
//! owned by an [`Agent`](crate::Agent), which hands the composed message list to the client on
//! every call.

use async_trait::async_trait;
use futures_util::Stream;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Set by the pipeline author to steer the model's responses.
    System,
    /// A prompt: a seed message, a phase task, or direct user input.
    User,
    /// Content generated by the model.
    Assistant,
}

impl Role {
    /// The lowercase wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MessageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(MessageError::InvalidRole(other.to_string())),
        }
    }
}

/// Errors raised while building messages.
///
/// ```
/// use storychain::client_wrapper::{Message, MessageError};
///
/// let err = Message::new("narrator", "hello").unwrap_err();
/// assert_eq!(err, MessageError::InvalidRole("narrator".into()));
/// assert_eq!(err.to_string(), "Invalid role: narrator");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The role was not one of `system`, `user` or `assistant`.
    InvalidRole(String),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::InvalidRole(role) => write!(f, "Invalid role: {}", role),
        }
    }
}

impl Error for MessageError {}

/// Represents a generic message to be sent to an LLM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The actual content of the message.
    pub content: String,
}

impl Message {
    /// Build a message from a role name, rejecting anything outside the three known roles.
    pub fn new(role: &str, content: impl Into<String>) -> Result<Self, MessageError> {
        Ok(Self::with_role(role.parse()?, content))
    }

    /// Build a message from an already validated [`Role`].
    pub fn with_role(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
        }
    }
}

/// Represents a chunk of a streaming message response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageChunk {
    /// The incremental content in this chunk. May be empty for role-only or final deltas.
    pub content: String,
    /// Set by the provider on the last chunk of a choice (`"stop"`, `"length"`, ...).
    pub finish_reason: Option<String>,
}

/// Type alias for a Send-able error box
pub type SendError = Box<dyn Error + Send + Sync>;

/// Stream of chunks returned by [`ClientWrapper::send_message_stream`].
///
/// The stream is `Send` so a whole pipeline run can live on a spawned worker task.
pub type MessageChunkStream = Pin<Box<dyn Stream<Item = Result<MessageChunk, SendError>> + Send>>;

/// Static generation settings an agent passes with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    /// Provider model identifier, e.g. `"gpt-4"`.
    pub model: String,
    /// Upper bound on completion tokens for one call.
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenerationParameters {
    /// Parameters with the provider defaults for sampling (`temperature = 1.0`, `top_p = 1.0`).
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        GenerationParameters {
            model: model.into(),
            max_tokens,
            temperature: 1.0,
            top_p: 1.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }
}

/// Trait defining the interface to interact with various LLM services.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Short provider name used in logs.
    fn provider_name(&self) -> &str;

    /// Send the messages to the LLM and get a streaming response.
    ///
    /// The returned stream yields chunks as they arrive and ends after the provider's final
    /// chunk. Errors while opening the request are returned directly; errors after the
    /// stream started are yielded as `Err` items.
    async fn send_message_stream(
        &self,
        messages: &[Message],
        parameters: &GenerationParameters,
    ) -> Result<MessageChunkStream, SendError>;
}
