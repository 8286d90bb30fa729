//! Agent System
//!
//! This module provides the [`Agent`] struct: one conversational role in a pipeline, with its
//! own [`Conversation`], static [`GenerationParameters`] and display metadata.
//!
//! # Generation
//!
//! [`Agent::generate`] trims the history, optionally appends a user message, sends the composed
//! request to the agent's [`ClientWrapper`] and returns a [`ResponseStream`]. Every non-empty
//! fragment is folded into the history *while* the caller consumes the stream, so a partially
//! consumed or failed reply is still remembered by later calls.
//!
//! # Event System
//!
//! Agents emit [`AgentEvent`]s while they generate. Attach an
//! [`EventHandler`] via [`with_event_handler`](Agent::with_event_handler) or
//! [`set_event_handler`](Agent::set_event_handler) to receive them; the
//! [`ColorConsole`](crate::display::ColorConsole) handler uses these events to paint the
//! agent's output in its color.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storychain::client_wrapper::{GenerationParameters, Role};
//! use storychain::clients::openai::OpenAIClient;
//! use storychain::display::{AgentColor, ColorConsole};
//! use storychain::Agent;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = Arc::new(OpenAIClient::new(&std::env::var("OPENAI_API_KEY")?)?);
//! let mut agent = Agent::new("Critic", client, GenerationParameters::new("gpt-4", 512), 4)
//!     .with_color(AgentColor::LightRed)
//!     .with_event_handler(Arc::new(ColorConsole::stdout()));
//!
//! agent.append_message(Role::System, "You review user stories.", false);
//! let review = agent.get_full_response("As a user I want to log in.").await?;
//! println!("{}", review);
//! # Ok(())
//! # }
//! ```

use crate::storychain::client_wrapper::{
    ClientWrapper, GenerationParameters, MessageChunkStream, Role, SendError,
};
use crate::storychain::config::{AgentSpec, PipelineConfig};
use crate::storychain::conversation::Conversation;
use crate::storychain::display::{AgentColor, ColorError};
use crate::storychain::event::{AgentEvent, EventHandler};
use futures_util::stream::{self, Stream, StreamExt};
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Fragments of one reply, in arrival order.
///
/// The stream is finite and cannot be restarted: it ends with `None` after the provider's last
/// chunk, or yields a single `Err` and then ends.
pub type ResponseStream<'a> = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send + 'a>>;

/// A failed generation. Both variants count as a generation failure; the history keeps every
/// fragment received before the error.
#[derive(Debug)]
pub enum AgentError {
    /// The provider rejected or could not open the request.
    Generation { agent: String, source: SendError },
    /// The stream broke after the reply had started.
    Stream { agent: String, source: SendError },
}

impl AgentError {
    pub fn agent_name(&self) -> &str {
        match self {
            AgentError::Generation { agent, .. } | AgentError::Stream { agent, .. } => agent,
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Generation { agent, source } => {
                write!(f, "Agent '{}' failed to generate a response: {}", agent, source)
            }
            AgentError::Stream { agent, source } => {
                write!(f, "Agent '{}' lost its response stream: {}", agent, source)
            }
        }
    }
}

impl Error for AgentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AgentError::Generation { source, .. } | AgentError::Stream { source, .. } => {
                Some(source.as_ref())
            }
        }
    }
}

/// An LLM-backed participant with its own bounded conversation.
pub struct Agent {
    pub name: String,
    /// Display metadata only; never written into the conversation.
    pub color: Option<AgentColor>,
    conversation: Conversation,
    client: Arc<dyn ClientWrapper>,
    parameters: GenerationParameters,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ClientWrapper>,
        parameters: GenerationParameters,
        max_history: usize,
    ) -> Self {
        Agent {
            name: name.into(),
            color: None,
            conversation: Conversation::new(max_history),
            client,
            parameters,
            event_handler: None,
        }
    }

    /// Build an agent from its configuration entry.
    ///
    /// The agent's `system` and `user` messages become its permanent preamble. Fails when the
    /// configured color is outside the palette.
    pub fn from_spec(
        spec: &AgentSpec,
        config: &PipelineConfig,
        client: Arc<dyn ClientWrapper>,
    ) -> Result<Self, ColorError> {
        let color: AgentColor = spec
            .color
            .parse()
            .map_err(|err: ColorError| err.for_agent(&spec.name))?;
        let parameters =
            GenerationParameters::new(config.openai_model.clone(), config.max_tokens_per_call)
                .with_temperature(spec.temperature)
                .with_top_p(spec.top_p);

        let mut agent = Agent::new(spec.name.clone(), client, parameters, spec.max_history)
            .with_color(color);
        agent.append_message(Role::System, spec.system.clone(), false);
        agent.append_message(Role::User, spec.user.clone(), false);
        Ok(agent)
    }

    pub fn with_color(mut self, color: AgentColor) -> Self {
        self.color = Some(color);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set or replace the event handler on an agent that is already built.
    pub fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.event_handler = Some(handler);
    }

    /// Append to the rolling history (`to_history = true`) or to the permanent preamble.
    pub fn append_message(&mut self, role: Role, content: impl Into<String>, to_history: bool) {
        self.conversation.append(role, content, to_history);
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn parameters(&self) -> &GenerationParameters {
        &self.parameters
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_agent_event(&event).await;
        }
    }

    /// Start a reply and return its fragments as a stream.
    ///
    /// `user_message` is appended to the history first unless it is empty. The history is
    /// trimmed to `max_history` before anything is appended.
    pub async fn generate(&mut self, user_message: &str) -> Result<ResponseStream<'_>, AgentError> {
        let evicted = self.conversation.trim();
        if evicted > 0 {
            log::debug!(
                "Agent::generate(...): '{}' evicted {} history message(s)",
                self.name,
                evicted
            );
        }
        if !user_message.is_empty() {
            self.conversation.append(Role::User, user_message, true);
        }

        let request = self.conversation.compose_request();
        let chunks = match self
            .client
            .send_message_stream(&request, &self.parameters)
            .await
        {
            Ok(chunks) => chunks,
            Err(source) => {
                log::error!(
                    "Agent::generate(...): '{}' request to {} failed: {}",
                    self.name,
                    self.client.provider_name(),
                    source
                );
                self.emit(AgentEvent::GenerationFailed {
                    agent_name: self.name.clone(),
                    error: source.to_string(),
                })
                .await;
                return Err(AgentError::Generation {
                    agent: self.name.clone(),
                    source,
                });
            }
        };

        self.emit(AgentEvent::GenerationStarted {
            agent_name: self.name.clone(),
            color: self.color,
        })
        .await;

        let state = ReplyState {
            chunks,
            agent_name: self.name.clone(),
            color: self.color,
            handler: self.event_handler.clone(),
            conversation: &mut self.conversation,
            response_length: 0,
            finished: false,
        };
        Ok(Box::pin(stream::unfold(state, |state| next_fragment(state))))
    }

    /// Generate and wait for the whole reply.
    pub async fn get_full_response(&mut self, user_message: &str) -> Result<String, AgentError> {
        let mut fragments = self.generate(user_message).await?;
        let mut response = String::new();
        while let Some(fragment) = fragments.next().await {
            response.push_str(&fragment?);
        }
        Ok(response)
    }
}

struct ReplyState<'a> {
    chunks: MessageChunkStream,
    agent_name: String,
    color: Option<AgentColor>,
    handler: Option<Arc<dyn EventHandler>>,
    conversation: &'a mut Conversation,
    response_length: usize,
    finished: bool,
}

async fn emit_to(handler: &Option<Arc<dyn EventHandler>>, event: AgentEvent) {
    if let Some(handler) = handler {
        handler.on_agent_event(&event).await;
    }
}

async fn next_fragment(
    mut state: ReplyState<'_>,
) -> Option<(Result<String, AgentError>, ReplyState<'_>)> {
    if state.finished {
        return None;
    }
    loop {
        match state.chunks.next().await {
            Some(Ok(chunk)) => {
                if chunk.content.is_empty() {
                    continue;
                }
                state.conversation.fold_fragment(&chunk.content);
                state.response_length += chunk.content.chars().count();
                let event = AgentEvent::FragmentReceived {
                    agent_name: state.agent_name.clone(),
                    color: state.color,
                    fragment: chunk.content.clone(),
                };
                emit_to(&state.handler, event).await;
                return Some((Ok(chunk.content), state));
            }
            Some(Err(source)) => {
                log::error!(
                    "Agent::generate(...): '{}' stream failed after {} chars: {}",
                    state.agent_name,
                    state.response_length,
                    source
                );
                state.finished = true;
                let event = AgentEvent::GenerationFailed {
                    agent_name: state.agent_name.clone(),
                    error: source.to_string(),
                };
                emit_to(&state.handler, event).await;
                let err = AgentError::Stream {
                    agent: state.agent_name.clone(),
                    source,
                };
                return Some((Err(err), state));
            }
            None => {
                state.finished = true;
                let event = AgentEvent::GenerationCompleted {
                    agent_name: state.agent_name.clone(),
                    color: state.color,
                    response_length: state.response_length,
                };
                emit_to(&state.handler, event).await;
                return None;
            }
        }
    }
}
