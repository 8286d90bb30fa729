//! Agent and pipeline event system.
//!
//! Provides a callback-based observability layer. Implement [`EventHandler`] to receive
//! real-time notifications about:
//!
//! - **Generation**: an agent starting a reply, every streamed fragment, the end of the reply
//! - **Scheduling**: phase boundaries, task assignment, skipped agents
//! - **Run lifecycle**: start, completion and user-requested stops
//!
//! Both handler methods have default no-op implementations, so you only override what you
//! care about. The handler is wrapped in `Arc<dyn EventHandler>`; when attached to a
//! [`Pipeline`](crate::pipeline::Pipeline) it is propagated to every agent the pipeline owns.
//!
//! Two handlers ship with the crate: [`ColorConsole`](crate::display::ColorConsole), which
//! paints agent output on a terminal, and [`RunSession`](crate::run::RunSession), which turns
//! events into [`RunMessage`](crate::run::RunMessage)s for an observer.
//!
//! # Event flow for one agent step
//!
//! ```text
//! TaskAssigned
//!   └─ GenerationStarted
//!   └─ FragmentReceived (repeated)
//!   └─ GenerationCompleted | GenerationFailed
//! AgentResponded
//! ```

use crate::storychain::display::AgentColor;
use async_trait::async_trait;
use std::sync::Arc;

/// Events emitted by an [`Agent`](crate::Agent) while it generates.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The provider accepted the request; fragments follow.
    GenerationStarted {
        agent_name: String,
        color: Option<AgentColor>,
    },

    /// One streamed fragment, already folded into the agent's history.
    FragmentReceived {
        agent_name: String,
        color: Option<AgentColor>,
        fragment: String,
    },

    /// The stream ended normally.
    GenerationCompleted {
        agent_name: String,
        color: Option<AgentColor>,
        /// Character length of the full reply.
        response_length: usize,
    },

    /// The request could not be opened or the stream broke.
    GenerationFailed { agent_name: String, error: String },
}

/// Why the scheduler passed over an `agent_order` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The name does not match any configured agent.
    UnknownAgent,
    /// The agent has no task template for the current phase.
    NoTaskForPhase,
}

/// Events emitted by the [`Pipeline`](crate::pipeline::Pipeline) scheduler.
///
/// Phase numbers are 1-based, matching the task keys in the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RunStarted {
        session_id: String,
        phases: usize,
        agent_count: usize,
    },
    PhaseStarted {
        phase: usize,
    },
    AgentSkipped {
        phase: usize,
        agent_name: String,
        reason: SkipReason,
    },
    /// Fired right before the task text is appended to the agent's history.
    TaskAssigned {
        phase: usize,
        agent_name: String,
        task_template: String,
    },
    AgentResponded {
        phase: usize,
        agent_name: String,
        response_length: usize,
    },
    RunCompleted {
        phases_completed: usize,
    },
    /// The cancellation flag was observed before `phase` could start or finish.
    RunStopped {
        phase: usize,
    },
}

/// Receives [`AgentEvent`]s and [`PipelineEvent`]s.
///
/// ```rust
/// use async_trait::async_trait;
/// use storychain::event::{AgentEvent, EventHandler};
///
/// struct FragmentCounter;
///
/// #[async_trait]
/// impl EventHandler for FragmentCounter {
///     async fn on_agent_event(&self, event: &AgentEvent) {
///         if let AgentEvent::FragmentReceived { agent_name, fragment, .. } = event {
///             log::trace!("{} +{} chars", agent_name, fragment.len());
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called when an agent emits an event.
    async fn on_agent_event(&self, _event: &AgentEvent) {}

    /// Called when the scheduler emits an event.
    async fn on_pipeline_event(&self, _event: &PipelineEvent) {}
}

/// Forwards every event to several handlers, in registration order.
#[derive(Default)]
pub struct FanOut {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl FanOut {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        FanOut { handlers }
    }

    pub fn push(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl EventHandler for FanOut {
    async fn on_agent_event(&self, event: &AgentEvent) {
        for handler in &self.handlers {
            handler.on_agent_event(event).await;
        }
    }

    async fn on_pipeline_event(&self, event: &PipelineEvent) {
        for handler in &self.handlers {
            handler.on_pipeline_event(event).await;
        }
    }
}
