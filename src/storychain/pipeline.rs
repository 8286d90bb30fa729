//! Phase-by-phase pipeline scheduler.
//!
//! A [`Pipeline`] owns one [`Agent`] per configured agent and threads a single text artifact
//! through them. The schedule is fixed by the configuration: `iterations` phases, and in each
//! phase every name of `agent_order` in turn. An agent acts in a phase only when it has a task
//! template for that phase; the template is combined with the current artifact, appended to
//! the agent's history, and the agent's full reply becomes the new artifact.
//!
//! ```text
//! seed ──► phase 1: A(task 1) ──► B(task 1) ──► phase 2: A(task 2) ──► ... ──► artifact
//! ```
//!
//! Cancellation is cooperative: the [`RunSession`] flag is checked before every phase and every
//! agent step, never in the middle of a generation.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storychain::clients::openai::OpenAIClient;
//! use storychain::config::PipelineConfig;
//! use storychain::pipeline::Pipeline;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = PipelineConfig::from_file("config/story_pipeline.json")?;
//! let client = Arc::new(OpenAIClient::new(&std::env::var("OPENAI_API_KEY")?)?);
//! let mut pipeline = Pipeline::new(config, client)?;
//! let outcome = pipeline
//!     .run_to_completion("As a shopper I want to save my cart.")
//!     .await?;
//! println!("{}", outcome.artifact);
//! # Ok(())
//! # }
//! ```

use crate::storychain::agent::{Agent, AgentError};
use crate::storychain::client_wrapper::{ClientWrapper, Role};
use crate::storychain::config::{ConfigError, PipelineConfig};
use crate::storychain::display::ColorError;
use crate::storychain::event::{EventHandler, FanOut, PipelineEvent, SkipReason};
use crate::storychain::run::{RunSession, RunStatus};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Label placed between the task template and the seed artifact in the first phase.
pub const STORY_LABEL: &str = "\n\nUser Story:\n";

/// Combine a task template with the current artifact.
///
/// The first phase (index 0) labels the artifact as the user story; later phases append the
/// artifact directly after the template.
///
/// ```
/// use storychain::pipeline::build_task_text;
///
/// assert_eq!(build_task_text(0, "T", "X"), "T\n\nUser Story:\nX");
/// assert_eq!(build_task_text(1, "T", "X"), "TX");
/// ```
pub fn build_task_text(phase: usize, template: &str, artifact: &str) -> String {
    if phase == 0 {
        format!("{}{}{}", template, STORY_LABEL, artifact)
    } else {
        format!("{}{}", template, artifact)
    }
}

/// What a run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The artifact after the last completed step.
    pub artifact: String,
    /// Either [`RunStatus::Completed`] or [`RunStatus::StoppedByUser`].
    pub status: RunStatus,
    /// Number of phases that ran to the end.
    pub phases_completed: usize,
}

#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Color(ColorError),
    /// An agent failed while the run was in progress.
    Generation {
        /// 1-based phase number.
        phase: usize,
        agent: String,
        /// The artifact as it was before the failing step.
        artifact: String,
        source: AgentError,
    },
}

impl PipelineError {
    /// The artifact at the time of failure, when the run had started.
    pub fn last_artifact(&self) -> Option<&str> {
        match self {
            PipelineError::Generation { artifact, .. } => Some(artifact),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(err) => write!(f, "{}", err),
            PipelineError::Color(err) => write!(f, "{}", err),
            PipelineError::Generation {
                phase,
                agent,
                source,
                ..
            } => write!(f, "Phase {}, agent '{}': {}", phase, agent, source),
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineError::Config(err) => Some(err),
            PipelineError::Color(err) => Some(err),
            PipelineError::Generation { source, .. } => Some(source),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}

impl From<ColorError> for PipelineError {
    fn from(err: ColorError) -> Self {
        PipelineError::Color(err)
    }
}

/// Drives the configured agents through every phase.
pub struct Pipeline {
    config: PipelineConfig,
    agents: HashMap<String, Agent>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Pipeline {
    /// Build every configured agent. All of them share `client`.
    ///
    /// When two agents share a name, the first definition wins.
    ///
    /// An agent with `max_history` 0 loses its task message to the trim that precedes every
    /// generation, so it answers from its preamble alone.
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn ClientWrapper>,
    ) -> Result<Self, PipelineError> {
        let mut agents = HashMap::with_capacity(config.agents.len());
        for spec in &config.agents {
            if agents.contains_key(&spec.name) {
                log::warn!(
                    "Pipeline::new(...): duplicate definition of agent '{}' ignored",
                    spec.name
                );
                continue;
            }
            if spec.max_history == 0 && spec.tasks.values().any(|task| !task.is_empty()) {
                log::warn!(
                    "Pipeline::new(...): agent '{}' has tasks but max_history 0; \
                     its task and the user story are trimmed before every request",
                    spec.name
                );
            }
            let agent = Agent::from_spec(spec, &config, client.clone())?;
            agents.insert(spec.name.clone(), agent);
        }
        log::debug!("Pipeline::new(...): built {} agent(s)", agents.len());
        Ok(Pipeline {
            config,
            agents,
            event_handler: None,
        })
    }

    /// Load a configuration file and build the pipeline from it.
    pub fn from_file(
        path: impl AsRef<Path>,
        client: Arc<dyn ClientWrapper>,
    ) -> Result<Self, PipelineError> {
        let config = PipelineConfig::from_file(path)?;
        Self::new(config, client)
    }

    /// Observer for scheduler and agent events, in addition to the run session.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    /// Run every phase with a session that is never cancelled and has no observer.
    pub async fn run_to_completion(
        &mut self,
        seed: impl Into<String>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let session = Arc::new(RunSession::detached());
        self.run(seed, &session).await
    }

    /// Run the schedule, reporting progress to `session` and honoring its cancellation flag.
    pub async fn run(
        &mut self,
        seed: impl Into<String>,
        session: &Arc<RunSession>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut observers = FanOut::default();
        observers.push(session.clone());
        if let Some(handler) = &self.event_handler {
            observers.push(handler.clone());
        }
        let observers: Arc<dyn EventHandler> = Arc::new(observers);
        for agent in self.agents.values_mut() {
            agent.set_event_handler(observers.clone());
        }

        let mut artifact = seed.into();
        let phases = self.config.iterations;
        log::info!(
            "Pipeline::run(...): session {} starting {} phase(s) with {} agent(s)",
            session.id(),
            phases,
            self.agents.len()
        );
        observers
            .on_pipeline_event(&PipelineEvent::RunStarted {
                session_id: session.id().to_string(),
                phases,
                agent_count: self.agents.len(),
            })
            .await;

        let mut phases_completed = 0;
        for phase in 0..phases {
            if session.is_cancelled() {
                return Ok(stopped(&*observers, artifact, phase, phases_completed).await);
            }
            log::debug!("Pipeline::run(...): phase {}", phase + 1);
            observers
                .on_pipeline_event(&PipelineEvent::PhaseStarted { phase: phase + 1 })
                .await;

            for agent_name in &self.config.agent_order {
                if session.is_cancelled() {
                    return Ok(stopped(&*observers, artifact, phase, phases_completed).await);
                }

                let template = match self.config.agent(agent_name) {
                    Some(spec) => spec
                        .task_for_phase(phase)
                        .ok_or(SkipReason::NoTaskForPhase),
                    None => Err(SkipReason::UnknownAgent),
                };
                let (template, agent) = match (template, self.agents.get_mut(agent_name)) {
                    (Ok(template), Some(agent)) => (template, agent),
                    (template, _) => {
                        let reason = template.err().unwrap_or(SkipReason::UnknownAgent);
                        log::debug!(
                            "Pipeline::run(...): skipping '{}' in phase {}: {:?}",
                            agent_name,
                            phase + 1,
                            reason
                        );
                        observers
                            .on_pipeline_event(&PipelineEvent::AgentSkipped {
                                phase: phase + 1,
                                agent_name: agent_name.clone(),
                                reason,
                            })
                            .await;
                        continue;
                    }
                };

                observers
                    .on_pipeline_event(&PipelineEvent::TaskAssigned {
                        phase: phase + 1,
                        agent_name: agent_name.clone(),
                        task_template: template.to_string(),
                    })
                    .await;
                agent.append_message(Role::User, build_task_text(phase, template, &artifact), true);

                let response = match agent.get_full_response("").await {
                    Ok(response) => response,
                    Err(source) => {
                        log::error!(
                            "Pipeline::run(...): '{}' failed in phase {}: {}",
                            agent_name,
                            phase + 1,
                            source
                        );
                        return Err(PipelineError::Generation {
                            phase: phase + 1,
                            agent: agent_name.clone(),
                            artifact,
                            source,
                        });
                    }
                };
                observers
                    .on_pipeline_event(&PipelineEvent::AgentResponded {
                        phase: phase + 1,
                        agent_name: agent_name.clone(),
                        response_length: response.chars().count(),
                    })
                    .await;
                artifact = response;
            }
            phases_completed = phase + 1;
        }

        log::info!(
            "Pipeline::run(...): session {} completed {} phase(s)",
            session.id(),
            phases_completed
        );
        observers
            .on_pipeline_event(&PipelineEvent::RunCompleted { phases_completed })
            .await;
        Ok(PipelineOutcome {
            artifact,
            status: RunStatus::Completed,
            phases_completed,
        })
    }
}

async fn stopped(
    observers: &dyn EventHandler,
    artifact: String,
    phase: usize,
    phases_completed: usize,
) -> PipelineOutcome {
    log::info!("Pipeline::run(...): stopped by user in phase {}", phase + 1);
    observers
        .on_pipeline_event(&PipelineEvent::RunStopped { phase: phase + 1 })
        .await;
    PipelineOutcome {
        artifact,
        status: RunStatus::StoppedByUser,
        phases_completed,
    }
}
