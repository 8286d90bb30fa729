//! Supervised pipeline runs.
//!
//! A [`RunController`] starts at most one pipeline run at a time on a dedicated tokio task and
//! hands the caller a [`RunHandle`]. Everything the run prints (status lines, agent headers,
//! streamed fragments) reaches the observer as ordered [`RunMessage`]s over an unbounded mpsc
//! channel, and the joined plain-text transcript is returned in the final [`RunReport`].
//!
//! The only state shared between the worker and the observer is the [`RunSession`]: a
//! cancellation flag plus the sending half of the channel. Cancellation is advisory and is
//! checked by the scheduler at phase and agent boundaries only.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storychain::clients::openai::OpenAIClient;
//! use storychain::config::PipelineConfig;
//! use storychain::run::RunController;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = Arc::new(OpenAIClient::new(&std::env::var("OPENAI_API_KEY")?)?);
//! let controller = RunController::new(client);
//! let config = PipelineConfig::from_file("config/story_pipeline.json")?;
//!
//! let mut handle = controller.start(config, "As a shopper I want to save my cart.")?;
//! while let Some(message) = handle.next_message().await {
//!     print!("{}", message.colored_text());
//! }
//! let report = handle.wait().await?;
//! println!("{:?}: {}", report.status, report.artifact);
//! # Ok(())
//! # }
//! ```

use crate::storychain::client_wrapper::ClientWrapper;
use crate::storychain::config::PipelineConfig;
use crate::storychain::display::{
    agent_header, render, status_lines, strip_ansi, AgentColor, AGENT_SEPARATOR,
};
use crate::storychain::event::{AgentEvent, EventHandler, PipelineEvent};
use crate::storychain::pipeline::{Pipeline, PipelineError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    StoppedByUser,
    /// A generation failed; carries the error text shown to the observer.
    Failed(String),
}

/// One unit of run output, in the order it was produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunMessage {
    /// An uncolored scheduler line such as `--- Phase 1 ---`.
    Status(String),
    AgentHeader {
        agent_name: String,
        color: Option<AgentColor>,
    },
    Fragment {
        agent_name: String,
        color: Option<AgentColor>,
        text: String,
    },
    /// Blank-line separator after an agent's reply.
    AgentFooter {
        agent_name: String,
        color: Option<AgentColor>,
    },
    /// Last message of every run.
    Finished(RunStatus),
}

impl RunMessage {
    /// The message as it appears in a plain transcript.
    pub fn plain_text(&self) -> String {
        match self {
            RunMessage::Status(line) => format!("{}\n", line),
            RunMessage::AgentHeader { agent_name, .. } => agent_header(agent_name),
            RunMessage::Fragment { text, .. } => text.clone(),
            RunMessage::AgentFooter { .. } => AGENT_SEPARATOR.to_string(),
            RunMessage::Finished(_) => String::new(),
        }
    }

    /// The message painted in its agent's color, for terminals.
    pub fn colored_text(&self) -> String {
        match self {
            RunMessage::AgentHeader { color, .. }
            | RunMessage::Fragment { color, .. }
            | RunMessage::AgentFooter { color, .. } => render(*color, &self.plain_text()),
            RunMessage::Status(_) | RunMessage::Finished(_) => self.plain_text(),
        }
    }
}

/// Shared cancellation flag of one run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles control the same run.
    pub fn same_run(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// State of one run shared between the scheduler and its observer.
///
/// As an [`EventHandler`] it turns scheduler and agent events into [`RunMessage`]s, forwards
/// them to the observer and records them in the transcript.
pub struct RunSession {
    id: String,
    cancel: CancelHandle,
    outbox: Option<mpsc::UnboundedSender<RunMessage>>,
    transcript: Mutex<String>,
}

impl RunSession {
    pub fn new(outbox: mpsc::UnboundedSender<RunMessage>) -> Self {
        RunSession {
            outbox: Some(outbox),
            ..Self::detached()
        }
    }

    /// A session without an observer. Messages only go to the transcript.
    pub fn detached() -> Self {
        RunSession {
            id: uuid::Uuid::new_v4().to_string(),
            cancel: CancelHandle::new(),
            outbox: None,
            transcript: Mutex::new(String::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record `message` and forward it to the observer, if one is still listening.
    pub fn send(&self, message: RunMessage) {
        {
            let mut transcript = match self.transcript.lock() {
                Ok(transcript) => transcript,
                Err(poisoned) => poisoned.into_inner(),
            };
            transcript.push_str(&strip_ansi(&message.plain_text()));
        }
        if let Some(outbox) = &self.outbox {
            if outbox.send(message).is_err() {
                log::debug!("RunSession::send(...): observer of {} is gone", self.id);
            }
        }
    }

    pub fn status(&self, line: impl Into<String>) {
        self.send(RunMessage::Status(line.into()));
    }

    /// Everything sent so far, without escape codes.
    pub fn transcript(&self) -> String {
        match self.transcript.lock() {
            Ok(transcript) => transcript.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EventHandler for RunSession {
    async fn on_agent_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::GenerationStarted { agent_name, color } => {
                self.send(RunMessage::AgentHeader {
                    agent_name: agent_name.clone(),
                    color: *color,
                })
            }
            AgentEvent::FragmentReceived {
                agent_name,
                color,
                fragment,
            } => self.send(RunMessage::Fragment {
                agent_name: agent_name.clone(),
                color: *color,
                text: fragment.clone(),
            }),
            AgentEvent::GenerationCompleted {
                agent_name, color, ..
            } => self.send(RunMessage::AgentFooter {
                agent_name: agent_name.clone(),
                color: *color,
            }),
            // reported by the controller once the pipeline returns
            AgentEvent::GenerationFailed { .. } => {}
        }
    }

    async fn on_pipeline_event(&self, event: &PipelineEvent) {
        for line in status_lines(event) {
            self.status(line);
        }
    }
}

/// Summary of a finished run, serializable for front ends.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub status: RunStatus,
    /// The artifact after the last completed step.
    pub artifact: String,
    pub transcript: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RunError {
    /// The controller already supervises an unfinished run.
    AlreadyRunning,
    /// The pipeline could not be built from the configuration.
    Pipeline(PipelineError),
    /// The worker task panicked or was aborted.
    Worker(String),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::AlreadyRunning => write!(f, "A pipeline run is already in progress"),
            RunError::Pipeline(err) => write!(f, "Could not start the pipeline: {}", err),
            RunError::Worker(reason) => write!(f, "Pipeline worker failed: {}", reason),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunError::Pipeline(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PipelineError> for RunError {
    fn from(err: PipelineError) -> Self {
        RunError::Pipeline(err)
    }
}

/// Caller's side of a started run.
pub struct RunHandle {
    session_id: String,
    messages: mpsc::UnboundedReceiver<RunMessage>,
    cancel: CancelHandle,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next message of the run, or `None` once the run has finished and every message was read.
    pub async fn next_message(&mut self) -> Option<RunMessage> {
        self.messages.recv().await
    }

    /// Ask the run to stop at the next phase or agent boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the worker to finish. Unread messages are discarded.
    pub async fn wait(self) -> Result<RunReport, RunError> {
        self.join
            .await
            .map_err(|err| RunError::Worker(err.to_string()))
    }

    /// Read every remaining message, then wait for the worker.
    pub async fn collect(mut self) -> (Vec<RunMessage>, Result<RunReport, RunError>) {
        let mut messages = Vec::new();
        while let Some(message) = self.messages.recv().await {
            messages.push(message);
        }
        let report = self.wait().await;
        (messages, report)
    }
}

/// Starts pipeline runs, one at a time.
pub struct RunController {
    client: Arc<dyn ClientWrapper>,
    event_handler: Option<Arc<dyn EventHandler>>,
    active: Arc<Mutex<Option<CancelHandle>>>,
}

impl RunController {
    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        RunController {
            client,
            event_handler: None,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Extra observer attached to every pipeline this controller starts.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Build the pipeline and run it on a new tokio task.
    ///
    /// Fails with [`RunError::AlreadyRunning`] while a previous run is unfinished, and with
    /// [`RunError::Pipeline`] when an agent cannot be built. Must be called inside a tokio
    /// runtime.
    pub fn start(
        &self,
        config: PipelineConfig,
        seed: impl Into<String>,
    ) -> Result<RunHandle, RunError> {
        let mut active = lock(&self.active);
        if active.is_some() {
            log::warn!("RunController::start(...): a run is already in progress");
            return Err(RunError::AlreadyRunning);
        }

        let mut pipeline = Pipeline::new(config, self.client.clone())?;
        if let Some(handler) = &self.event_handler {
            pipeline = pipeline.with_event_handler(handler.clone());
        }

        let (outbox, messages) = mpsc::unbounded_channel();
        let session = Arc::new(RunSession::new(outbox));
        let session_id = session.id().to_string();
        let cancel = session.cancel_handle();
        *active = Some(cancel.clone());
        drop(active);

        log::info!("RunController::start(...): starting session {}", session_id);
        let seed = seed.into();
        let active_run = ActiveRun {
            slot: self.active.clone(),
            cancel: cancel.clone(),
        };
        let started_at = Utc::now();
        let join = tokio::spawn(async move {
            let (status, artifact) = match pipeline.run(seed, &session).await {
                Ok(outcome) => (outcome.status, outcome.artifact),
                Err(err) => {
                    log::error!("RunController: session {} failed: {}", session.id(), err);
                    session.status(format!("Error in pipeline run: {}", err));
                    let artifact = err.last_artifact().unwrap_or_default().to_string();
                    (RunStatus::Failed(err.to_string()), artifact)
                }
            };
            drop(pipeline);
            drop(active_run);
            session.send(RunMessage::Finished(status.clone()));

            RunReport {
                session_id: session.id().to_string(),
                status,
                artifact,
                transcript: session.transcript(),
                started_at,
                finished_at: Utc::now(),
            }
        });

        Ok(RunHandle {
            session_id,
            messages,
            cancel,
            join,
        })
    }

    /// Flag the active run for cancellation. Returns `false` when nothing is running.
    pub fn stop(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(cancel) => {
                log::info!("RunController::stop(): cancellation requested");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }
}

/// Holds the controller's active-run slot for one worker. Dropping it frees the slot, also when
/// the worker unwinds from a panic.
struct ActiveRun {
    slot: Arc<Mutex<Option<CancelHandle>>>,
    cancel: CancelHandle,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut active = lock(&self.slot);
        if active
            .as_ref()
            .map_or(false, |handle| handle.same_run(&self.cancel))
        {
            *active = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_colored_text() {
        let header = RunMessage::AgentHeader {
            agent_name: "Critic".into(),
            color: Some(AgentColor::Red),
        };
        assert_eq!(header.plain_text(), "### Critic ###\n");
        assert_eq!(strip_ansi(&header.colored_text()), header.plain_text());

        let status = RunMessage::Status("--- Phase 1 ---".into());
        assert_eq!(status.colored_text(), "--- Phase 1 ---\n");
        assert_eq!(RunMessage::Finished(RunStatus::Completed).plain_text(), "");
    }

    #[test]
    fn test_session_records_transcript_and_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = RunSession::new(tx);
        session.status("--- Phase 1 ---");
        session.send(RunMessage::Fragment {
            agent_name: "PO".into(),
            color: None,
            text: "\u{1b}[31mred\u{1b}[0m words".into(),
        });

        assert_eq!(session.transcript(), "--- Phase 1 ---\nred words");
        assert_eq!(rx.try_recv().unwrap(), RunMessage::Status("--- Phase 1 ---".into()));
        assert!(matches!(rx.try_recv().unwrap(), RunMessage::Fragment { .. }));
    }

    #[test]
    fn test_cancel_handles_share_one_flag() {
        let session = RunSession::detached();
        let handle = session.cancel_handle();
        assert!(!session.is_cancelled());
        handle.cancel();
        assert!(session.is_cancelled());
        assert!(handle.same_run(&session.cancel_handle()));
        assert!(!handle.same_run(&CancelHandle::new()));
    }
}
