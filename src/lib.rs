//! # storychain
//!
//! storychain runs a fixed chain of LLM agents over a user story. Each agent has its own role,
//! its own bounded conversation and its own task for every phase; the story is handed from one
//! agent's reply to the next agent's prompt until the last phase produces the final artifact.
//!
//! The crate provides:
//!
//! * **Agents**: [`Agent`] wraps a [`ClientWrapper`] with a permanent preamble, a rolling
//!   history trimmed before every call, and streamed replies folded back into that history
//! * **Configuration**: [`config::PipelineConfig`] loads and validates the JSON description of
//!   the agents, their colors, their per-phase tasks and the phase count
//! * **Scheduling**: [`Pipeline`] walks phases × `agent_order`, building each task from the
//!   template and the current artifact
//! * **Supervision**: [`run::RunController`] runs one pipeline at a time on a tokio task,
//!   streams [`run::RunMessage`]s to an observer and honors cooperative cancellation
//! * **Presentation**: [`display::ColorConsole`] paints every agent's output in its configured
//!   color through the [`event::EventHandler`] observer interface
//!
//! ## Running a pipeline
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storychain::clients::openai::OpenAIClient;
//! use storychain::config::PipelineConfig;
//! use storychain::display::ColorConsole;
//! use storychain::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     storychain::init_logger();
//!
//!     let config = PipelineConfig::from_file("config/story_pipeline.json")?;
//!     let client = Arc::new(OpenAIClient::new(&std::env::var("OPENAI_API_KEY")?)?);
//!
//!     let mut pipeline =
//!         Pipeline::new(config, client)?.with_event_handler(Arc::new(ColorConsole::stdout()));
//!     let outcome = pipeline
//!         .run_to_completion("As a shopper I want to save my cart for later.")
//!         .await?;
//!
//!     println!("{}", outcome.artifact);
//!     Ok(())
//! }
//! ```
//!
//! ## Supervised runs
//!
//! Interactive front ends use [`run::RunController`] instead: it refuses a second concurrent
//! run, hands back a [`run::RunHandle`] to read progress from and to cancel with, and reports
//! failures as a [`run::RunStatus::Failed`] instead of tearing down the host.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Verbosity follows `RUST_LOG`, e.g. `RUST_LOG=storychain=debug`.
///
/// ```rust
/// storychain::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `storychain` module.
pub mod storychain;

// Re-exporting key items for easier external access.
pub use storychain::agent;
pub use storychain::agent::{Agent, AgentError, ResponseStream};
pub use storychain::client_wrapper;
pub use storychain::client_wrapper::{
    ClientWrapper, GenerationParameters, Message, MessageChunk, MessageChunkStream, Role,
};
pub use storychain::clients;
pub use storychain::config;
pub use storychain::conversation;
pub use storychain::display;
pub use storychain::event;
pub use storychain::event::{AgentEvent, EventHandler, PipelineEvent};
pub use storychain::input;
pub use storychain::pipeline;
pub use storychain::pipeline::{Pipeline, PipelineError, PipelineOutcome};
pub use storychain::run;
pub use storychain::run::{RunController, RunStatus};
