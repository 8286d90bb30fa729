//! Terminal presentation for agents.
//!
//! Agents carry an optional [`AgentColor`] as display metadata. Nothing in this module touches
//! an agent's history: colors are applied only to rendered output, either by the
//! [`ColorConsole`] event handler or by
//! [`RunMessage::colored_text`](crate::run::RunMessage::colored_text).

use crate::storychain::event::{AgentEvent, EventHandler, PipelineEvent};
use async_trait::async_trait;
use crossterm::style::{style, Color, Stylize};
use lazy_static::lazy_static;
use regex::Regex;
use std::error::Error;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::Mutex;

/// Dashed line printed before every task assignment.
pub const TASK_SEPARATOR: &str = "-------------------------------";

/// Trailing separator written after an agent finishes its reply.
pub const AGENT_SEPARATOR: &str = "\n\n";

/// The supported agent colors, named as they appear in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentColor {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Cyan,
    White,
    Reset,
    LightBlack,
    LightRed,
    LightGreen,
    LightYellow,
    LightBlue,
    LightMagenta,
    LightCyan,
    LightWhite,
}

const PALETTE: [(&str, AgentColor); 16] = [
    ("BLACK", AgentColor::Black),
    ("RED", AgentColor::Red),
    ("GREEN", AgentColor::Green),
    ("YELLOW", AgentColor::Yellow),
    ("BLUE", AgentColor::Blue),
    ("CYAN", AgentColor::Cyan),
    ("WHITE", AgentColor::White),
    ("RESET", AgentColor::Reset),
    ("LIGHTBLACK_EX", AgentColor::LightBlack),
    ("LIGHTRED_EX", AgentColor::LightRed),
    ("LIGHTGREEN_EX", AgentColor::LightGreen),
    ("LIGHTYELLOW_EX", AgentColor::LightYellow),
    ("LIGHTBLUE_EX", AgentColor::LightBlue),
    ("LIGHTMAGENTA_EX", AgentColor::LightMagenta),
    ("LIGHTCYAN_EX", AgentColor::LightCyan),
    ("LIGHTWHITE_EX", AgentColor::LightWhite),
];

impl AgentColor {
    /// Every configuration name accepted by [`AgentColor::from_str`].
    pub fn names() -> impl Iterator<Item = &'static str> {
        PALETTE.iter().map(|(name, _)| *name)
    }

    /// The configuration name of this color.
    pub fn name(&self) -> &'static str {
        PALETTE
            .iter()
            .find(|(_, color)| color == self)
            .map(|(name, _)| *name)
            .unwrap_or("RESET")
    }

    fn terminal_color(&self) -> Color {
        match self {
            AgentColor::Black => Color::Black,
            AgentColor::Red => Color::DarkRed,
            AgentColor::Green => Color::DarkGreen,
            AgentColor::Yellow => Color::DarkYellow,
            AgentColor::Blue => Color::DarkBlue,
            AgentColor::Cyan => Color::DarkCyan,
            AgentColor::White => Color::Grey,
            AgentColor::Reset => Color::Reset,
            AgentColor::LightBlack => Color::DarkGrey,
            AgentColor::LightRed => Color::Red,
            AgentColor::LightGreen => Color::Green,
            AgentColor::LightYellow => Color::Yellow,
            AgentColor::LightBlue => Color::Blue,
            AgentColor::LightMagenta => Color::Magenta,
            AgentColor::LightCyan => Color::Cyan,
            AgentColor::LightWhite => Color::White,
        }
    }

    /// Wrap `text` in this color's escape sequences.
    pub fn paint(&self, text: &str) -> String {
        style(text).with(self.terminal_color()).to_string()
    }
}

impl FromStr for AgentColor {
    type Err = ColorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        PALETTE
            .iter()
            .find(|(name, _)| *name == value)
            .map(|(_, color)| *color)
            .ok_or_else(|| ColorError::InvalidColor {
                agent: None,
                color: value.to_string(),
            })
    }
}

impl fmt::Display for AgentColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An agent color outside the supported palette.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorError {
    InvalidColor {
        /// Name of the agent being built, when known.
        agent: Option<String>,
        color: String,
    },
}

impl ColorError {
    /// Attach the offending agent's name to the error.
    pub fn for_agent(self, name: &str) -> Self {
        match self {
            ColorError::InvalidColor { color, .. } => ColorError::InvalidColor {
                agent: Some(name.to_string()),
                color,
            },
        }
    }
}

impl fmt::Display for ColorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorError::InvalidColor {
                agent: Some(agent),
                color,
            } => write!(f, "Agent '{}' has an invalid color: {}", agent, color),
            ColorError::InvalidColor { agent: None, color } => {
                write!(f, "Invalid color: {}", color)
            }
        }
    }
}

impl Error for ColorError {}

/// Paint `text` when a color is set, return it untouched otherwise.
pub fn render(color: Option<AgentColor>, text: &str) -> String {
    match color {
        Some(color) => color.paint(text),
        None => text.to_string(),
    }
}

/// Header line introducing an agent's reply, newline included.
pub fn agent_header(agent_name: &str) -> String {
    format!("### {} ###\n", agent_name)
}

/// Plain status lines for a scheduler event, without trailing newlines.
pub fn status_lines(event: &PipelineEvent) -> Vec<String> {
    match event {
        PipelineEvent::PhaseStarted { phase } => vec![format!("--- Phase {} ---", phase)],
        PipelineEvent::TaskAssigned {
            agent_name,
            task_template,
            ..
        } => vec![
            TASK_SEPARATOR.to_string(),
            format!("Assigning task to {}: {}", agent_name, task_template),
        ],
        PipelineEvent::RunCompleted { .. } => vec!["Processing complete.".to_string()],
        PipelineEvent::RunStopped { .. } => {
            vec!["Processing stopped by user request.".to_string()]
        }
        PipelineEvent::RunStarted { .. }
        | PipelineEvent::AgentSkipped { .. }
        | PipelineEvent::AgentResponded { .. } => Vec::new(),
    }
}

lazy_static! {
    /// CSI sequences and two-byte escapes.
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap();
}

/// Remove ANSI escape sequences (CSI and two-byte escapes) from `text`.
///
/// ```
/// use storychain::display::strip_ansi;
///
/// assert_eq!(strip_ansi("\u{1b}[38;5;9mhello\u{1b}[39m"), "hello");
/// ```
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Event handler that renders agent output in each agent's color.
///
/// Status lines from the scheduler are written uncolored. Writes are flushed after every
/// event so fragments appear as they stream in.
pub struct ColorConsole {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ColorConsole {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        ColorConsole {
            out: Mutex::new(out),
        }
    }

    fn write(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            log::warn!("ColorConsole::write(...): failed to write output: {}", err);
        }
    }
}

#[async_trait]
impl EventHandler for ColorConsole {
    async fn on_agent_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::GenerationStarted { agent_name, color } => {
                self.write(&render(*color, &agent_header(agent_name)))
            }
            AgentEvent::FragmentReceived {
                color, fragment, ..
            } => self.write(&render(*color, fragment)),
            AgentEvent::GenerationCompleted { color, .. } => {
                self.write(&render(*color, AGENT_SEPARATOR))
            }
            AgentEvent::GenerationFailed { .. } => {}
        }
    }

    async fn on_pipeline_event(&self, event: &PipelineEvent) {
        for line in status_lines(event) {
            self.write(&format!("{}\n", line));
        }
    }
}
