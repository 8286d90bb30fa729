//! Pipeline configuration.
//!
//! A pipeline is described by a JSON document:
//!
//! ```json
//! {
//!   "openai_model": "gpt-4",
//!   "max_tokens_per_call": 3000,
//!   "iterations": 2,
//!   "agent_order": ["ProductOwner", "Critic"],
//!   "agents": [
//!     {
//!       "name": "ProductOwner",
//!       "color": "BLUE",
//!       "temperature": 0.2,
//!       "max_history": 4,
//!       "system": "You are a product owner.",
//!       "user": "Write crisp user stories.",
//!       "tasks": { "1": "Refine the story.", "2": "Add acceptance criteria." }
//!     }
//!   ]
//! }
//! ```
//!
//! Loading is two-staged so a missing field is reported by name before anything else
//! happens: the document is first parsed into a [`serde_json::Value`] and checked against
//! [`REQUIRED_CONFIG_FIELDS`] and [`REQUIRED_AGENT_FIELDS`], then deserialized into the typed
//! [`PipelineConfig`]. Each known field is deserialized on its own first, so a value of the
//! wrong type is reported with its field name and agent.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Top-level fields every configuration must define.
pub const REQUIRED_CONFIG_FIELDS: [&str; 4] =
    ["agent_order", "agents", "max_tokens_per_call", "openai_model"];

/// Fields every entry of `agents` must define.
pub const REQUIRED_AGENT_FIELDS: [&str; 6] = [
    "name",
    "temperature",
    "color",
    "max_history",
    "system",
    "user",
];

fn default_iterations() -> usize {
    1
}

fn default_top_p() -> f32 {
    1.0
}

/// The whole pipeline: which agents exist, the order they act in, and how many phases run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Agent names in the order they act within a phase. Names may repeat.
    pub agent_order: Vec<String>,
    pub agents: Vec<AgentSpec>,
    pub max_tokens_per_call: u32,
    pub openai_model: String,
    /// Number of phases to run.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

/// One agent's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub temperature: f32,
    /// Palette name, see [`AgentColor`](crate::display::AgentColor).
    pub color: String,
    /// History bound enforced before every generation.
    pub max_history: usize,
    /// Permanent system message.
    pub system: String,
    /// Permanent seed user message.
    pub user: String,
    /// Task templates keyed by 1-based phase number (`"1"`, `"2"`, ...).
    #[serde(default)]
    pub tasks: BTreeMap<String, String>,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl AgentSpec {
    /// Task template for a 0-based phase index, if the agent acts in that phase.
    ///
    /// Empty templates count as absent.
    pub fn task_for_phase(&self, phase: usize) -> Option<&str> {
        self.tasks
            .get(&(phase + 1).to_string())
            .map(String::as_str)
            .filter(|template| !template.is_empty())
    }
}

/// Where a required field was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLocation {
    TopLevel,
    /// Entry of the `agents` array, 0-based.
    Agent { index: usize },
}

/// Errors raised while reading or validating a configuration document.
#[derive(Debug)]
pub enum ConfigError {
    NotFound {
        path: PathBuf,
    },
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// The document is not valid JSON.
    Malformed {
        path: Option<PathBuf>,
        source: serde_json::Error,
    },
    MissingField {
        field: String,
        location: FieldLocation,
    },
    /// A field is present but has the wrong shape or type.
    InvalidField {
        field: String,
        location: FieldLocation,
        reason: String,
    },
}

impl ConfigError {
    /// Name of the offending field, for missing or invalid fields.
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::MissingField { field, .. } | ConfigError::InvalidField { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }

    /// Where the offending field sits, for missing or invalid fields.
    pub fn location(&self) -> Option<FieldLocation> {
        match self {
            ConfigError::MissingField { location, .. }
            | ConfigError::InvalidField { location, .. } => Some(*location),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NotFound { path } => write!(f, "File '{}' not found", path.display()),
            ConfigError::Io { path, source } => {
                write!(f, "An error occurred while reading '{}': {}", path.display(), source)
            }
            ConfigError::Malformed {
                path: Some(path),
                source,
            } => write!(f, "Invalid JSON format in '{}': {}", path.display(), source),
            ConfigError::Malformed { path: None, source } => {
                write!(f, "Invalid JSON format: {}", source)
            }
            ConfigError::MissingField {
                field,
                location: FieldLocation::TopLevel,
            } => write!(
                f,
                "'{}' is missing in the main JSON configuration file",
                field
            ),
            ConfigError::MissingField {
                field,
                location: FieldLocation::Agent { index },
            } => write!(
                f,
                "'{}' is missing in agent #{} of the JSON configuration file",
                field,
                index + 1
            ),
            ConfigError::InvalidField {
                field,
                location: FieldLocation::TopLevel,
                reason,
            } => write!(f, "'{}' is invalid: {}", field, reason),
            ConfigError::InvalidField {
                field,
                location: FieldLocation::Agent { index },
                reason,
            } => write!(
                f,
                "'{}' is invalid in agent #{}: {}",
                field,
                index + 1,
                reason
            ),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Malformed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl PipelineConfig {
    /// Read, validate and deserialize a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::debug!("Reading configuration file {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let value: Value =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Malformed {
                path: Some(path.to_path_buf()),
                source,
            })?;
        let config = Self::from_value(value)?;
        log::info!("Successfully read configuration file {}", path.display());
        Ok(config)
    }

    /// Validate and deserialize a configuration held in memory.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|source| ConfigError::Malformed { path: None, source })?;
        Self::from_value(value)
    }

    /// Validate a parsed document, then convert it into a typed configuration.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        Self::validate_value(&value)?;
        Self::check_field_types(&value)?;
        serde_json::from_value(value).map_err(|source| ConfigError::InvalidField {
            field: "<root>".to_string(),
            location: FieldLocation::TopLevel,
            reason: source.to_string(),
        })
    }

    /// Deserialize every known field on its own so a type error names the field it came from.
    fn check_field_types(value: &Value) -> Result<(), ConfigError> {
        let location = FieldLocation::TopLevel;
        check_field::<Vec<String>>(value, "agent_order", location)?;
        check_field::<u32>(value, "max_tokens_per_call", location)?;
        check_field::<String>(value, "openai_model", location)?;
        check_field::<usize>(value, "iterations", location)?;

        let agents = value.get("agents").and_then(Value::as_array);
        for (index, agent) in agents.into_iter().flatten().enumerate() {
            let location = FieldLocation::Agent { index };
            for field in ["name", "color", "system", "user"].iter() {
                check_field::<String>(agent, field, location)?;
            }
            check_field::<f32>(agent, "temperature", location)?;
            check_field::<f32>(agent, "top_p", location)?;
            check_field::<usize>(agent, "max_history", location)?;
            check_field::<BTreeMap<String, String>>(agent, "tasks", location)?;
        }
        Ok(())
    }

    /// Check that every required field is present, top level first, then each agent in order.
    pub fn validate_value(value: &Value) -> Result<(), ConfigError> {
        let root = value.as_object().ok_or_else(|| ConfigError::InvalidField {
            field: "<root>".to_string(),
            location: FieldLocation::TopLevel,
            reason: "the configuration must be a JSON object".to_string(),
        })?;

        for field in REQUIRED_CONFIG_FIELDS.iter() {
            if !root.contains_key(*field) {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                    location: FieldLocation::TopLevel,
                });
            }
        }

        let agents = root
            .get("agents")
            .and_then(Value::as_array)
            .ok_or_else(|| ConfigError::InvalidField {
                field: "agents".to_string(),
                location: FieldLocation::TopLevel,
                reason: "expected an array of agent objects".to_string(),
            })?;

        for (index, agent) in agents.iter().enumerate() {
            for field in REQUIRED_AGENT_FIELDS.iter() {
                if agent.get(*field).is_none() {
                    return Err(ConfigError::MissingField {
                        field: field.to_string(),
                        location: FieldLocation::Agent { index },
                    });
                }
            }
        }
        Ok(())
    }

    /// The first agent definition with this name.
    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|agent| agent.name == name)
    }
}

/// Deserialize `object[field]` as `T` when present. Absent fields are left to the defaults.
fn check_field<T: DeserializeOwned>(
    object: &Value,
    field: &str,
    location: FieldLocation,
) -> Result<(), ConfigError> {
    match object.get(field) {
        Some(raw) => T::deserialize(raw)
            .map(|_| ())
            .map_err(|source| ConfigError::InvalidField {
                field: field.to_string(),
                location,
                reason: source.to_string(),
            }),
        None => Ok(()),
    }
}
