//! Operator command domain.
//!
//! A command is a typed intent with parameters, produced by the
//! natural-language parser and executed by the engine. Commands move
//! through PENDING → EXECUTING → (EXECUTED | FAILED | INVALID) and carry
//! their timing for observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::item::Priority;

pub mod engine;
pub mod parser;

pub use engine::{CommandEngine, CommandOutcome};
pub use parser::{MockParser, ParseError, Parser, RemoteParser};

/// Errors raised by command validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unsupported intent '{0}'")]
    UnsupportedIntent(String),
}

/// Identifier for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse classification of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    QueueModification,
    SystemConfiguration,
    StatusQuery,
    Analytics,
}

/// The supported command intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ChangePriorityByGroup,
    ChangePriorityByAge,
    ShowNext,
    QueueDistribution,
    WaitingItems,
    EnableStarvationMode,
    SetMaxWait,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ChangePriorityByGroup => "change_priority_by_group",
            Intent::ChangePriorityByAge => "change_priority_by_age",
            Intent::ShowNext => "show_next",
            Intent::QueueDistribution => "queue_distribution",
            Intent::WaitingItems => "waiting_items",
            Intent::EnableStarvationMode => "enable_starvation_mode",
            Intent::SetMaxWait => "set_max_wait",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CommandError> {
        match s {
            "change_priority_by_group" => Ok(Intent::ChangePriorityByGroup),
            "change_priority_by_age" => Ok(Intent::ChangePriorityByAge),
            "show_next" => Ok(Intent::ShowNext),
            "queue_distribution" => Ok(Intent::QueueDistribution),
            "waiting_items" => Ok(Intent::WaitingItems),
            "enable_starvation_mode" => Ok(Intent::EnableStarvationMode),
            "set_max_wait" => Ok(Intent::SetMaxWait),
            other => Err(CommandError::UnsupportedIntent(other.to_string())),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Intent::ChangePriorityByGroup | Intent::ChangePriorityByAge => {
                CommandKind::QueueModification
            }
            Intent::ShowNext | Intent::WaitingItems => CommandKind::StatusQuery,
            Intent::QueueDistribution => CommandKind::Analytics,
            Intent::EnableStarvationMode | Intent::SetMaxWait => {
                CommandKind::SystemConfiguration
            }
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executing,
    Executed,
    Failed,
    Invalid,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Executing => "executing",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            CommandStatus::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed operator command with its execution record.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: CommandId,
    pub original_text: String,
    pub intent: Intent,
    pub kind: CommandKind,
    pub parameters: serde_json::Map<String, Value>,
    pub status: CommandStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub execution_time: Option<Duration>,
}

impl Command {
    pub fn new(
        original_text: impl Into<String>,
        intent: Intent,
        parameters: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id: CommandId::new(),
            original_text: original_text.into(),
            intent,
            kind: intent.kind(),
            parameters,
            status: CommandStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            executed_at: None,
            execution_time: None,
        }
    }

    pub fn start_execution(&mut self) {
        self.status = CommandStatus::Executing;
    }

    pub fn complete_execution(&mut self, result: Value) {
        let now = Utc::now();
        self.status = CommandStatus::Executed;
        self.result = Some(result);
        self.executed_at = Some(now);
        self.execution_time = (now - self.created_at).to_std().ok();
    }

    pub fn fail_execution(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = CommandStatus::Failed;
        self.error = Some(error.into());
        self.executed_at = Some(now);
        self.execution_time = (now - self.created_at).to_std().ok();
    }

    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.status = CommandStatus::Invalid;
        self.error = Some(reason.into());
    }

    /// Integer parameter; accepts JSON integers and whole floats.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let value = self.parameters.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
    }

    /// String parameter.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key)?.as_str()
    }

    /// Priority parameter, validated to [1, 5].
    pub fn get_priority(&self, key: &str) -> Option<Priority> {
        Priority::new(self.get_i64(key)?).ok()
    }
}
