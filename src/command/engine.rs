//! Command validation and execution.
//!
//! Takes the raw operator text through parse → validate → execute, records
//! the lifecycle on the command, and keeps a bounded in-memory ring of
//! recent commands for observability. Every path yields a
//! [`CommandOutcome`]; errors are reported in the outcome's status rather
//! than thrown to the caller.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bulk::{BulkError, BulkMutator, Selector};
use crate::config::{ConfigError, ConfigStore};
use crate::metrics::MetricsSink;
use crate::service::{ItemService, ServiceError};

use super::{Command, CommandError, CommandId, CommandStatus, Intent};

/// Number of recent commands retained for observability.
const RECENT_CAPACITY: usize = 100;

#[derive(Debug, Error)]
enum ExecError {
    #[error(transparent)]
    Bulk(#[from] BulkError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

fn required_priority(command: &Command, key: &str) -> Result<crate::item::Priority, ExecError> {
    command
        .get_priority(key)
        .ok_or_else(|| CommandError::MissingParameter(key.to_string()).into())
}

fn required_i64(command: &Command, key: &str) -> Result<i64, ExecError> {
    command
        .get_i64(key)
        .ok_or_else(|| CommandError::MissingParameter(key.to_string()).into())
}

/// What the caller gets back for every submitted command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command_id: CommandId,
    pub status: CommandStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time: Option<Duration>,
}

impl CommandOutcome {
    fn from_command(command: &Command) -> Self {
        Self {
            command_id: command.id,
            status: command.status,
            result: command.result.clone(),
            error: command.error.clone(),
            execution_time: command.execution_time,
        }
    }
}

/// Executes validated commands against the queue, the store, the bulk
/// mutator, and the config store.
pub struct CommandEngine {
    parser: super::Parser,
    service: ItemService,
    bulk: BulkMutator,
    config: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    recent: Mutex<VecDeque<Command>>,
}

impl CommandEngine {
    pub fn new(
        parser: super::Parser,
        service: ItemService,
        bulk: BulkMutator,
        config: Arc<ConfigStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            parser,
            service,
            bulk,
            config,
            metrics,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    /// Parses and executes one operator command. Never returns an error;
    /// failures surface in the outcome's status and error fields.
    pub async fn execute_text(&self, token: &CancellationToken, text: &str) -> CommandOutcome {
        let mut command = match self.parser.parse(text).await {
            Ok(command) => command,
            Err(e) => {
                self.metrics.record_command("unparsed", "invalid");
                warn!(text = text, error = %e, "Command could not be parsed");
                return CommandOutcome {
                    command_id: CommandId::new(),
                    status: CommandStatus::Invalid,
                    result: None,
                    error: Some(e.to_string()),
                    execution_time: None,
                };
            }
        };

        if let Err(e) = validate(&command) {
            command.mark_invalid(e.to_string());
            self.metrics
                .record_command(command.intent.as_str(), command.status.as_str());
            self.remember(command.clone()).await;
            return CommandOutcome::from_command(&command);
        }

        command.start_execution();
        match self.dispatch(token, &command).await {
            Ok(result) => command.complete_execution(result),
            Err(e) => command.fail_execution(e.to_string()),
        }

        self.metrics
            .record_command(command.intent.as_str(), command.status.as_str());
        info!(
            command_id = %command.id,
            intent = %command.intent,
            status = %command.status,
            "Command finished"
        );

        self.remember(command.clone()).await;
        CommandOutcome::from_command(&command)
    }

    /// The most recent commands, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<Command> {
        let recent = self.recent.lock().await;
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Looks up a recent command by its id string.
    pub async fn find(&self, id: &str) -> Option<Command> {
        let id = CommandId::parse(id).ok()?;
        let recent = self.recent.lock().await;
        recent.iter().find(|command| command.id == id).cloned()
    }

    async fn remember(&self, command: Command) {
        let mut recent = self.recent.lock().await;
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(command);
    }

    async fn dispatch(
        &self,
        token: &CancellationToken,
        command: &Command,
    ) -> Result<Value, ExecError> {
        match command.intent {
            Intent::ChangePriorityByGroup => {
                let priority = required_priority(command, "priority")?;
                let group = command
                    .get_str("group")
                    .ok_or(CommandError::MissingParameter("group".to_string()))?
                    .to_string();

                let outcome = self
                    .bulk
                    .rewrite(token, Selector::ByGroup(group.clone()), priority)
                    .await?;

                Ok(json!({
                    "itemsModified": outcome.affected,
                    "queueUpdateFailures": outcome.queue_update_failures,
                    "group": group,
                    "newPriority": priority.level(),
                    "message": format!(
                        "Updated priority to {} for {} items in the {} group",
                        priority, outcome.affected, group
                    ),
                }))
            }

            Intent::ChangePriorityByAge => {
                let priority = required_priority(command, "priority")?;
                let minutes = required_i64(command, "minutes")?;

                let outcome = self
                    .bulk
                    .rewrite(
                        token,
                        Selector::ByAge(Duration::from_secs(minutes as u64 * 60)),
                        priority,
                    )
                    .await?;

                Ok(json!({
                    "itemsModified": outcome.affected,
                    "queueUpdateFailures": outcome.queue_update_failures,
                    "olderThanMinutes": minutes,
                    "newPriority": priority.level(),
                    "message": format!(
                        "Updated priority to {} for {} items older than {} minutes",
                        priority, outcome.affected, minutes
                    ),
                }))
            }

            Intent::ShowNext => {
                let count = required_i64(command, "count")? as usize;
                let entries = self.service.next_items(token, count).await?;

                let listing: Vec<Value> = entries
                    .iter()
                    .enumerate()
                    .map(|(index, entry)| {
                        json!({
                            "itemId": entry.id.to_string(),
                            "priority": entry.priority.level(),
                            "position": index + 1,
                        })
                    })
                    .collect();

                Ok(json!({
                    "nextItems": listing,
                    "count": entries.len(),
                    "message": format!("Next {} items to be processed", entries.len()),
                }))
            }

            Intent::QueueDistribution => {
                let stats = self.service.queue_stats(token).await?;

                let mut distribution = serde_json::Map::new();
                for (priority, count) in &stats.distribution {
                    distribution.insert(format!("priority_{}", priority), json!(count));
                }

                Ok(json!({
                    "distribution": distribution,
                    "total": stats.total,
                    "message": format!(
                        "Current queue has {} items across all priorities",
                        stats.total
                    ),
                }))
            }

            Intent::WaitingItems => {
                let minutes = required_i64(command, "minutes")?;
                let items = self
                    .service
                    .waiting_items(token, Duration::from_secs(minutes as u64 * 60))
                    .await?;

                let listing: Vec<Value> = items
                    .iter()
                    .map(|item| {
                        json!({
                            "itemId": item.id.to_string(),
                            "title": item.title,
                            "group": item.group,
                            "priority": item.priority.level(),
                            "status": item.status.as_str(),
                            "waitTimeSeconds": item.wait_time().as_secs(),
                        })
                    })
                    .collect();

                Ok(json!({
                    "waitingItems": listing,
                    "count": items.len(),
                    "waitTimeMinutes": minutes,
                    "message": format!(
                        "Found {} items waiting longer than {} minutes",
                        items.len(),
                        minutes
                    ),
                }))
            }

            Intent::EnableStarvationMode => {
                // "Starvation mode" means starvation is permitted: the
                // anti-starvation daemon is turned OFF.
                self.config.set_anti_starvation(false).await?;

                Ok(json!({
                    "starvationMode": "enabled",
                    "message": "Anti-starvation mechanism has been disabled (starvation mode enabled)",
                    "warning": "Low-priority items may now wait indefinitely",
                }))
            }

            Intent::SetMaxWait => {
                let seconds = required_i64(command, "seconds")? as u64;
                self.config
                    .set_max_wait(Duration::from_secs(seconds))
                    .await?;

                Ok(json!({
                    "maxWaitSeconds": seconds,
                    "message": format!("Maximum wait time updated to {} seconds", seconds),
                }))
            }
        }
    }
}

/// Checks that a command carries the parameters its intent requires.
fn validate(command: &Command) -> Result<(), CommandError> {
    let require_priority = |key: &str| -> Result<(), CommandError> {
        match command.parameters.get(key) {
            None => Err(CommandError::MissingParameter(key.to_string())),
            Some(_) => match command.get_priority(key) {
                Some(_) => Ok(()),
                None => Err(CommandError::InvalidParameter {
                    name: key.to_string(),
                    reason: "must be an integer between 1 and 5".to_string(),
                }),
            },
        }
    };

    let require_int = |key: &str, minimum: i64| -> Result<(), CommandError> {
        match command.parameters.get(key) {
            None => Err(CommandError::MissingParameter(key.to_string())),
            Some(_) => match command.get_i64(key) {
                Some(value) if value >= minimum => Ok(()),
                Some(_) => Err(CommandError::InvalidParameter {
                    name: key.to_string(),
                    reason: format!("must be an integer >= {minimum}"),
                }),
                None => Err(CommandError::InvalidParameter {
                    name: key.to_string(),
                    reason: "must be an integer".to_string(),
                }),
            },
        }
    };

    match command.intent {
        Intent::ChangePriorityByGroup => {
            require_priority("priority")?;
            match command.get_str("group") {
                Some(group) if !group.is_empty() => Ok(()),
                Some(_) => Err(CommandError::InvalidParameter {
                    name: "group".to_string(),
                    reason: "must be a non-empty string".to_string(),
                }),
                None => Err(CommandError::MissingParameter("group".to_string())),
            }
        }
        Intent::ChangePriorityByAge => {
            require_priority("priority")?;
            require_int("minutes", 0)
        }
        Intent::ShowNext => require_int("count", 1),
        Intent::QueueDistribution => Ok(()),
        Intent::WaitingItems => require_int("minutes", 0),
        Intent::EnableStarvationMode => Ok(()),
        Intent::SetMaxWait => require_int("seconds", 1),
    }
}
