//! Command-line interface and process wiring.
//!
//! Three subcommands:
//!
//! - `process`: run the queue processor (worker pool + anti-starvation
//!   daemon) until SIGINT/SIGTERM.
//! - `command`: execute one natural-language operator command and print
//!   the outcome.
//! - `migrate`: apply the item-store schema and exit.

use anyhow::Context;
use clap::Subcommand;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bulk::BulkMutator;
use crate::command::{CommandEngine, MockParser, Parser as CommandParser, RemoteParser};
use crate::config::{AppConfig, ConfigStore};
use crate::item::{ItemStore, PostgresItemStore};
use crate::metrics::{init_metrics, MetricsSink, PrometheusSink};
use crate::queue::{PriorityQueue, QueueBackend, RedisQueueBackend, StarvationDaemon};
use crate::service::ItemService;
use crate::worker::WorkerPool;

/// Top-level CLI arguments.
#[derive(Debug, clap::Parser)]
#[command(name = "adqueue", version, about = "Distributed priority queue for ad processing")]
pub struct Cli {
    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the queue processor until interrupted.
    Process,
    /// Execute one operator command and print the outcome.
    Command {
        /// The natural-language command text.
        text: String,
    },
    /// Apply the item-store schema and exit.
    Migrate,
}

/// Parses the CLI arguments.
pub fn parse_cli() -> Cli {
    <Cli as clap::Parser>::parse()
}

/// Runs the selected subcommand.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Process => run_processor().await,
        Commands::Command { text } => run_command(&text).await,
        Commands::Migrate => run_migrations().await,
    }
}

/// Everything the subcommands need, wired once.
struct Runtime {
    store: Arc<dyn ItemStore>,
    queue: PriorityQueue,
    config: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    parser: CommandParser,
}

async fn build_runtime() -> anyhow::Result<Runtime> {
    let app_config = AppConfig::from_env().context("failed to load configuration")?;

    let store: Arc<dyn ItemStore> = Arc::new(
        PostgresItemStore::connect(&app_config.database_url)
            .await
            .context("failed to connect to the item store")?,
    );

    let backend: Arc<dyn QueueBackend> = Arc::new(
        RedisQueueBackend::connect(&app_config.redis_url)
            .await
            .context("failed to connect to the queue backend")?,
    );

    let queue = PriorityQueue::new(Arc::clone(&backend), app_config.queue.shard_count);
    let config = Arc::new(ConfigStore::new(backend, app_config.queue.clone()));
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusSink::new());

    let parser = match (&app_config.parser_api_key, &app_config.parser_endpoint) {
        (Some(key), Some(endpoint)) => {
            info!(endpoint = %endpoint, "Using remote command parser");
            CommandParser::Remote(RemoteParser::new(key.clone(), endpoint.clone()))
        }
        _ => {
            info!("Using mock command parser");
            CommandParser::Mock(MockParser::new())
        }
    };

    Ok(Runtime {
        store,
        queue,
        config,
        metrics,
        parser,
    })
}

async fn run_processor() -> anyhow::Result<()> {
    init_metrics().context("failed to initialize metrics")?;
    let runtime = build_runtime().await?;

    let token = CancellationToken::new();

    let mut pool = WorkerPool::new(
        Arc::clone(&runtime.store),
        runtime.queue.clone(),
        Arc::clone(&runtime.config),
        Arc::clone(&runtime.metrics),
    );
    pool.start(token.clone())
        .await
        .context("failed to start the worker pool")?;

    let daemon_handle = StarvationDaemon::new(runtime.queue.clone(), Arc::clone(&runtime.config))
        .spawn(token.clone());

    info!("Queue processor running");
    wait_for_shutdown_signal().await?;

    info!("Shutting down queue processor");
    token.cancel();
    pool.shutdown().await.context("worker pool shutdown failed")?;
    daemon_handle
        .await
        .context("anti-starvation daemon panicked")?;

    info!("Queue processor exited");
    Ok(())
}

async fn run_command(text: &str) -> anyhow::Result<()> {
    let runtime = build_runtime().await?;

    let service = ItemService::new(
        Arc::clone(&runtime.store),
        runtime.queue.clone(),
        Arc::clone(&runtime.metrics),
    );
    let bulk = BulkMutator::new(Arc::clone(&runtime.store), runtime.queue.clone());
    let engine = CommandEngine::new(
        runtime.parser,
        service,
        bulk,
        Arc::clone(&runtime.config),
        Arc::clone(&runtime.metrics),
    );

    let outcome = engine.execute_text(&CancellationToken::new(), text).await;

    let rendered = json!({
        "commandId": outcome.command_id.to_string(),
        "status": outcome.status.as_str(),
        "result": outcome.result,
        "error": outcome.error,
        "executionTimeMs": outcome.execution_time.map(|d| d.as_millis() as u64),
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

async fn run_migrations() -> anyhow::Result<()> {
    let app_config = AppConfig::from_env().context("failed to load configuration")?;
    let store = PostgresItemStore::connect(&app_config.database_url)
        .await
        .context("failed to connect to the item store")?;
    store
        .ensure_schema()
        .await
        .context("failed to apply the item-store schema")?;
    info!("Item store schema applied");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_process_subcommand() {
        let cli = <Cli as clap::Parser>::try_parse_from(["adqueue", "process"]).unwrap();
        assert!(matches!(cli.command, Commands::Process));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_command_subcommand() {
        let cli = <Cli as clap::Parser>::try_parse_from([
            "adqueue",
            "--log-level",
            "debug",
            "command",
            "enable starvation mode",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Command { text } => assert_eq!(text, "enable starvation mode"),
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn test_parse_requires_subcommand() {
        assert!(<Cli as clap::Parser>::try_parse_from(["adqueue"]).is_err());
    }
}
