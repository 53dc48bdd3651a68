//! # Polled Queue CLI
//!
//! Operator command-line interface for a remote long-polled queue.
//!
//! This module provides CLI commands for:
//! - Pushing messages through the adapter
//! - Reserving, releasing and deleting messages
//! - Inspecting, purging and provisioning the remote queue
//! - Running a printing consumer for a fixed duration
//!
//! Configuration is read from an optional file (`--config` / `PQ_CONFIG`)
//! and then from `PQ__`-prefixed environment variables, e.g.
//! `PQ__REMOTE__TOKEN=...` sets `remote.token`.

use clap::{Parser, Subcommand};
use polled_queue::{
    handler_fn, ConfigurationError, HandlerError, HttpRemoteConfig, HttpRemoteQueue, Message,
    PolledQueue, QueueError, QueueOptions, RemoteQueue, TaskQueue, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// pq - operate a remote long-polled task queue
#[derive(Parser, Debug)]
#[command(name = "pq")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reliable-delivery client for a long-polled message queue")]
pub struct Cli {
    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, env = "PQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Submit one message
    Push {
        /// Message payload (UTF-8)
        payload: String,

        /// Task the message is for
        #[arg(short, long)]
        task: String,

        /// Logical name carried on the message. Duplicate suppression is
        /// process-local, so separate `pq push` runs never suppress each other.
        #[arg(short, long)]
        name: Option<String>,

        /// Visibility delay in seconds
        #[arg(short, long, default_value = "0")]
        delay: u64,
    },

    /// Reserve messages and print them
    Reserve {
        /// Maximum number of messages
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Long-poll wait in seconds
        #[arg(short, long, default_value = "0")]
        wait: u64,

        /// Release the messages instead of deleting them
        #[arg(long)]
        release: bool,
    },

    /// Print the number of messages in the queue
    Len,

    /// Remove every message from the queue
    Purge {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Provision the queue on the remote
    Create,

    /// Run a printing consumer, then close
    Consume {
        /// How long to consume, in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI error types
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidFormat(#[from] config::ConfigError),

    #[error("Remote configuration: {0}")]
    Remote(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Settings consumed by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub remote: HttpRemoteConfig,

    pub queue: QueueOptions,
}

impl CliConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}

/// Load configuration from an optional file, then `PQ__` environment variables
///
/// Later sources override earlier ones. The file format is inferred from its
/// extension.
pub fn load_configuration(config_path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config: CliConfig = builder
        .add_source(config::Environment::with_prefix("PQ").separator("__"))
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Parse arguments, set up logging and configuration, and run the command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = load_configuration(cli.config.as_deref())?;

    run_command(cli.command, config).await
}

/// Execute one command against the configured remote
pub async fn run_command(command: Commands, config: CliConfig) -> Result<(), CliError> {
    let remote: Arc<dyn RemoteQueue> = Arc::new(
        HttpRemoteQueue::new(config.remote.clone()).map_err(ConfigError::from)?,
    );
    debug!(queue = %remote.name(), command = ?command, "Executing command");

    match command {
        Commands::Push {
            payload,
            task,
            name,
            delay,
        } => execute_push_command(remote, config.queue, payload, task, name, delay).await,
        Commands::Reserve {
            count,
            wait,
            release,
        } => execute_reserve_command(remote, config.queue, count, wait, release).await,
        Commands::Len => {
            let info = remote.info().await.map_err(QueueError::from)?;
            println!("{}", info.size);
            Ok(())
        }
        Commands::Purge { yes } => {
            if !yes {
                return Err(CliError::InvalidArgument {
                    arg: "--yes".to_string(),
                    message: "purge removes every message; pass --yes to confirm".to_string(),
                });
            }
            remote.clear().await.map_err(QueueError::from)?;
            info!(queue = %remote.name(), "Queue purged");
            Ok(())
        }
        Commands::Create => {
            remote.create_queue().await.map_err(QueueError::from)?;
            info!(queue = %remote.name(), "Queue created");
            Ok(())
        }
        Commands::Consume { duration } => {
            execute_consume_command(remote, config.queue, duration).await
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("pq={level},polled_queue={level}", level = cli.log_level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("Failed to initialize logging: {}", e),
    })
}

async fn execute_push_command(
    remote: Arc<dyn RemoteQueue>,
    options: QueueOptions,
    payload: String,
    task: String,
    name: Option<String>,
    delay: u64,
) -> Result<(), CliError> {
    let queue = PolledQueue::builder(remote, options).build()?;

    let mut message =
        Message::new(task, payload.into_bytes()).with_delay(Duration::from_secs(delay));
    if let Some(name) = name {
        message = message.with_name(name);
    }

    let added = queue.add(&mut message).await;
    // Close even when add failed so buffered work is not lost
    let closed = queue.close().await;
    added?;
    closed?;

    // Each invocation starts with an empty dedup store, so no duplicate is possible here
    let stats = queue.stats();
    if stats.add.processed == 1 {
        println!("pushed");
    } else {
        return Err(CliError::CommandFailed {
            message: "message was accepted but could not be pushed".to_string(),
        });
    }
    Ok(())
}

async fn execute_reserve_command(
    remote: Arc<dyn RemoteQueue>,
    options: QueueOptions,
    count: usize,
    wait: u64,
    release: bool,
) -> Result<(), CliError> {
    if count == 0 {
        return Err(CliError::InvalidArgument {
            arg: "--count".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let queue = PolledQueue::builder(remote, options).build()?;
    let messages = queue.reserve_n(count, Duration::from_secs(wait)).await?;

    for message in &messages {
        println!("{}", render_message(message));
        if release {
            queue.release(message).await?;
        } else {
            queue.delete(message).await?;
        }
    }

    info!(count = messages.len(), released = release, "Reserve complete");
    queue.close().await?;
    Ok(())
}

async fn execute_consume_command(
    remote: Arc<dyn RemoteQueue>,
    options: QueueOptions,
    duration: u64,
) -> Result<(), CliError> {
    let queue = Arc::new(PolledQueue::builder(remote, options).build()?);

    queue.start_consumer(Arc::new(handler_fn(|message: Message| async move {
        println!("{}", render_message(&message));
        Ok::<_, HandlerError>(())
    })))?;

    info!(duration_secs = duration, "Consuming");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
        signal = tokio::signal::ctrl_c() => signal?,
    }

    queue.close().await?;
    let stats = queue.stats();
    info!(
        deleted = stats.delete.processed,
        delete_failures = stats.delete.fails,
        "Consumer finished"
    );
    Ok(())
}

/// One JSON line describing a reserved message
pub fn render_message(message: &Message) -> String {
    serde_json::json!({
        "id": message.id,
        "task": message.task_name,
        "name": message.name,
        "reserved_count": message.reserved_count,
        "payload": String::from_utf8_lossy(&message.payload),
        "error": message.err.as_ref().map(|e| e.to_string()),
    })
    .to_string()
}
