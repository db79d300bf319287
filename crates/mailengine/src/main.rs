//! `mailengine` - queue worker for Gmail and Outlook mail events.

mod engine;
mod input;
mod worker;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailengine_core::{
    Disposition, EngineConfig, FailedMessage, FailedMessageStatus, KeyringSecrets,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::engine::Engine;
use crate::worker::{Worker, run_retention};

#[derive(Debug, Parser)]
#[command(name = "mailengine", version, about = "Process queued mail events")]
struct Cli {
    /// Configuration file (defaults to <config dir>/mailengine/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process JSON-lines deliveries until end of input or Ctrl-C.
    Run {
        /// Read deliveries from this file instead of stdin.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Inspect and act on dead-lettered messages.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Check the dead-letter backlog once.
    Monitor,
    /// Manage secrets in the system keyring.
    Secret {
        #[command(subcommand)]
        command: SecretCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SecretCommand {
    /// Store a secret, reading its value from the first line of stdin.
    Set {
        /// Secret name, e.g. gmail-access-token-<account id>.
        name: String,
    },
    /// Remove a secret.
    Delete {
        /// Secret name.
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// List dead-lettered messages.
    List {
        /// Only show records in this state (in-dlq, manual-retry-pending, resolved).
        #[arg(long, value_parser = parse_status)]
        status: Option<FailedMessageStatus>,
    },
    /// Reprocess a dead-lettered message and resolve it on success.
    Replay {
        /// Record ID.
        id: Uuid,
    },
    /// Mark a dead-lettered message as resolved.
    Resolve {
        /// Record ID.
        id: Uuid,
    },
}

fn parse_status(s: &str) -> Result<FailedMessageStatus, String> {
    FailedMessageStatus::parse(s)
        .ok_or_else(|| format!("expected in-dlq, manual-retry-pending or resolved, got {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mailengine=info,mailengine_core=info,mailengine_providers=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Command::Run { input } => run(open_engine(config).await?, input).await,
        Command::Dlq { command } => dlq(&open_engine(config).await?, command).await,
        Command::Monitor => monitor(&open_engine(config).await?).await,
        Command::Secret { command } => secret(command).await,
    }
}

async fn open_engine(config: Option<&Path>) -> Result<Engine> {
    let config = EngineConfig::load(config)
        .await
        .context("loading configuration")?;
    Engine::build(config).await
}

async fn monitor(engine: &Engine) -> Result<()> {
    let report = engine.monitor().check().await?;
    if report.is_empty() {
        println!("Dead-letter queue is empty");
    }
    for topic in &report.backlog {
        println!(
            "{}\t{}\t{}\t{}",
            topic.topic, topic.count, topic.latest_failed_at, topic.latest_error
        );
    }
    Ok(())
}

async fn run(engine: Engine, input: Option<PathBuf>) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
            } else {
                warn!("Cannot listen for Ctrl-C");
            }
            cancel.cancel();
        });
    }

    // Background tasks stop when the worker is done.
    let background = cancel.child_token();
    let monitor = engine.monitor();
    let monitor_task = {
        let background = background.clone();
        tokio::spawn(async move { monitor.run(background).await })
    };
    let retention_task = engine.config.ledger_retention().map(|retention| {
        tokio::spawn(run_retention(engine.ledger.clone(), retention, background.clone()))
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let worker = Worker::new(engine.adapter, engine.config);
    let summary = worker.run(reader, cancel).await?;

    background.cancel();
    monitor_task.await?;
    if let Some(task) = retention_task {
        task.await?;
    }

    println!(
        "completed={} dead_lettered={} abandoned={}",
        summary.completed, summary.dead_lettered, summary.abandoned
    );
    Ok(())
}

async fn dlq(engine: &Engine, command: DlqCommand) -> Result<()> {
    match command {
        DlqCommand::List { status } => {
            for record in engine.dead_letters.list_by_status(status).await? {
                print_record(&record);
            }
        }
        DlqCommand::Replay { id } => {
            let disposition = engine.adapter.replay(id, &CancellationToken::new()).await?;
            match disposition {
                Disposition::Completed => println!("{id} replayed and resolved"),
                Disposition::Retry(e) => {
                    println!("{id} failed transiently and is still pending, replay it again later: {e}");
                }
                Disposition::DeadLettered(e) => println!("{id} failed again: {e}"),
            }
        }
        DlqCommand::Resolve { id } => {
            let record = engine.dead_letters.resolve(id).await?;
            print_record(&record);
        }
    }
    Ok(())
}

async fn secret(command: SecretCommand) -> Result<()> {
    let keyring = KeyringSecrets;
    match command {
        SecretCommand::Set { name } => {
            let value = BufReader::new(tokio::io::stdin())
                .lines()
                .next_line()
                .await?
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .context("expected the secret value on stdin")?;
            tokio::task::spawn_blocking(move || keyring.store(&name, &value)).await??;
        }
        SecretCommand::Delete { name } => {
            tokio::task::spawn_blocking(move || keyring.delete(&name)).await??;
        }
    }
    Ok(())
}

fn print_record(record: &FailedMessage) {
    println!(
        "{}\t{}\t{}\t{}\tretries={}\t{}\t{}",
        record.id,
        record.status,
        record.topic,
        record.subscription,
        record.retry_count,
        record.failed_at,
        record.error_message
    );
}
