//! kvlink-cli - Command-line interface for kvlink
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use kvlink_client::{Client, ClientConfig};
use kvlink_core::{EventEnvelope, EventRouter, OriginTag, SessionEvent};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kvlink-cli")]
#[command(about = "Command-line interface for the kvlink key-value server")]
#[command(version)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1", env = "KVLINK_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = kvlink_core::DEFAULT_PORT, env = "KVLINK_PORT")]
    port: u16,

    /// User name to authenticate as
    #[arg(short, long, env = "KVLINK_USER")]
    user: Option<String>,

    /// Password for --user
    #[arg(long, env = "KVLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn credentials(&self) -> Option<Value> {
        self.user.as_ref().map(|user| {
            json!({
                "name": user,
                "password": self.password.as_deref().unwrap_or_default(),
            })
        })
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.host)
            .with_port(self.port)
            .with_client_name("kvlink-cli")
            .with_connect_timeout(Duration::from_secs(self.timeout))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the server
    Ping,

    /// Show what the server exposes
    Info,

    /// Get the value of a key
    Get {
        key: String,
    },

    /// Set a key
    Put {
        key: String,
        value: String,
    },

    /// Delete a key
    Del {
        key: String,
    },

    /// Apply several writes atomically
    Batch {
        /// JSON array of {"type":"put"|"del","key":..,"value":..} (or @file.json)
        ops: String,
    },

    /// List keys in order
    Range {
        /// Inclusive lower bound
        #[arg(long)]
        gte: Option<String>,

        /// Inclusive upper bound
        #[arg(long)]
        lte: Option<String>,

        /// Maximum entries to return
        #[arg(short, long)]
        limit: Option<usize>,

        /// Iterate in descending key order
        #[arg(short, long)]
        reverse: bool,
    },

    /// Stay connected and print session events until Ctrl+C
    Watch,

    /// Generate the SHA-256 hash of a password for config files
    HashPassword {
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut cli = Cli::parse();

    // Handled locally, no server connection needed
    if let Some(Commands::HashPassword { password }) = &cli.command {
        println!("{}", commands::hash_password(password));
        return Ok(());
    }

    match cli.command.take() {
        Some(Commands::Repl) | None => {
            // The session re-authenticates on every reconnect
            let mut config = cli.client_config();
            if let Some(credentials) = cli.credentials() {
                config = config.with_credentials(credentials);
            }
            repl::run(Client::new(config)?).await?;
        }
        Some(Commands::HashPassword { .. }) => unreachable!(),
        Some(Commands::Watch) => {
            let mut config = cli.client_config();
            if let Some(credentials) = cli.credentials() {
                config = config.with_credentials(credentials);
            }
            let router = EventRouter::default();
            let mut events = router.subscribe();
            let client = Client::with_events(config, router)?;
            eprintln!(
                "{} session with {}",
                "Watching".green(),
                client.config().address().cyan()
            );
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => println!("{}", commands::format_event(&event)),
                        Err(RecvError::Lagged(n)) => {
                            eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping watch...".dimmed());
                        break;
                    }
                }
            }
        }
        Some(cmd) => {
            let router = EventRouter::default();
            let mut events = router.subscribe();
            let client = Client::with_events(cli.client_config(), router)?;
            if let Err(e) = wait_ready(&mut events, Duration::from_secs(cli.timeout)).await {
                eprintln!("{}: {}", "Connection failed".red(), e);
                std::process::exit(1);
            }
            if let Some(credentials) = cli.credentials() {
                if let Err(e) = client.db().auth(credentials).await {
                    eprintln!("{}: {}", "Authentication failed".red(), e);
                    std::process::exit(1);
                }
            }

            match commands::execute(client.db(), cmd).await {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Waits for the first stream to open. A one-shot command does not retry.
async fn wait_ready(
    events: &mut broadcast::Receiver<EventEnvelope>,
    timeout: Duration,
) -> Result<(), String> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.is(OriginTag::Database, &SessionEvent::Connect) => {
                    return Ok(())
                }
                Ok(event) => {
                    if let SessionEvent::Error { message, .. } = event.event {
                        return Err(message);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err("session ended".to_string()),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or_else(|_| Err(format!("no connection after {}s", timeout.as_secs())))
}
