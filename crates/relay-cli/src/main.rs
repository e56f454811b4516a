use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use relay_core::{DispatchOptions, Message, Orchestrator, RawMessage, Response};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod agents;
mod config;

use config::{LoggingConfig, RelayConfig};

const CLI_SENDER: &str = "cli";

#[derive(Parser)]
#[command(name = "relay")]
#[command(version)]
#[command(about = "Relay: message routing core for a multi-agent todo app")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Send a single action through the orchestrator and print the response
    Dispatch {
        /// Action name, e.g. task_add
        action: String,

        /// JSON object payload
        payload: Option<String>,

        /// Correlation id to use instead of a generated one
        #[arg(long)]
        correlation_id: Option<String>,

        /// Override the dispatch timeout (seconds)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List registered agents
    Agents,

    /// Show orchestrator status
    Status,

    /// Read `<action> [json]` lines from stdin until EOF, Ctrl+C or system_shutdown
    Repl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it loads cleanly
    let logging = RelayConfig::load(&cli.config)
        .map(|cfg| cfg.logging)
        .unwrap_or_default();
    init_logging(cli.debug, &logging);

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Dispatch {
            action,
            payload,
            correlation_id,
            timeout,
        } => cmd_dispatch(&cli.config, action, payload, correlation_id, timeout).await,
        Commands::Agents => cmd_system(&cli.config, relay_core::system::SYSTEM_AGENTS).await,
        Commands::Status => cmd_system(&cli.config, relay_core::system::SYSTEM_STATUS).await,
        Commands::Repl => cmd_repl(&cli.config).await,
    }
}

fn init_logging(debug: bool, logging: &LoggingConfig) {
    let default_level = if debug { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build an orchestrator with the built-in agents registered, not yet started
async fn build_orchestrator(cfg: &RelayConfig) -> Result<Arc<Orchestrator>> {
    let orchestrator = Arc::new(Orchestrator::new(cfg.orchestrator.clone()));
    agents::register_builtin(&orchestrator, cfg).await?;
    Ok(orchestrator)
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config::default_config_path();
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Relay initialized at {}", config_dir.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_dispatch(
    config_path: &Option<PathBuf>,
    action: String,
    payload: Option<String>,
    correlation_id: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path)?;
    let payload = match payload {
        Some(text) => parse_payload(&text)?,
        None => Value::Null,
    };

    let mut raw = RawMessage::new(action).payload(payload).sender(CLI_SENDER);
    if let Some(id) = correlation_id {
        raw = raw.correlation_id(id);
    }

    let orchestrator = build_orchestrator(&cfg).await?;
    let response = orchestrator
        .run_scoped(|orchestrator| async move {
            let message = match raw.clone().build() {
                Ok(message) => message,
                // Let the orchestrator build the error response with the right correlation id
                Err(_) => return Ok(orchestrator.dispatch_raw(raw).await),
            };
            let mut options = DispatchOptions::default();
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            Ok(orchestrator.dispatch_with(message, options).await)
        })
        .await?;

    print_response(&response)?;
    if let Some(info) = response.error_info() {
        bail!("{}: {}", info.kind, info.message);
    }
    Ok(())
}

async fn cmd_system(config_path: &Option<PathBuf>, action: &'static str) -> Result<()> {
    let cfg = RelayConfig::load(config_path)?;
    let orchestrator = build_orchestrator(&cfg).await?;
    let response = orchestrator
        .run_scoped(|orchestrator| async move {
            let message = Message::new(action, Value::Null)?;
            Ok(orchestrator.dispatch(message).await)
        })
        .await?;
    print_response(&response)
}

async fn cmd_repl(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path)?;
    let orchestrator = build_orchestrator(&cfg).await?;

    orchestrator
        .run_scoped(|orchestrator| async move {
            let shutdown = orchestrator.shutdown_signal();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            println!("Relay ready. Enter `<action> [json]`, or `exit`.");

            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                        break;
                    }
                    _ = shutdown.cancelled() => {
                        info!("Shutdown requested, leaving REPL");
                        break;
                    }
                    line = lines.next_line() => {
                        let Some(line) = line? else {
                            debug!("stdin closed");
                            break;
                        };
                        let raw = match parse_repl_line(&line) {
                            Ok(Some(raw)) => raw,
                            Ok(None) => continue,
                            Err(e) => {
                                eprintln!("{:#}", e);
                                continue;
                            }
                        };
                        if matches!(raw.action.as_str(), "exit" | "quit") {
                            break;
                        }
                        let response = orchestrator.dispatch_raw(raw).await;
                        print_response(&response)?;
                    }
                }
            }
            Ok(())
        })
        .await?;

    println!("Relay stopped.");
    Ok(())
}

fn parse_payload(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Payload is not valid JSON: {}", text))
}

/// Parse `<action> [json payload]`. Blank lines and `#` comments yield None.
fn parse_repl_line(line: &str) -> Result<Option<RawMessage>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (action, rest) = match line.split_once(char::is_whitespace) {
        Some((action, rest)) => (action, rest.trim()),
        None => (line, ""),
    };
    let payload = if rest.is_empty() {
        Value::Null
    } else {
        parse_payload(rest)?
    };
    Ok(Some(RawMessage::new(action).payload(payload).sender(CLI_SENDER)))
}

fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
