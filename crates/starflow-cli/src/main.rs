//! Command-line interface for Starflow.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use starflow_core::config::{Config, ConfigBuilder};
use starflow_core::logging;
use starflow_core::runtime::build_runtime;
use starflow_devices::protocols::{AlpacaClient, AlpacaTransport};
use starflow_devices::registry::RegistryNotifier;
use starflow_devices::{CommandRequest, DeviceType, RemoteDeviceEndpoint, Transport};
use starflow_engine::{Observatory, StatusSyncEngine};

/// Starflow - keep observatory devices in sync and under control.
#[derive(Parser, Debug)]
#[command(name = "starflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured device until interrupted.
    Run {
        /// Seconds between status summaries in the log.
        #[arg(long, default_value_t = 30)]
        summary_every: u64,
    },
    /// Poll one Alpaca device once and print its status as JSON.
    Status {
        /// Alpaca server as HOST:PORT.
        server: String,
        /// Device type (dome, focuser, telescope, ...).
        device_type: String,
        /// Device number on the server.
        device_number: u32,
    },
    /// Send one command to an Alpaca device and print the reply.
    Command {
        /// Alpaca server as HOST:PORT.
        server: String,
        /// Device type (dome, focuser, telescope, ...).
        device_type: String,
        /// Device number on the server.
        device_number: u32,
        /// Alpaca method, e.g. openshutter or move.
        name: String,
        /// Form parameters as KEY=VALUE.
        parameters: Vec<String>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let filter = if args.verbose { "debug" } else { config.logging.level.as_str() };
    if config.logging.json_format {
        logging::init_from_config(&config.logging)?;
    } else {
        logging::init_with_filter(filter)?;
    }

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        command => {
            let runtime = build_runtime(&config.runtime)?;
            runtime.block_on(dispatch(command, config))
        }
    }
}

async fn dispatch(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Run { summary_every } => run(config, Duration::from_secs(summary_every.max(1))).await,
        Command::Status {
            server,
            device_type,
            device_number,
        } => poll_status(&config, &server, &device_type, device_number).await,
        Command::Command {
            server,
            device_type,
            device_number,
            name,
            parameters,
        } => send_command(&config, &server, &device_type, device_number, &name, &parameters).await,
        Command::Config => Ok(()),
    }
}

/// Layer defaults, the optional file and `STARFLOW__*` variables.
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut builder = ConfigBuilder::new();
    if let Some(path) = path {
        builder = builder.with_config_file(path);
    }
    builder
        .with_default_environment()
        .build()
        .context("Failed to load configuration")
}

async fn run(config: Config, summary_every: Duration) -> Result<()> {
    let observatory = Observatory::start(&config).await?;
    let mut summary = tokio::time::interval(summary_every);
    summary.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
            _ = summary.tick() => {
                for status in observatory.statuses() {
                    let detail = serde_json::to_string(&status.detail)?;
                    info!(
                        device = %status.name,
                        kind = %status.kind,
                        online = status.online,
                        %detail,
                        "Status"
                    );
                }
            }
        }
    }

    observatory.shutdown().await;
    Ok(())
}

fn endpoint(server: &str, device_type: &str, device_number: u32) -> Result<RemoteDeviceEndpoint> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Expected HOST:PORT, got '{}'", server))?;
    let port = port.parse().with_context(|| format!("Invalid port '{}'", port))?;
    let device_type: DeviceType = device_type.parse()?;
    Ok(RemoteDeviceEndpoint::new(host, port, device_type, device_number))
}

async fn poll_status(config: &Config, server: &str, device_type: &str, device_number: u32) -> Result<()> {
    let endpoint = endpoint(server, device_type, device_number)?;
    let client = AlpacaClient::new(&endpoint, config.general.client_id, config.sync.request_timeout())?;
    let mut engine =
        StatusSyncEngine::attach(endpoint, Arc::new(client), &config.sync, RegistryNotifier::detached()).await;

    let handle = engine.handle();
    handle.force_refresh();
    engine.tick(tokio::time::Instant::now()).await;

    let endpoint = handle.endpoint();
    if !endpoint.online {
        let reason = endpoint
            .last_error
            .as_ref()
            .map(|error| error.message.clone())
            .unwrap_or_else(|| "no answer".to_string());
        bail!("{} is offline: {}", endpoint, reason);
    }

    let document = serde_json::json!({
        "device": endpoint.name,
        "strategy": handle.strategy().to_string(),
        "properties": handle.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

async fn send_command(
    config: &Config,
    server: &str,
    device_type: &str,
    device_number: u32,
    name: &str,
    parameters: &[String],
) -> Result<()> {
    let endpoint = endpoint(server, device_type, device_number)?;
    let client = AlpacaClient::new(&endpoint, config.general.client_id, Duration::from_millis(config.queue.slew_timeout_ms))?;

    let mut request = CommandRequest::new(name);
    for parameter in parameters {
        let (key, value) = parameter
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", parameter))?;
        request = request.with_parameter(key, value);
    }

    let mut transport = AlpacaTransport::new(client);
    transport.connect().await?;
    let reply = transport.exchange(&request).await;
    transport.disconnect().await?;

    let reply = reply.with_context(|| format!("{} on {} failed", name, endpoint))?;
    println!("{}", serde_json::to_string_pretty(&reply.value)?);
    Ok(())
}
