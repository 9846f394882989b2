//! tether - command-line gateway client
//!
//! Connects to a real-time gateway, logs what it sees, and issues one-off
//! correlated requests.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tether_client::{
    ClientConfig, ClientError, ClientEvent, ConnectionController, EventKind, ReplyMatcher,
};
use tether_proto::Envelope;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Resilient real-time gateway client")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log every event until Ctrl-C
    Listen {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Send one request and print the reply
    Request {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Message type of the request
        #[arg(long = "type")]
        kind: String,

        /// JSON object payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Only accept a reply of this type
        #[arg(long)]
        reply_type: Option<String>,

        /// Override the configured request timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "tether.toml")]
        output: PathBuf,

        /// Gateway URL
        #[arg(long, default_value = "wss://localhost:8443/ws")]
        url: String,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway WebSocket URL (overrides the config file)
    #[arg(long, env = "TETHER_URL")]
    url: Option<String>,

    /// Bearer token (overrides the config file)
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl ConnectArgs {
    fn load(self) -> anyhow::Result<ClientConfig> {
        let mut config = match (&self.config, &self.url) {
            (Some(path), _) => ClientConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(url)) => ClientConfig::new(url.clone()),
            (None, None) => anyhow::bail!("either --config or --url is required"),
        };
        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(token) = self.token {
            config.auth_token = Some(token);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("tether_client=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Listen { connect } => {
            listen(connect.load()?).await?;
        }

        Commands::Request {
            connect,
            kind,
            payload,
            reply_type,
            timeout_ms,
        } => {
            let payload = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let matcher = reply_type.map_or(ReplyMatcher::Any, ReplyMatcher::kind);
            let timeout = timeout_ms.map(Duration::from_millis);
            request(connect.load()?, Envelope::new(kind, payload), matcher, timeout).await?;
        }

        Commands::InitConfig { output, url } => {
            init_config(output, url)?;
        }
    }

    Ok(())
}

async fn listen(config: ClientConfig) -> anyhow::Result<()> {
    info!(url = %config.url, "starting listener");
    let client = ConnectionController::new(config)?;
    let mut events = client.subscribe_channel(EventKind::ALL);

    if let Err(e) = client.connect().await {
        // A retry is already scheduled; keep listening.
        warn!(error = %e, "initial connect failed");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, disconnecting");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Message(envelope) => {
                        println!("{}", envelope.to_json()?);
                    }
                    ClientEvent::Error(e @ ClientError::MaxAttemptsExceeded { .. }) => {
                        error!(error = %e, "giving up");
                        client.disconnect();
                        return Err(e.into());
                    }
                    other => info!(event = ?other, "lifecycle event"),
                }
            }
        }
    }

    client.close_stream(events);
    client.disconnect();
    Ok(())
}

async fn request(
    config: ClientConfig,
    envelope: Envelope,
    matcher: ReplyMatcher,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let client = ConnectionController::new(config)?;
    client.connect().await.context("connecting to gateway")?;

    let result = client.request(envelope, matcher, timeout).await;
    client.disconnect();

    let reply = result?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

fn init_config(output: PathBuf, url: String) -> anyhow::Result<()> {
    let config = ClientConfig::new(url);
    config.validate()?;
    std::fs::write(&output, config.to_toml()?)
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to add your auth token, then run:");
    println!("  tether listen --config {}", output.display());

    Ok(())
}
