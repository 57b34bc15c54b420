//! routeros-link - command-line client for the RouterOS management socket.
//!
//! Connects to one router through the management API, runs a single
//! operation and prints the response as JSON. `watch` stays connected and
//! prints unsolicited router events until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use routeros_link::{ApiEndpoint, ClientConfig, ClientEvent, Credentials, EventKind, RouterOsClient};

#[derive(Debug, Parser)]
#[command(name = "routeros-link", version, about)]
struct Cli {
    /// JSON config file (defaults to the per-user config path)
    #[arg(long, env = "ROUTEROS_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// API base URL, e.g. ws://localhost:5000 (overrides the config)
    #[arg(long)]
    url: Option<String>,

    /// Router identifier
    router_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct Login {
    #[arg(long, env = "ROUTEROS_USERNAME")]
    username: String,

    #[arg(long, env = "ROUTEROS_PASSWORD", hide_env_values = true)]
    password: String,
}

impl From<Login> for Credentials {
    fn from(login: Login) -> Self {
        Credentials::new(login.username, login.password)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Router status and resources
    Status {
        /// Router address on the VPN
        #[arg(long)]
        ip: Option<String>,
    },
    /// List static routes
    Routes {
        #[arg(long)]
        ip: String,
        #[command(flatten)]
        login: Login,
    },
    /// Run a RouterOS API command
    Exec {
        #[arg(long)]
        ip: String,
        #[command(flatten)]
        login: Login,
        /// Command path, e.g. /ip/address/print
        command: String,
    },
    /// Print unsolicited router events until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "routeros_link=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::resolve(cli.config.as_deref())?;

    let client = match &cli.url {
        Some(url) => {
            let endpoint = ApiEndpoint::new(url).context("Invalid --url")?;
            RouterOsClient::new(config, endpoint)
        }
        None => RouterOsClient::from_config(config).context("Invalid endpoint configuration")?,
    };

    info!("routeros-link v{}", env!("CARGO_PKG_VERSION"));
    client
        .connect(&cli.router_id)
        .await
        .with_context(|| format!("Failed to connect to router {}", cli.router_id))?;

    let result = run(&client, &cli.router_id, cli.command).await;
    client.disconnect();
    result
}

async fn run(client: &RouterOsClient, router_id: &str, command: Command) -> Result<()> {
    let response = match command {
        Command::Status { ip } => client.get_status(router_id, ip.as_deref()).await?,
        Command::Routes { ip, login } => {
            client
                .list_routes(router_id, &ip, &login.into())
                .await?
        }
        Command::Exec { ip, login, command } => {
            client
                .execute_command(router_id, &ip, &login.into(), &command)
                .await?
        }
        Command::Watch => return watch(client).await,
    };

    print_json(&response)
}

async fn watch(client: &RouterOsClient) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();

    let subscriptions: Vec<_> = [
        EventKind::Message,
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::MaxReconnectAttemptsReached,
    ]
    .into_iter()
    .map(|kind| {
        let tx = tx.clone();
        client.on(kind, move |event| {
            let _ = tx.send(event.clone());
        })
    })
    .collect();
    drop(tx);

    info!("Watching events (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(ClientEvent::Message(value)) => print_json(&value)?,
                Some(ClientEvent::MaxReconnectAttemptsReached { attempts }) => {
                    warn!("Gave up after {} reconnect attempts", attempts);
                    break;
                }
                Some(other) => info!("{:?}", other),
                None => break,
            },
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
