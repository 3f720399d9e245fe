//! Growlink CLI
//!
//! Command-line client for the backend:
//! - Log in and print the seed inventory
//! - Fetch a pagelet
//! - Generate a default config file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use growlink::config::{generate_default_config, Config};
use growlink::handlers::{ChannelHandler, JsonLogHandler};
use growlink::transport::WebSocketConnector;
use growlink::{Connection, Envelope, SessionEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "growlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session-managed WebSocket client for the grow backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend host and port, overrides the config
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Use ws:// instead of wss://
    #[arg(long, global = true)]
    pub insecure: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in and print the seed inventory
    Inventory {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        passwd: String,
        /// Route of the inventory feature
        #[arg(long, default_value = "seeds")]
        route: String,
    },

    /// Log in and fetch a pagelet
    Pagelet {
        /// Page type, e.g. seeds or admin
        page: String,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        passwd: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Config written to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    growlink::logging::init(&config.logging).context("Failed to initialize logging")?;
    tracing::info!(
        url = %config.endpoint.url(),
        "growlink v{}",
        env!("CARGO_PKG_VERSION")
    );

    match cli.command {
        Commands::Inventory {
            user,
            passwd,
            route,
        } => inventory(&config, &user, &passwd, &route).await,
        Commands::Pagelet { page, user, passwd } => pagelet(&config, &page, &user, &passwd).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(host) = &cli.host {
        config.endpoint.host = host.clone();
    }
    if cli.insecure {
        config.endpoint.secure = false;
    }
    Ok(config)
}

async fn inventory(config: &Config, user: &str, passwd: &str, route: &str) -> Result<()> {
    let conn = Connection::start(config, Arc::new(WebSocketConnector::new()));
    let mut events = conn.subscribe();

    let (handler, mut inventory) = ChannelHandler::new();
    conn.register_handler(route, Arc::new(handler))?;
    conn.login(user, passwd)?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::AuthComplete { is_admin }) => {
                    tracing::info!(is_admin, "Logged in, requesting inventory");
                    conn.send(Envelope::new(route, "getInventory").component("getInventory"))?;
                }
                Ok(event) => {
                    if let Some(result) = finish_on(&event) {
                        return result;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Missed session events"),
                Err(RecvError::Closed) => bail!("Connection stopped"),
            },
            Some(envelope) = inventory.recv() => {
                println!("{}", JsonLogHandler::render(&envelope));
                conn.close()?;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                conn.close()?;
                return Ok(());
            }
        }
    }
}

async fn pagelet(config: &Config, page: &str, user: &str, passwd: &str) -> Result<()> {
    let conn = Connection::start(config, Arc::new(WebSocketConnector::new()));
    let mut events = conn.subscribe();
    conn.login(user, passwd)?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::AuthComplete { .. }) => conn.get_pagelet(page)?,
                Ok(SessionEvent::Navigated { component, fragment }) => {
                    tracing::info!(component = %component, "Pagelet received");
                    match fragment {
                        Some(serde_json::Value::String(html)) => println!("{}", html),
                        Some(other) => println!("{}", serde_json::to_string_pretty(&other)?),
                        None => {}
                    }
                    conn.close()?;
                    return Ok(());
                }
                Ok(event) => {
                    if let Some(result) = finish_on(&event) {
                        return result;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Missed session events"),
                Err(RecvError::Closed) => bail!("Connection stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                conn.close()?;
                return Ok(());
            }
        }
    }
}

/// Events that end a one-shot command
fn finish_on(event: &SessionEvent) -> Option<Result<()>> {
    match event {
        SessionEvent::Notice { route, message } => {
            Some(Err(anyhow::anyhow!("{} reported: {}", route, message)))
        }
        SessionEvent::Closed { code } => Some(Err(anyhow::anyhow!(
            "Connection closed: {}",
            growlink::protocol::close_code::describe(*code)
        ))),
        SessionEvent::SendFailed { route, kind, .. } => {
            Some(Err(anyhow::anyhow!("Could not send {} {}", route, kind)))
        }
        _ => None,
    }
}
