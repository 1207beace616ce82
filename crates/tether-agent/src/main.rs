//! Tether server binary: loads settings, installs logging, hosts the chat
//! room at `/chat`, and shuts down gracefully on Ctrl-C.

mod chat;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tether_logging::LogLevel;
use tether_server::TetherServer;
use tether_settings::TetherSettings;

use crate::chat::ChatRoom;

/// Chat-room path.
const CHAT_PATH: &str = "/chat";
/// Settings class tuning the chat endpoint.
const CHAT_CLASS: &str = "chat";

/// Tether WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "Tether WebSocket server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `TETHER_SETTINGS` or `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut TetherSettings) -> Result<()> {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            let Some(level) = LogLevel::parse(level) else {
                bail!("invalid --log-level {level:?}");
            };
            settings.logging.level = level;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings)?;

    tether_logging::init_subscriber(settings.logging.level, settings.logging.format);
    tracing::info!(path = %settings_path.display(), "settings loaded");

    let mut server = TetherServer::new(settings);
    let _ = server
        .register_websocket_with(CHAT_PATH, CHAT_CLASS, ChatRoom::new)
        .context("Failed to register chat endpoint")?;

    let addr = server.listen().await.context("Failed to start server")?;
    tracing::info!(%addr, "chat room available at ws://{addr}{CHAT_PATH}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    server.shutdown_gracefully().await;
    Ok(())
}
