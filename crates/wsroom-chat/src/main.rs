//! `wsroom-chat`: a broadcast chat server.
//!
//! Every WebSocket client on the configured path joins one room; each message
//! a client sends is broadcast to all members, and joins and leaves are
//! announced. Any other path answers with a plain greeting.
//!
//! Options:
//! - `--config` - TOML config file (see `config.rs`)
//! - `--listen` - Bind address, overrides the config file
//! - `--room` - Room name, overrides the config file
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

mod config;
mod server;

use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use wsroom::{LoggingHooks, Negotiator, Room};

use crate::config::ChatConfig;
use crate::server::ChatServer;

#[derive(Parser)]
#[command(name = "wsroom-chat", version, about = "WebSocket broadcast chat server")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (e.g., 127.0.0.1:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Name of the chat room
    #[arg(long)]
    room: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let mut config = match &cli.config {
        Some(path) => ChatConfig::from_file(path)?,
        None => ChatConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(room) = cli.room {
        config.room_name = room;
    }

    let listener = TcpListener::bind(&config.listen)
        .map_err(|e| format!("Failed to bind {}: {}", config.listen, e))?;
    let room = Room::new(config.room_name.clone(), config.room.clone(), Arc::new(LoggingHooks))
        .map_err(|e| format!("Failed to start room: {}", e))?;

    let server = Arc::new(ChatServer::new(
        Negotiator::new(config.connection.clone()),
        Arc::new(room),
        config.ws_path.clone(),
    ));
    server
        .serve(listener)
        .map_err(|e| format!("Server error: {}", e))
}
