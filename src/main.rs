//! TCP Chat Relay - Entry Point
//!
//! Parses the command line, binds the listener and serves until ctrl-c.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::config::{DEFAULT_CAPACITY, DEFAULT_MAX_IDENTIFIER_LEN, DEFAULT_MAX_MESSAGE_LEN};
use chat_relay::{RelayConfig, RelayServer};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "chat_relay", about = "Relay each client's text to every other client")]
struct Cli {
    /// Address to listen on
    #[arg(default_value = DEFAULT_ADDR)]
    addr: String,

    /// Maximum number of simultaneous clients
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Bytes read for the identifier handshake
    #[arg(long, default_value_t = DEFAULT_MAX_IDENTIFIER_LEN)]
    max_identifier_len: usize,

    /// Bytes read per chat message
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_LEN)]
    max_message_len: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig {
        capacity: cli.capacity,
        max_identifier_len: cli.max_identifier_len,
        max_message_len: cli.max_message_len,
    };

    let server = RelayServer::bind(&cli.addr, config).await?;
    info!(
        "Chat relay listening on {} ({} slots)",
        server.local_addr()?,
        cli.capacity
    );

    let report = server.run_until_ctrl_c().await;
    info!("Joined {} worker(s)", report.workers_joined);
    Ok(())
}
