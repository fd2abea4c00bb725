//! pin-server: GPIO control over a line-oriented TCP protocol
//!
//! Clients connect (e.g. with telnet) and send one command per line:
//!
//! ```text
//! input <pin>     read <pin>
//! output <pin>    high <pin>    low <pin>    toggle <pin>
//! pullup <pin>    pulldown <pin>    pulloff <pin>
//! close
//! ```
//!
//! Features:
//! - One task per connection, all sharing a single pin-control backend
//! - Memory-mapped BCM283x registers (`/dev/gpiomem`) or a simulated pin bank
//! - Configuration via CLI arguments or TOML file

mod config;
mod gpio;
mod protocol;
mod reader;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        pin_overflow = ?config.pin_overflow,
        "Starting pin-server"
    );

    // Acquired before the listener starts; released when the server drops.
    let gpio = gpio::open(config.backend, &config.device).inspect_err(|e| {
        error!(error = %e, "Failed to open GPIO backend");
    })?;

    let server = Server::new(config, gpio);
    server.run().await.inspect_err(|e| {
        error!(error = %e, "Server failed");
    })?;

    Ok(())
}
