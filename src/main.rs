//! readiness-loop: ping/pong over two independent event loops.
//!
//! Starts a server loop, then a client loop connected to it. The client
//! sends a request, the server answers with a fixed reply, and the client
//! asks again after a delay. Runs until the configured number of rounds
//! has completed (or forever with `--rounds 0`).
//!
//! Features:
//! - One dedicated thread per event loop
//! - Explicit framing (raw, line, length-prefixed)
//! - Configuration via CLI arguments or TOML file

use readiness_loop::client::Client;
use readiness_loop::config::Config;
use readiness_loop::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        host = %config.host,
        port = config.port,
        framing = ?config.framing,
        buffer_size = config.buffer_size,
        delay_ms = config.delay.as_millis() as u64,
        rounds = config.rounds,
        "Starting readiness-loop"
    );

    let server = Server::start(&config)?;
    let (client, replies) = Client::start(&config, server.local_addr())?;

    let limit = match config.rounds {
        0 => usize::MAX,
        n => usize::try_from(n).unwrap_or(usize::MAX),
    };
    let completed = replies.iter().take(limit).count();
    info!(rounds = completed, "Exchange finished");

    client.stop()?;
    server.stop()?;
    Ok(())
}
