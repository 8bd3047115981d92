//! selector-echo: a single-threaded TCP echo server
//!
//! Accepts connections on one readiness multiplexer, reads whatever text a
//! client sends and writes it back with a fixed prefix.
//!
//! Features:
//! - One thread, one mio poll, many connections
//! - Per-connection failure isolation
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
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
        listen = %config.listen,
        poll_timeout_secs = config.poll_timeout,
        prefix = %config.response_prefix,
        "Starting selector-echo server"
    );

    runtime::run(config)?;
    Ok(())
}
