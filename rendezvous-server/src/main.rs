//! Rendezvous server binary

use std::sync::Arc;

use rendezvous_server::{Server, ServerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    log::info!("Rendezvous server starting...");
    log::info!("  Listen:          {}", config.listen_addr);
    log::info!("  Prepare delay:   {:?}", config.prepare_delay);
    log::info!("  Session timeout: {:?}", config.session_timeout);
    log::info!(
        "  ACK policy:      {} attempts, {:?} apart, {:?} wait",
        config.ack.retries,
        config.ack.delay,
        config.ack.timeout
    );

    let mut server = Server::bind(config)?;

    let shutdown = server.shutdown_handle();
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, shutdown)?;

    server.run()?;
    Ok(())
}
