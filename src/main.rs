#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use ssh_relay::relay::{RelaySettings, SshBackend, server};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = RelaySettings::from_env();
    info!("SSH relay {} starting", env!("CARGO_PKG_VERSION"));
    info!("Clients connect over WebSocket and send a connect frame to open SSH");

    server::serve(settings, Arc::new(SshBackend::new())).await?;

    Ok(())
}
