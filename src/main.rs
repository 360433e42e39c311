use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use stream_bridge::config::load_config;
use stream_bridge::{env, init_tracing, BridgeServer, ServerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut config = load_config()?;
    env::apply_overrides(&mut config)?;
    if let Some(server_id) = std::env::args().nth(1) {
        config.server.server_id = server_id;
        config.validate()?;
    }

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.listen_addr))?;

    let server = BridgeServer::new(ServerSettings::from(&config));
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(err) => warn!("Unable to listen for Ctrl-C: {}", err),
        }
    });

    server.serve(listener).await?;
    Ok(())
}
