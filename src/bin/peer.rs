//! Echo peer: keeps a stream open to the bridge and answers every request
//! with its own payload.

use anyhow::{anyhow, Context, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use stream_bridge::connection::ConnectionManager;
use stream_bridge::env::ClientEnv;
use stream_bridge::message::{Frame, PeerResponse};
use stream_bridge::{init_tracing, transport, BridgeError};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let client_id = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: bridge-peer <client-id>"))?;
    let client_env = ClientEnv::load()?;
    let manager = ConnectionManager::new(&client_env.server_addr)
        .with_reconnect_policy(client_env.reconnect_attempts, client_env.reconnect_delay_ms);

    tokio::select! {
        result = run(&manager, &client_env, &client_id) => result,
        _ = tokio::signal::ctrl_c() => {
            info!(%client_id, "Ctrl-C received, closing stream");
            Ok(())
        }
    }
}

async fn run(manager: &ConnectionManager, client_env: &ClientEnv, client_id: &str) -> Result<()> {
    loop {
        let stream = manager
            .connect()
            .await
            .with_context(|| format!("Unable to reach bridge at {}", manager.addr()))?;

        match session(stream, client_id).await {
            Ok(()) => info!(%client_id, "bridge closed the stream"),
            Err(err) => warn!(%client_id, error = %err, "stream lost"),
        }
        sleep(client_env.reconnect_delay()).await;
    }
}

async fn session(stream: tokio::net::TcpStream, client_id: &str) -> Result<(), BridgeError> {
    let (mut reader, mut writer) = transport::split(stream);
    writer
        .send_frame(&Frame::Hello {
            client_id: client_id.to_string(),
        })
        .await?;
    info!(%client_id, "stream open");

    while let Some(frame) = reader.next_frame().await? {
        match frame {
            Frame::Request(request) => {
                debug!(trace_id = request.trace_id, n = %request.n, "request received");
                let response = PeerResponse::echo(&request, client_id);
                writer.send_frame(&Frame::Response(response)).await?;
            }
            other => warn!(kind = other.kind(), "ignoring unexpected frame"),
        }
    }
    Ok(())
}
