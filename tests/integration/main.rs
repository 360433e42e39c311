//! Loopback TCP scenarios against a real `BridgeServer`.

mod peers;
mod triggers;

use std::time::Duration;

use stream_bridge::message::{Frame, PeerResponse, TriggerReply, TriggerRequest};
use stream_bridge::transport::{self, FrameReader, FrameWriter};
use stream_bridge::{BridgeServer, ProtocolPolicy, ServerSettings};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct TestBridge {
    pub server: BridgeServer,
    pub addr: String,
}

impl TestBridge {
    pub async fn start() -> Self {
        Self::start_with_timeout(Some(Duration::from_secs(5))).await
    }

    pub async fn start_with_timeout(call_timeout: Option<Duration>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = BridgeServer::new(ServerSettings {
            server_id: "it-bridge".to_string(),
            handshake_timeout: Duration::from_secs(2),
            call_timeout,
            policy: ProtocolPolicy::Lenient,
        });
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        Self { server, addr }
    }

    pub async fn dial(&self) -> (FrameReader, FrameWriter) {
        transport::split(TcpStream::connect(&self.addr).await.unwrap())
    }

    /// Opens a peer stream and returns it once the bridge has registered it.
    pub async fn connect_peer(&self, client_id: &str) -> (FrameReader, FrameWriter) {
        let epoch_before = self
            .server
            .registry()
            .lookup(client_id)
            .map_or(0, |queue| queue.epoch());

        let (reader, mut writer) = self.dial().await;
        writer
            .send_frame(&Frame::Hello {
                client_id: client_id.to_string(),
            })
            .await
            .unwrap();

        for _ in 0..200 {
            let registered = self
                .server
                .registry()
                .lookup(client_id)
                .is_some_and(|queue| queue.epoch() > epoch_before && queue.is_connected());
            if registered {
                return (reader, writer);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer {client_id} was never registered");
    }

    /// Connects an echo peer that answers until its task is aborted.
    pub async fn spawn_echo_peer(&self, client_id: &str) -> JoinHandle<()> {
        let (mut reader, mut writer) = self.connect_peer(client_id).await;
        let id = client_id.to_string();
        tokio::spawn(async move {
            while let Ok(Frame::Request(request)) = reader.expect_frame().await {
                let response = PeerResponse::echo(&request, id.as_str());
                if writer.send_frame(&Frame::Response(response)).await.is_err() {
                    break;
                }
            }
        })
    }

    /// One trigger on a fresh connection.
    pub async fn trigger(&self, client_id: &str, msg: &str) -> TriggerReply {
        let (mut reader, mut writer) = self.dial().await;
        writer
            .send_frame(&Frame::Trigger(TriggerRequest::new(client_id, msg)))
            .await
            .unwrap();
        match reader.expect_frame().await.unwrap() {
            Frame::TriggerResult(reply) => reply,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    pub fn stop(&self) {
        self.server.shutdown_token().cancel();
    }
}
