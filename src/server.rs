//! Accepts peer streams and trigger calls on one TCP listener.
//!
//! The first frame on a connection decides its role: `hello` binds the
//! connection to the peer's correlation queue and pumps it, `trigger` turns
//! it into a caller that issues blocking calls through the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dispatcher::CallDispatcher;
use crate::errors::{BridgeError, Result};
use crate::message::{Frame, PeerRequest, PeerResponse, TriggerReply, TriggerRequest};
use crate::pump::{ProtocolPolicy, StreamPump};
use crate::registry::PeerRegistry;
use crate::transport::{self, FrameReader, FrameWriter, PeerStreamSink, PeerStreamSource};

pub type BridgeRegistry = PeerRegistry<PeerRequest, PeerResponse>;
pub type BridgeDispatcher = CallDispatcher<PeerRequest, PeerResponse>;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub server_id: String,
    pub handshake_timeout: Duration,
    pub call_timeout: Option<Duration>,
    pub policy: ProtocolPolicy,
}

impl From<&BridgeConfig> for ServerSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            server_id: config.server.server_id.clone(),
            handshake_timeout: config.handshake_timeout(),
            call_timeout: config.call_timeout(),
            policy: config.protocol_policy(),
        }
    }
}

#[derive(Clone)]
pub struct BridgeServer {
    settings: ServerSettings,
    registry: Arc<BridgeRegistry>,
    dispatcher: BridgeDispatcher,
    shutdown: CancellationToken,
}

impl BridgeServer {
    pub fn new(settings: ServerSettings) -> Self {
        let registry = Arc::new(BridgeRegistry::new());
        let dispatcher = CallDispatcher::new(registry.clone(), settings.call_timeout);
        Self {
            settings,
            registry,
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<BridgeRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &BridgeDispatcher {
        &self.dispatcher
    }

    /// Cancelling this token stops the accept loop and every live connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            server_id = %self.settings.server_id,
            addr = %listener.local_addr()?,
            "bridge listening"
        );

        loop {
            let (stream, remote) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    warn!(%remote, error = %err, "connection ended with error");
                }
            });
        }

        info!(server_id = %self.settings.server_id, "bridge stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = transport::split(stream);

        let first = tokio::time::timeout(self.settings.handshake_timeout, reader.next_frame())
            .await
            .map_err(|_| {
                BridgeError::Handshake(format!(
                    "no frame received within {:?}",
                    self.settings.handshake_timeout
                ))
            })??;

        match first {
            None => Ok(()),
            Some(Frame::Hello { client_id }) => self.serve_stream(client_id, reader, writer).await,
            Some(Frame::Trigger(trigger)) => self.serve_triggers(trigger, reader, writer).await,
            Some(other) => Err(BridgeError::Handshake(format!(
                "unexpected first frame '{}'",
                other.kind()
            ))),
        }
    }

    async fn serve_stream(&self, client_id: String, reader: FrameReader, writer: FrameWriter) -> Result<()> {
        if client_id.trim().is_empty() {
            return Err(BridgeError::Handshake("client_id not found".to_string()));
        }
        info!(server_id = %self.settings.server_id, peer_id = %client_id, "client connected");

        let (queue, lease) = self.registry.connect(&client_id);
        let pump = StreamPump::new(client_id, queue, lease.clone()).with_policy(self.settings.policy);

        let shutdown = self.shutdown.clone();
        let watched = lease.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => watched.cancel(),
                _ = watched.token().cancelled() => {}
            }
        });

        pump.run(PeerStreamSink::new(writer), PeerStreamSource::new(reader))
            .await;
        // Releases the shutdown watcher.
        lease.cancel();
        Ok(())
    }

    /// Runs every trigger on this connection concurrently and writes each
    /// reply as soon as it is ready. Replies carry the trigger's `request_id`.
    ///
    /// Calls still running when the connection or the server goes away are
    /// aborted with it.
    async fn serve_triggers(
        &self,
        first: TriggerRequest,
        mut reader: FrameReader,
        mut writer: FrameWriter,
    ) -> Result<()> {
        let mut calls = JoinSet::new();
        self.spawn_trigger(&mut calls, first);
        let mut reading = true;

        while reading || !calls.is_empty() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                Some(joined) = calls.join_next(), if !calls.is_empty() => match joined {
                    Ok(reply) => writer.send_frame(&Frame::TriggerResult(reply)).await?,
                    Err(err) => warn!(error = %err, "trigger task failed"),
                },
                frame = reader.next_frame(), if reading => match frame? {
                    None => reading = false,
                    Some(Frame::Trigger(trigger)) => self.spawn_trigger(&mut calls, trigger),
                    Some(other) => {
                        return Err(BridgeError::ProtocolViolation(format!(
                            "expected a trigger frame, got '{}'",
                            other.kind()
                        )))
                    }
                },
            }
        }
        Ok(())
    }

    fn spawn_trigger(&self, calls: &mut JoinSet<TriggerReply>, trigger: TriggerRequest) {
        let server = self.clone();
        calls.spawn(async move { server.trigger(trigger).await });
    }

    async fn trigger(&self, trigger: TriggerRequest) -> TriggerReply {
        let TriggerRequest { request_id, client_id, msg } = trigger;
        debug!(server_id = %self.settings.server_id, peer_id = %client_id, ?request_id, %msg, "trigger");

        let reply = match self.dispatcher.trigger(&client_id, PeerRequest::new(msg)).await {
            Ok(response) => TriggerReply::ok(response.n),
            Err(err) => {
                debug!(peer_id = %client_id, error = %err, "trigger failed");
                TriggerReply::failed(&err)
            }
        };
        reply.answering(request_id)
    }
}
