// In-memory connection halves for exercising the queue and pumps without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionLease, CorrelationQueue, InboundResponse, OutboundRequest, RequestSink, ResponseSource};
use crate::errors::{BridgeError, Result};

pub(crate) struct ChannelSink<Req>(mpsc::UnboundedSender<OutboundRequest<Req>>);

pub(crate) struct ChannelSource<Resp>(mpsc::UnboundedReceiver<InboundResponse<Resp>>);

pub(crate) fn channel_sink<Req>() -> (ChannelSink<Req>, mpsc::UnboundedReceiver<OutboundRequest<Req>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink(tx), rx)
}

pub(crate) fn channel_source<Resp>() -> (ChannelSource<Resp>, mpsc::UnboundedSender<InboundResponse<Resp>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSource(rx), tx)
}

#[async_trait]
impl<Req: Send + 'static> RequestSink<Req> for ChannelSink<Req> {
    async fn send(&mut self, request: OutboundRequest<Req>) -> Result<()> {
        self.0
            .send(request)
            .map_err(|_| BridgeError::TransportFailure("peer stopped reading".to_string()))
    }
}

#[async_trait]
impl<Resp: Send + 'static> ResponseSource<Resp> for ChannelSource<Resp> {
    async fn recv(&mut self) -> Result<InboundResponse<Resp>> {
        self.0
            .recv()
            .await
            .ok_or_else(|| BridgeError::TransportFailure("peer disconnected".to_string()))
    }
}

/// Simulated peer that answers every request with its own payload.
pub(crate) fn spawn_echo_peer<T: Send + 'static>(
    mut requests: mpsc::UnboundedReceiver<OutboundRequest<T>>,
    responses: mpsc::UnboundedSender<InboundResponse<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            if responses
                .send(InboundResponse::new(request.trace_id, request.request))
                .is_err()
            {
                break;
            }
        }
    })
}

/// Opens a connection on `queue` and drives it against an echoing peer.
pub(crate) fn spawn_echo_pumps<T: Send + 'static>(queue: Arc<CorrelationQueue<T, T>>) -> ConnectionLease {
    let lease = queue.open_connection();
    let (mut sink, requests) = channel_sink();
    let (mut source, responses) = channel_source();
    spawn_echo_peer(requests, responses);

    tokio::spawn({
        let (queue, lease) = (queue.clone(), lease.clone());
        async move { queue.pump_outbound(&lease, &mut sink).await }
    });
    tokio::spawn({
        let lease = lease.clone();
        async move { queue.pump_inbound(&lease, &mut source).await }
    });
    lease
}
