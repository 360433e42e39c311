use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::errors::{BridgeError, Result};
use crate::registry::PeerRegistry;

/// Synchronous-looking entry point: one blocking call against a connected peer.
pub struct CallDispatcher<Req, Resp> {
    registry: Arc<PeerRegistry<Req, Resp>>,
    call_timeout: Option<Duration>,
}

impl<Req, Resp> Clone for CallDispatcher<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<Req, Resp> CallDispatcher<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(registry: Arc<PeerRegistry<Req, Resp>>, call_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry<Req, Resp>> {
        &self.registry
    }

    /// Sends `payload` to `peer_id` and waits for the matching response.
    ///
    /// Fails with [`BridgeError::PeerNotConnected`] without touching the
    /// registry if the peer never connected or its stream is down.
    #[instrument(level = "debug", skip(self, payload))]
    pub async fn trigger(&self, peer_id: &str, payload: Req) -> Result<Resp> {
        let queue = self
            .registry
            .lookup(peer_id)
            .filter(|queue| queue.is_connected())
            .ok_or_else(|| BridgeError::PeerNotConnected(peer_id.to_string()))?;

        let result = queue.call_with_deadline(payload, self.call_timeout).await;
        if let Err(err) = &result {
            debug!(error = %err, "trigger failed");
        }
        result
    }
}
