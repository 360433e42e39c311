use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::queue::{ConnectionLease, CorrelationQueue};

struct PeerEntry<Req, Resp> {
    queue: Arc<CorrelationQueue<Req, Resp>>,
    first_seen: DateTime<Utc>,
}

/// Point-in-time view of one registered peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub first_seen: DateTime<Utc>,
    pub connected: bool,
    pub pending: usize,
}

/// Maps peer identifiers to their correlation queues.
///
/// Owned explicitly and shared by handle between the connection-accept path
/// and the dispatch path. Entries are created on first connection and kept
/// for the registry's lifetime, so a reconnecting peer reuses its queue under
/// a new connection epoch.
pub struct PeerRegistry<Req, Resp> {
    peers: RwLock<HashMap<String, PeerEntry<Req, Resp>>>,
}

impl<Req, Resp> Default for PeerRegistry<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> PeerRegistry<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the queue for `peer_id`, creating it if this peer was never seen.
    ///
    /// Concurrent callers for the same new id all observe the same instance.
    pub fn get_or_create(&self, peer_id: &str) -> Arc<CorrelationQueue<Req, Resp>> {
        if let Some(queue) = self.lookup(peer_id) {
            return queue;
        }

        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let entry = peers.entry(peer_id.to_string()).or_insert_with(|| {
            debug!(peer_id, "registering new peer");
            PeerEntry {
                queue: Arc::new(CorrelationQueue::new()),
                first_seen: Utc::now(),
            }
        });
        entry.queue.clone()
    }

    /// Read-only lookup. Never creates an entry.
    pub fn lookup(&self, peer_id: &str) -> Option<Arc<CorrelationQueue<Req, Resp>>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .map(|entry| entry.queue.clone())
    }

    /// Registers a new connection for `peer_id` and returns its queue and lease.
    ///
    /// A connection still live for the same peer is superseded.
    pub fn connect(&self, peer_id: &str) -> (Arc<CorrelationQueue<Req, Resp>>, ConnectionLease) {
        let queue = self.get_or_create(peer_id);
        let lease = queue.open_connection();
        info!(peer_id, epoch = lease.epoch(), peers = self.len(), "peer connected");
        (queue, lease)
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PeerSummary> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<PeerSummary> = peers
            .iter()
            .map(|(peer_id, entry)| PeerSummary {
                peer_id: peer_id.clone(),
                first_seen: entry.first_seen,
                connected: entry.queue.is_connected(),
                pending: entry.queue.pending_len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        summaries
    }
}
