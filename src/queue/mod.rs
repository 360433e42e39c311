//! Correlation of outbound requests with inbound responses for one peer.
//!
//! A [`CorrelationQueue`] sits between any number of callers and the two
//! loops driving a single streaming connection. Callers block in
//! [`CorrelationQueue::call`] while the send loop ([`CorrelationQueue::pump_outbound`])
//! writes their requests and the receive loop ([`CorrelationQueue::pump_inbound`])
//! hands each response back to the caller whose trace id it echoes.
//!
//! ```rust,ignore
//! let queue = Arc::new(CorrelationQueue::<PeerRequest, PeerResponse>::new());
//! let lease = queue.open_connection();
//!
//! tokio::spawn({
//!     let (queue, lease) = (queue.clone(), lease.clone());
//!     async move { queue.pump_outbound(&lease, &mut sink).await }
//! });
//! tokio::spawn({
//!     let (queue, lease) = (queue.clone(), lease.clone());
//!     async move { queue.pump_inbound(&lease, &mut source).await }
//! });
//!
//! let reply = queue.call(PeerRequest::new("hello")).await?;
//! ```

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{BridgeError, Result};
use crate::trace_id::{generate_trace_id, TraceId, UNSET_TRACE_ID};

/// A request handed to the send loop, stamped with the trace id its response must echo.
#[derive(Debug)]
pub struct OutboundRequest<Req> {
    pub trace_id: TraceId,
    pub request: Req,
}

/// A response read off the wire together with the trace id it claims to answer.
#[derive(Debug)]
pub struct InboundResponse<Resp> {
    pub trace_id: TraceId,
    pub response: Resp,
}

impl<Resp> InboundResponse<Resp> {
    pub fn new(trace_id: TraceId, response: Resp) -> Self {
        Self { trace_id, response }
    }
}

/// Write half of a connection as seen by the send loop.
#[async_trait]
pub trait RequestSink<Req>: Send {
    async fn send(&mut self, request: OutboundRequest<Req>) -> Result<()>;
}

/// Read half of a connection as seen by the receive loop.
///
/// Implementations return an error once the peer has disconnected.
#[async_trait]
pub trait ResponseSource<Resp>: Send {
    async fn recv(&mut self) -> Result<InboundResponse<Resp>>;
}

/// Cancellation handle and epoch of the connection currently bound to a queue.
#[derive(Debug, Clone)]
pub struct ConnectionLease {
    epoch: u64,
    token: CancellationToken,
}

impl ConnectionLease {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests both pumps of this connection to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

type ResultSender<Resp> = oneshot::Sender<Result<Resp>>;
type ResultReceiver<Resp> = oneshot::Receiver<Result<Resp>>;

// One slot per outstanding call. The sender fires `taken` once it owns the request.
struct HandOff<Req> {
    outbound: OutboundRequest<Req>,
    taken: oneshot::Sender<()>,
}

// Late responses to this many abandoned calls are recognised and dropped quietly.
const ABANDONED_CAPACITY: usize = 1024;

struct QueueState<Resp> {
    pending: HashMap<TraceId, ResultSender<Resp>>,
    // Calls that timed out or were dropped while still pending, oldest first.
    abandoned: VecDeque<TraceId>,
    abandoned_ids: HashSet<TraceId>,
    epoch: u64,
    connection: Option<CancellationToken>,
}

impl<Resp> QueueState<Resp> {
    fn is_live(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn is_taken(&self, trace_id: TraceId) -> bool {
        self.pending.contains_key(&trace_id) || self.abandoned_ids.contains(&trace_id)
    }

    /// Drops a pending entry nobody will wait for again and remembers its id.
    fn abandon(&mut self, trace_id: TraceId) {
        if self.pending.remove(&trace_id).is_none() {
            return;
        }
        if self.abandoned.len() == ABANDONED_CAPACITY {
            if let Some(oldest) = self.abandoned.pop_front() {
                self.abandoned_ids.remove(&oldest);
            }
        }
        self.abandoned.push_back(trace_id);
        self.abandoned_ids.insert(trace_id);
    }

    fn forget_abandoned(&mut self, trace_id: TraceId) -> bool {
        if !self.abandoned_ids.remove(&trace_id) {
            return false;
        }
        self.abandoned.retain(|id| *id != trace_id);
        true
    }
}

/// Matches outbound requests to inbound responses by trace id.
///
/// The queue outlives the connections bound to it. Each connection is tagged
/// with an epoch; opening a new one while an older one is still live cancels
/// the older pumps and fails every call left over from it.
pub struct CorrelationQueue<Req, Resp> {
    handoff_tx: mpsc::Sender<HandOff<Req>>,
    handoff_rx: AsyncMutex<mpsc::Receiver<HandOff<Req>>>,
    state: Mutex<QueueState<Resp>>,
}

impl<Req, Resp> Default for CorrelationQueue<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> CorrelationQueue<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Self {
        let (handoff_tx, handoff_rx) = mpsc::channel(1);
        Self {
            handoff_tx,
            handoff_rx: AsyncMutex::new(handoff_rx),
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                abandoned: VecDeque::new(),
                abandoned_ids: HashSet::new(),
                epoch: 0,
                connection: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<Resp>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `request` and waits, without a deadline, for the response echoing its trace id.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        self.call_with_deadline(request, None).await
    }

    pub async fn call_with_timeout(&self, request: Req, timeout: Duration) -> Result<Resp> {
        self.call_with_deadline(request, Some(timeout)).await
    }

    /// Sends `request` and waits for its response, giving up after `deadline`.
    ///
    /// Fails at once with [`BridgeError::TransportFailure`] if no connection is
    /// live. The pending entry is removed however the call ends, including when
    /// the returned future is dropped.
    pub async fn call_with_deadline(&self, request: Req, deadline: Option<Duration>) -> Result<Resp> {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, self.exchange(request))
                .await
                .unwrap_or(Err(BridgeError::Timeout(limit))),
            None => self.exchange(request).await,
        }
    }

    async fn exchange(&self, request: Req) -> Result<Resp> {
        let (trace_id, mut result_rx) = self.register()?;
        let _guard = PendingGuard { queue: self, trace_id };

        let (taken_tx, taken_rx) = oneshot::channel();
        let handoff = HandOff {
            outbound: OutboundRequest { trace_id, request },
            taken: taken_tx,
        };
        let handed_off = async {
            self.handoff_tx.send(handoff).await.map_err(|_| {
                BridgeError::TransportFailure("outbound hand-off is closed".to_string())
            })?;
            taken_rx.await.map_err(|_| {
                BridgeError::TransportFailure(format!(
                    "request {trace_id} was dropped before it was sent"
                ))
            })
        };

        // A failed connection may settle the call before any send loop took it.
        tokio::select! {
            delivered = &mut result_rx => return settle(trace_id, delivered),
            sent = handed_off => sent?,
        }
        trace!(trace_id, "request handed off, awaiting response");

        settle(trace_id, result_rx.await)
    }

    // Registration and `close_connection` share the lock, so a call either
    // sees no live connection or is failed when that connection closes.
    fn register(&self) -> Result<(TraceId, ResultReceiver<Resp>)> {
        let (result_tx, result_rx) = oneshot::channel();
        let mut state = self.state();
        if !state.is_live() {
            return Err(BridgeError::TransportFailure(
                "no live connection".to_string(),
            ));
        }
        let trace_id = generate_trace_id(|candidate| state.is_taken(candidate));
        state.pending.insert(trace_id, result_tx);
        Ok((trace_id, result_rx))
    }

    fn is_pending(&self, trace_id: TraceId) -> bool {
        self.state().pending.contains_key(&trace_id)
    }

    /// Send loop: drains handed-off requests into `sink` until the lease is
    /// cancelled (returns `Ok`) or the sink fails (returns the sink's error).
    pub async fn pump_outbound<S>(&self, lease: &ConnectionLease, sink: &mut S) -> Result<()>
    where
        S: RequestSink<Req> + ?Sized,
    {
        let mut handoff_rx = tokio::select! {
            biased;
            _ = lease.token.cancelled() => return Ok(()),
            rx = self.handoff_rx.lock() => rx,
        };

        loop {
            let HandOff { outbound, taken } = tokio::select! {
                biased;
                _ = lease.token.cancelled() => return Ok(()),
                next = handoff_rx.recv() => match next {
                    Some(handoff) => handoff,
                    None => return Ok(()),
                },
            };

            if !self.is_pending(outbound.trace_id) {
                debug!(trace_id = outbound.trace_id, "dropping request abandoned by its caller");
                continue;
            }
            let _ = taken.send(());

            let trace_id = outbound.trace_id;
            tokio::select! {
                biased;
                _ = lease.token.cancelled() => return Ok(()),
                sent = sink.send(outbound) => {
                    if let Err(err) = sent {
                        debug!(trace_id, error = %err, "send loop stopped");
                        return Err(err);
                    }
                }
            }
            trace!(trace_id, epoch = lease.epoch, "request sent");
        }
    }

    /// Receive loop: resolves pending calls from `source` until the lease is
    /// cancelled (returns `Ok`), the source fails, or a response violates the protocol.
    ///
    /// A protocol violation leaves every other pending call untouched, so the
    /// caller may log it and resume the loop.
    pub async fn pump_inbound<S>(&self, lease: &ConnectionLease, source: &mut S) -> Result<()>
    where
        S: ResponseSource<Resp> + ?Sized,
    {
        loop {
            let inbound = tokio::select! {
                biased;
                _ = lease.token.cancelled() => return Ok(()),
                next = source.recv() => match next {
                    Ok(inbound) => inbound,
                    Err(err) => {
                        debug!(error = %err, "receive loop stopped");
                        return Err(err);
                    }
                },
            };
            self.resolve(lease.epoch, inbound)?;
        }
    }

    /// Delivers one response to the call waiting on its trace id.
    ///
    /// A late response to a call that already timed out or was dropped is
    /// discarded. Any other unknown trace id is a protocol violation.
    pub fn resolve(&self, epoch: u64, inbound: InboundResponse<Resp>) -> Result<()> {
        let InboundResponse { trace_id, response } = inbound;
        if trace_id == UNSET_TRACE_ID {
            return Err(BridgeError::ProtocolViolation(
                "response does not carry a trace id".to_string(),
            ));
        }

        let (sender, abandoned) = {
            let mut state = self.state();
            if state.epoch != epoch {
                return Err(BridgeError::Superseded);
            }
            let sender = state.pending.remove(&trace_id);
            let abandoned = sender.is_none() && state.forget_abandoned(trace_id);
            (sender, abandoned)
        };

        match sender {
            Some(sender) => {
                if sender.send(Ok(response)).is_err() {
                    trace!(trace_id, "caller went away before its response arrived");
                }
                Ok(())
            }
            None if abandoned => {
                debug!(trace_id, "discarding late response to an abandoned call");
                Ok(())
            }
            None => Err(BridgeError::ProtocolViolation(format!(
                "no pending call for trace id {trace_id}"
            ))),
        }
    }

    /// Binds a new connection to this queue.
    ///
    /// If another connection is still live it is cancelled and every pending
    /// call fails with [`BridgeError::Superseded`].
    pub fn open_connection(&self) -> ConnectionLease {
        let token = CancellationToken::new();
        let (epoch, stale) = {
            let mut state = self.state();
            state.epoch += 1;
            let stale: Vec<ResultSender<Resp>> = match state.connection.replace(token.clone()) {
                Some(previous) => {
                    previous.cancel();
                    state.pending.drain().map(|(_, sender)| sender).collect()
                }
                None => Vec::new(),
            };
            (state.epoch, stale)
        };

        if !stale.is_empty() {
            debug!(epoch, failed = stale.len(), "failing calls left by superseded connection");
        }
        for sender in stale {
            let _ = sender.send(Err(BridgeError::Superseded));
        }
        ConnectionLease { epoch, token }
    }

    /// Ends connection `epoch` and fails every pending call with `error`.
    ///
    /// Does nothing if `epoch` has already been superseded. Returns the number
    /// of calls failed.
    pub fn close_connection(&self, epoch: u64, error: BridgeError) -> usize {
        let failed: Vec<ResultSender<Resp>> = {
            let mut state = self.state();
            if state.epoch != epoch {
                return 0;
            }
            if let Some(token) = state.connection.take() {
                token.cancel();
            }
            state.pending.drain().map(|(_, sender)| sender).collect()
        };

        let count = failed.len();
        for sender in failed {
            let _ = sender.send(Err(error.clone()));
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_live()
    }
}

fn settle<Resp>(
    trace_id: TraceId,
    delivered: std::result::Result<Result<Resp>, oneshot::error::RecvError>,
) -> Result<Resp> {
    delivered.unwrap_or_else(|_| {
        Err(BridgeError::TransportFailure(format!(
            "pending call {trace_id} was dropped without a response"
        )))
    })
}

struct PendingGuard<'a, Req, Resp> {
    queue: &'a CorrelationQueue<Req, Resp>,
    trace_id: TraceId,
}

impl<Req, Resp> Drop for PendingGuard<'_, Req, Resp> {
    fn drop(&mut self) {
        self.queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abandon(self.trace_id);
    }
}
