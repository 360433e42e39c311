use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{BridgeError, Result};
use crate::queue::{ConnectionLease, CorrelationQueue, RequestSink, ResponseSource};

/// Lifecycle of one streaming connection. There is no way back to `Active`
/// without a fresh connection and a fresh pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// What the receive loop does with a response it cannot match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolPolicy {
    /// Log and keep receiving. Late answers to timed-out calls land here.
    #[default]
    Lenient,
    /// Close the connection.
    Strict,
}

#[derive(Debug, Clone)]
pub enum PumpOutcome {
    /// The lease was cancelled from outside.
    Cancelled,
    /// A newer connection from the same peer took over the queue.
    Superseded,
    Failed(BridgeError),
}

impl fmt::Display for PumpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpOutcome::Cancelled => write!(f, "cancelled"),
            PumpOutcome::Superseded => write!(f, "superseded"),
            PumpOutcome::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Binds one connection to one [`CorrelationQueue`] and drives its send and
/// receive loops until the connection ends.
///
/// The pump does not own the queue. When it stops, every call still waiting
/// on the connection is failed so no caller stays parked on a dead stream.
pub struct StreamPump<Req, Resp> {
    peer_id: String,
    connection_id: Uuid,
    queue: Arc<CorrelationQueue<Req, Resp>>,
    lease: ConnectionLease,
    policy: ProtocolPolicy,
    state_tx: watch::Sender<PumpState>,
}

impl<Req, Resp> StreamPump<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(peer_id: impl Into<String>, queue: Arc<CorrelationQueue<Req, Resp>>, lease: ConnectionLease) -> Self {
        let (state_tx, _) = watch::channel(PumpState::Connecting);
        Self {
            peer_id: peer_id.into(),
            connection_id: Uuid::new_v4(),
            queue,
            lease,
            policy: ProtocolPolicy::default(),
            state_tx,
        }
    }

    pub fn with_policy(mut self, policy: ProtocolPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn lease(&self) -> &ConnectionLease {
        &self.lease
    }

    pub fn state(&self) -> PumpState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PumpState> {
        self.state_tx.subscribe()
    }

    /// Runs both loops until cancellation, supersession or an I/O failure.
    pub async fn run<S, R>(self, mut sink: S, mut source: R) -> PumpOutcome
    where
        S: RequestSink<Req>,
        R: ResponseSource<Resp>,
    {
        self.state_tx.send_replace(PumpState::Active);
        info!(
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            epoch = self.lease.epoch(),
            "stream active"
        );

        let outcome = tokio::select! {
            sent = self.queue.pump_outbound(&self.lease, &mut sink) => self.outcome_of(sent),
            received = self.receive(&mut source) => received,
        };
        self.state_tx.send_replace(PumpState::Closing);

        let failure = match &outcome {
            PumpOutcome::Failed(err) => err.clone(),
            _ => BridgeError::TransportFailure("connection closed".to_string()),
        };
        let failed = self.queue.close_connection(self.lease.epoch(), failure);
        if failed > 0 {
            warn!(
                peer_id = %self.peer_id,
                connection_id = %self.connection_id,
                failed,
                "failed calls still waiting on closed stream"
            );
        }

        self.state_tx.send_replace(PumpState::Closed);
        info!(
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            %outcome,
            "stream closed"
        );
        outcome
    }

    async fn receive<R>(&self, source: &mut R) -> PumpOutcome
    where
        R: ResponseSource<Resp>,
    {
        loop {
            let received = self.queue.pump_inbound(&self.lease, source).await;
            match received {
                Err(err) if err.is_protocol_violation() && self.policy == ProtocolPolicy::Lenient => {
                    warn!(
                        peer_id = %self.peer_id,
                        connection_id = %self.connection_id,
                        error = %err,
                        "ignoring unmatched response"
                    );
                }
                other => return self.outcome_of(other),
            }
        }
    }

    fn outcome_of(&self, result: Result<()>) -> PumpOutcome {
        match result {
            Ok(()) if self.queue.epoch() != self.lease.epoch() => PumpOutcome::Superseded,
            Ok(()) => PumpOutcome::Cancelled,
            Err(BridgeError::Superseded) => PumpOutcome::Superseded,
            Err(err) => {
                debug!(peer_id = %self.peer_id, error = %err, "stream loop failed");
                PumpOutcome::Failed(err)
            }
        }
    }
}
