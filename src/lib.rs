//! Bridges synchronous-looking calls onto long-lived peer streams.
//!
//! Peers dial in and keep one bidirectional stream open. Callers issue a
//! trigger naming a peer, the request is pushed down that peer's stream, and
//! the caller blocks until the response carrying the same trace id comes back.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod env;
pub mod errors;
pub mod message;
pub mod pump;
pub mod queue;
pub mod registry;
pub mod server;
pub mod trace_id;
pub mod transport;

pub use dispatcher::CallDispatcher;
pub use errors::{BridgeError, Result};
pub use pump::{ProtocolPolicy, PumpOutcome, PumpState, StreamPump};
pub use queue::{ConnectionLease, CorrelationQueue, RequestSink, ResponseSource};
pub use registry::{PeerRegistry, PeerSummary};
pub use server::{BridgeServer, ServerSettings};
pub use trace_id::TraceId;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
