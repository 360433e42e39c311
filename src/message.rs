use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, Result};
use crate::trace_id::{TraceId, UNSET_TRACE_ID};

/// One line on the wire. Every connection speaks newline-delimited JSON,
/// tagged by `"type"`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of a peer's streaming connection.
    Hello { client_id: String },
    Request(PeerRequest),
    Response(PeerResponse),
    Trigger(TriggerRequest),
    TriggerResult(TriggerReply),
}

/// Request pushed to a peer over its stream.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PeerRequest {
    #[serde(default)]
    pub trace_id: TraceId,
    pub n: String,
}

/// Peer's answer. `trace_id` must echo the request's.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PeerResponse {
    #[serde(default)]
    pub trace_id: TraceId,
    pub id: String,
    pub n: String,
}

/// A blocking call against `client_id`. Several may be in flight on one
/// connection; `request_id` is echoed so the caller can match replies.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TriggerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub client_id: String,
    pub msg: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TriggerReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TriggerFailure>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PeerNotConnected,
    TransportFailure,
    ProtocolViolation,
    Timeout,
    Superseded,
    Other,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TriggerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Request(_) => "request",
            Frame::Response(_) => "response",
            Frame::Trigger(_) => "trigger",
            Frame::TriggerResult(_) => "trigger_result",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

impl PeerRequest {
    /// A request whose trace id is stamped by the send loop.
    pub fn new(n: impl Into<String>) -> Self {
        Self {
            trace_id: UNSET_TRACE_ID,
            n: n.into(),
        }
    }
}

impl PeerResponse {
    /// Echo of `request` from peer `id`.
    pub fn echo(request: &PeerRequest, id: impl Into<String>) -> Self {
        Self {
            trace_id: request.trace_id,
            id: id.into(),
            n: request.n.clone(),
        }
    }
}

impl TriggerRequest {
    pub fn new(client_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            request_id: None,
            client_id: client_id.into(),
            msg: msg.into(),
        }
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

impl TriggerReply {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            request_id: None,
            msg: Some(msg.into()),
            error: None,
        }
    }

    pub fn failed(error: &BridgeError) -> Self {
        Self {
            request_id: None,
            msg: None,
            error: Some(TriggerFailure::from(error)),
        }
    }

    /// Tags the reply with the id of the trigger it answers.
    pub fn answering(mut self, request_id: Option<u64>) -> Self {
        self.request_id = request_id;
        self
    }
}

impl From<&BridgeError> for TriggerFailure {
    fn from(error: &BridgeError) -> Self {
        let kind = match error {
            BridgeError::PeerNotConnected(_) => FailureKind::PeerNotConnected,
            BridgeError::TransportFailure(_) => FailureKind::TransportFailure,
            BridgeError::ProtocolViolation(_) => FailureKind::ProtocolViolation,
            BridgeError::Timeout(_) => FailureKind::Timeout,
            BridgeError::Superseded => FailureKind::Superseded,
            BridgeError::Serialization(_) | BridgeError::Handshake(_) => FailureKind::Other,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }
}
