//! Newline-delimited JSON framing over TCP.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::errors::{BridgeError, Result};
use crate::message::{Frame, PeerRequest, PeerResponse};
use crate::queue::{InboundResponse, OutboundRequest, RequestSink, ResponseSource};

/// Longest line accepted from the other side, newline included.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct FrameReader {
    reader: BufReader<OwnedReadHalf>,
    // Partial line carried across cancelled reads.
    line: Vec<u8>,
}

pub struct FrameWriter {
    writer: OwnedWriteHalf,
}

/// Splits a connection so the send and receive loops can run independently.
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FrameReader {
            reader: BufReader::new(read_half),
            line: Vec::new(),
        },
        FrameWriter { writer: write_half },
    )
}

impl FrameReader {
    /// Next frame, or `None` once the other side closed the stream cleanly.
    /// Blank lines are skipped.
    ///
    /// Cancel safe. A line longer than [`MAX_FRAME_LEN`] is a transport
    /// failure, since the stream cannot be resynchronised after it.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let budget = (MAX_FRAME_LEN + 1).saturating_sub(self.line.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.line)
                .await?;
            let at_eof = read == 0;

            if !at_eof && self.line.last() != Some(&b'\n') {
                if self.line.len() > MAX_FRAME_LEN {
                    self.line.clear();
                    return Err(BridgeError::TransportFailure(format!(
                        "frame exceeds {MAX_FRAME_LEN} bytes"
                    )));
                }
                continue;
            }
            if at_eof && self.line.is_empty() {
                return Ok(None);
            }

            let raw = std::mem::take(&mut self.line);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(line, "frame received");
            return Frame::decode(line).map(Some);
        }
    }

    /// Like [`FrameReader::next_frame`] but treats end-of-stream as a disconnect.
    pub async fn expect_frame(&mut self) -> Result<Frame> {
        self.next_frame()
            .await?
            .ok_or_else(|| BridgeError::TransportFailure("peer disconnected".to_string()))
    }
}

impl FrameWriter {
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut line = frame.encode()?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Server-side write half of a peer stream.
pub struct PeerStreamSink {
    writer: FrameWriter,
}

impl PeerStreamSink {
    pub fn new(writer: FrameWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl RequestSink<PeerRequest> for PeerStreamSink {
    async fn send(&mut self, outbound: OutboundRequest<PeerRequest>) -> Result<()> {
        let mut request = outbound.request;
        request.trace_id = outbound.trace_id;
        self.writer.send_frame(&Frame::Request(request)).await
    }
}

/// Server-side read half of a peer stream.
pub struct PeerStreamSource {
    reader: FrameReader,
}

impl PeerStreamSource {
    pub fn new(reader: FrameReader) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl ResponseSource<PeerResponse> for PeerStreamSource {
    async fn recv(&mut self) -> Result<InboundResponse<PeerResponse>> {
        match self.reader.expect_frame().await {
            Ok(Frame::Response(response)) => Ok(InboundResponse::new(response.trace_id, response)),
            Ok(other) => Err(BridgeError::ProtocolViolation(format!(
                "expected a response frame, got {}",
                other.kind()
            ))),
            Err(BridgeError::Serialization(reason)) => Err(BridgeError::ProtocolViolation(
                format!("malformed frame: {reason}"),
            )),
            Err(err) => Err(err),
        }
    }
}
