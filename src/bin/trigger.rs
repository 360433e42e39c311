//! Fires `n` concurrent triggers at one peer over a single connection and
//! checks every echo.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::try_join;
use tracing::{error, info};

use stream_bridge::env::ClientEnv;
use stream_bridge::message::{Frame, TriggerReply, TriggerRequest};
use stream_bridge::transport::{self, FrameReader, FrameWriter};
use stream_bridge::init_tracing;

const USAGE: &str = "usage: bridge-trigger <client-id> <msg> [n]";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let client_id = args.next().ok_or_else(|| anyhow!(USAGE))?;
    let msg = args.next().ok_or_else(|| anyhow!(USAGE))?;
    let count: u64 = match args.next() {
        Some(n) => n.parse().with_context(|| format!("invalid count '{n}'"))?,
        None => 1,
    };
    let addr = ClientEnv::load()?.server_addr;

    let stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Unable to reach bridge at {addr}"))?;
    let (reader, writer) = transport::split(stream);

    let payloads: HashMap<u64, String> = (0..count).map(|i| (i, format!("{msg}: {i}"))).collect();
    let (_, replies) = try_join(
        send_all(writer, &client_id, &payloads),
        collect_replies(reader, payloads.len()),
    )
    .await?;

    let mut failures = 0;
    for (request_id, payload) in &payloads {
        match replies.get(request_id) {
            Some(TriggerReply { error: Some(failure), .. }) => {
                failures += 1;
                error!(%payload, "trigger failed: {:?}: {}", failure.kind, failure.message);
            }
            Some(TriggerReply { msg: Some(reply), .. }) if reply == payload => info!("{}", reply),
            Some(TriggerReply { msg, .. }) => {
                failures += 1;
                error!(expected = %payload, got = ?msg, "mismatched reply");
            }
            None => {
                failures += 1;
                error!(%payload, "no reply received");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {count} triggers failed");
    }
    Ok(())
}

async fn send_all(mut writer: FrameWriter, client_id: &str, payloads: &HashMap<u64, String>) -> Result<()> {
    for (request_id, payload) in payloads {
        let trigger = TriggerRequest::new(client_id, payload.as_str()).with_request_id(*request_id);
        writer.send_frame(&Frame::Trigger(trigger)).await?;
    }
    // Dropping the writer half-closes the stream; the bridge still answers what it read.
    Ok(())
}

async fn collect_replies(mut reader: FrameReader, expected: usize) -> Result<HashMap<u64, TriggerReply>> {
    let mut replies = HashMap::with_capacity(expected);
    while replies.len() < expected {
        match reader.expect_frame().await? {
            Frame::TriggerResult(reply) => {
                let request_id = reply
                    .request_id
                    .ok_or_else(|| anyhow!("trigger result without a request id"))?;
                replies.insert(request_id, reply);
            }
            other => bail!("unexpected '{}' frame", other.kind()),
        }
    }
    Ok(replies)
}
