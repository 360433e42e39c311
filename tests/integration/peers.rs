use std::sync::Arc;
use std::time::Duration;

use stream_bridge::message::{FailureKind, Frame, TriggerReply};

use crate::TestBridge;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_disconnect_fails_the_waiting_trigger() {
    let bridge = Arc::new(TestBridge::start_with_timeout(None).await);
    let (mut reader, writer) = bridge.connect_peer("A").await;

    let caller = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.trigger("A", "never answered").await })
    };

    // Read the request, then drop the stream without answering.
    let frame = reader.expect_frame().await.unwrap();
    assert!(matches!(frame, Frame::Request(ref request) if request.n == "never answered"));
    drop((reader, writer));

    let reply = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.error.unwrap().kind, FailureKind::TransportFailure);

    let queue = bridge.server.registry().lookup("A").unwrap();
    assert_eq!(queue.pending_len(), 0);
    assert!(!queue.is_connected());

    let after = bridge.trigger("A", "anyone?").await;
    assert_eq!(after.error.unwrap().kind, FailureKind::PeerNotConnected);
    bridge.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_supersedes_the_previous_stream() {
    let bridge = Arc::new(TestBridge::start_with_timeout(None).await);
    let (mut stale_reader, _stale_writer) = bridge.connect_peer("A").await;

    let caller = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.trigger("A", "first").await })
    };
    assert!(matches!(stale_reader.expect_frame().await.unwrap(), Frame::Request(_)));

    let _peer = bridge.spawn_echo_peer("A").await;

    let reply = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.error.unwrap().kind, FailureKind::Superseded);

    // The old stream is closed by the bridge.
    assert!(stale_reader.next_frame().await.unwrap_or(None).is_none());

    assert_eq!(bridge.trigger("A", "second").await, TriggerReply::ok("second"));
    assert_eq!(bridge.server.registry().len(), 1);
    bridge.stop();
}

#[tokio::test]
async fn trigger_times_out_when_the_peer_stays_silent() {
    let bridge = TestBridge::start_with_timeout(Some(Duration::from_millis(200))).await;
    let (_reader, _writer) = bridge.connect_peer("A").await;

    let reply = bridge.trigger("A", "anyone there").await;
    assert_eq!(reply.error.unwrap().kind, FailureKind::Timeout);
    assert_eq!(bridge.server.registry().lookup("A").unwrap().pending_len(), 0);
    bridge.stop();
}

#[tokio::test]
async fn silent_connection_is_dropped_after_the_handshake_timeout() {
    let bridge = TestBridge::start().await;
    let (mut reader, _writer) = bridge.dial().await;

    let closed = tokio::time::timeout(Duration::from_secs(5), reader.next_frame())
        .await
        .unwrap();
    assert!(closed.unwrap_or(None).is_none());
    bridge.stop();
}
