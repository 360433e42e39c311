use std::collections::HashSet;
use std::sync::Arc;

use stream_bridge::message::{FailureKind, Frame, TriggerReply, TriggerRequest};

use crate::TestBridge;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trigger_echoes_through_peer_a() {
    let bridge = TestBridge::start().await;
    let _peer = bridge.spawn_echo_peer("A").await;

    let reply = bridge.trigger("A", "hello").await;
    assert_eq!(reply, TriggerReply::ok("hello"));
    bridge.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_concurrent_triggers_get_their_own_replies() {
    let bridge = Arc::new(TestBridge::start().await);
    let _peer = bridge.spawn_echo_peer("A").await;

    let calls: Vec<_> = (0..100)
        .map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let payload = format!("call: {i}");
                let reply = bridge.trigger("A", &payload).await;
                (payload, reply)
            })
        })
        .collect();

    for call in calls {
        let (payload, reply) = call.await.unwrap();
        assert_eq!(reply.msg.as_deref(), Some(payload.as_str()));
        assert!(reply.error.is_none());
    }
    assert_eq!(bridge.server.registry().lookup("A").unwrap().pending_len(), 0);
    bridge.stop();
}

#[tokio::test]
async fn unknown_peer_is_reported_without_registering_it() {
    let bridge = TestBridge::start().await;

    let reply = bridge.trigger("nobody", "hello").await;
    assert!(reply.msg.is_none());
    assert_eq!(reply.error.unwrap().kind, FailureKind::PeerNotConnected);
    assert!(bridge.server.registry().is_empty());
    bridge.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_are_routed_independently() {
    let bridge = TestBridge::start().await;
    let _a = bridge.spawn_echo_peer("A").await;
    let _b = bridge.spawn_echo_peer("B").await;

    let (a, b) = tokio::join!(bridge.trigger("A", "to a"), bridge.trigger("B", "to b"));
    assert_eq!(a, TriggerReply::ok("to a"));
    assert_eq!(b, TriggerReply::ok("to b"));

    let peers = bridge.server.registry().snapshot();
    let ids: Vec<_> = peers.iter().map(|p| p.peer_id.as_str()).collect();
    assert_eq!(ids, ["A", "B"]);
    bridge.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_triggers_share_one_connection() {
    let bridge = TestBridge::start().await;
    let _peer = bridge.spawn_echo_peer("A").await;

    let (mut reader, mut writer) = bridge.dial().await;
    for i in 0..100u64 {
        let trigger = TriggerRequest::new("A", format!("multiplexed: {i}")).with_request_id(i);
        writer.send_frame(&Frame::Trigger(trigger)).await.unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..100 {
        let reply = match reader.expect_frame().await.unwrap() {
            Frame::TriggerResult(reply) => reply,
            other => panic!("unexpected frame {other:?}"),
        };
        let id = reply.request_id.unwrap();
        assert_eq!(reply.msg, Some(format!("multiplexed: {id}")));
        assert!(seen.insert(id));
    }
    assert_eq!(seen.len(), 100);
    bridge.stop();
}
