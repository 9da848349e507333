//! Cross-module scenario: two engines talking over real loopback UDP.
#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use iax2::{EngineConfig, IaxEngine, IaxEvent, TransactionKind};
use iax2::ie::IaxIeList;

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

/// S1: outbound Poke reaches a second engine over the wire, which answers
/// with Pong automatically, terminating the originating transaction.
#[tokio::test]
async fn s1_poke_round_trip_between_two_engines() {
    let (engine_a, _media_a) = IaxEngine::bind(loopback(0), EngineConfig::default(), iax2::codec::ULAW, iax2::codec::ULAW)
        .await
        .expect("engine_a binds");
    let (engine_b, _media_b) = IaxEngine::bind(loopback(0), EngineConfig::default(), iax2::codec::ULAW, iax2::codec::ULAW)
        .await
        .expect("engine_b binds");
    let addr_b = engine_b.local_addr().expect("engine_b has a local addr");

    tokio::spawn(engine_a.clone().run_recv_loop());
    tokio::spawn(engine_b.clone().run_recv_loop());

    let poke = engine_a
        .originate(TransactionKind::Poke, addr_b, IaxIeList::new(), Instant::now())
        .expect("call number available");
    let local_call_no = poke.local_call_no();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut terminated = false;
    while Instant::now() < deadline {
        for (call_no, event) in engine_a.poll_events(Instant::now()) {
            if call_no == local_call_no && event == IaxEvent::Terminated {
                terminated = true;
            }
        }
        if terminated {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(terminated, "poke transaction did not reach Terminated within the deadline");
    assert!(engine_b.active_transaction_count() >= 1, "engine_b should have created an inbound transaction for the poke");
}

/// S2: a full New/Accept handshake reaches Connected on both ends, then
/// media sent with `send_media` arrives at the peer both as a resync full
/// Voice frame (the first call, since `last_mini_frame_out` starts past any
/// real timestamp) and as a steady-state mini-frame (the next call) —
/// exercising both the mini-frame routing table and the shared media
/// baseline gating between full and mini frames.
#[tokio::test]
async fn s2_voice_media_round_trips_as_full_then_mini_frame() {
    let (engine_a, _media_a) = IaxEngine::bind(loopback(0), EngineConfig::default(), iax2::codec::ULAW, iax2::codec::ULAW)
        .await
        .expect("engine_a binds");
    let (engine_b, mut media_b) = IaxEngine::bind(loopback(0), EngineConfig::default(), iax2::codec::ULAW, iax2::codec::ULAW)
        .await
        .expect("engine_b binds");
    let addr_b = engine_b.local_addr().expect("engine_b has a local addr");

    tokio::spawn(engine_a.clone().run_recv_loop());
    tokio::spawn(engine_b.clone().run_recv_loop());

    let txn_a = engine_a
        .originate(TransactionKind::New, addr_b, IaxIeList::new(), Instant::now())
        .expect("call number available");
    let call_no_a = txn_a.local_call_no();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut call_no_b = None;
    while Instant::now() < deadline && call_no_b.is_none() {
        for (call_no, event) in engine_b.poll_events(Instant::now()) {
            if matches!(event, IaxEvent::New(_)) {
                call_no_b = Some(call_no);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let call_no_b = call_no_b.expect("engine_b observed an inbound New");
    let txn_b = engine_b.transaction(call_no_b).expect("transaction still live");
    assert!(txn_b.send_accept(Instant::now()));

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut connected = false;
    while Instant::now() < deadline && !connected {
        for (call_no, event) in engine_a.poll_events(Instant::now()) {
            if call_no == call_no_a && matches!(event, IaxEvent::Accept(_)) {
                connected = true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connected, "engine_a did not reach Connected");

    // First send: last_mini_frame_out starts at 0xFFFF, so this resyncs via
    // a full Voice frame.
    txn_a.send_media(b"voice-frame-1", iax2::codec::ULAW, Instant::now());
    let first = tokio::time::timeout(Duration::from_secs(2), media_b.recv())
        .await
        .expect("media arrives before timeout")
        .expect("media channel open");
    assert_eq!(first.0, call_no_b);
    assert_eq!(first.1, call_no_a);
    assert_eq!(first.2.as_slice(), b"voice-frame-1");

    tokio::time::sleep(Duration::from_millis(5)).await;

    // Second send: the timestamp has advanced past last_mini_frame_out, so
    // this goes out as a bare mini-frame, routed purely by the peer's own
    // call number.
    txn_a.send_media(b"voice-frame-2", iax2::codec::ULAW, Instant::now());
    let second = tokio::time::timeout(Duration::from_secs(2), media_b.recv())
        .await
        .expect("mini-frame media arrives before timeout")
        .expect("media channel open");
    assert_eq!(second.0, call_no_b);
    assert_eq!(second.1, call_no_a);
    assert_eq!(second.2.as_slice(), b"voice-frame-2");
}
