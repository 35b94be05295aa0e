//! End-to-end coverage of the per-client RTR session against an in-process
//! server, driven over a `tokio::io::duplex` pair instead of a real socket.

use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use rtrd::metrics::RtrServerMetrics;
use rtrd::payload::{self, VrpSet};
use rtrd::rtr::pdu::{Pdu, Timing};
use rtrd::rtr::serial::Serial;
use rtrd::rtr::session::{run, SessionConfig};
use rtrd::vrp::{Prefix, Vrp};

fn vrp(prefix: &str, asn: u32, max: u8) -> Vrp {
    Vrp::new(Prefix::from_str(prefix).unwrap(), asn, max).unwrap()
}

fn session_config() -> SessionConfig {
    SessionConfig { timing: Timing { refresh: 3600, retry: 600, expire: 7200 }, protocol: 1 }
}

async fn send(client: &mut tokio::io::DuplexStream, pdu: Pdu) {
    let mut buf = BytesMut::new();
    pdu.encode(&mut buf);
    client.write_all(&buf).await.unwrap();
}

async fn recv_one(client: &mut tokio::io::DuplexStream, buf: &mut BytesMut) -> Pdu {
    loop {
        if let Some(pdu) = Pdu::decode(buf).unwrap() {
            return pdu;
        }
        let mut scratch = [0u8; 4096];
        let n = timeout(Duration::from_secs(5), client.read(&mut scratch))
            .await
            .expect("timed out waiting for a PDU")
            .unwrap();
        assert!(n > 0, "server closed the connection early");
        buf.extend_from_slice(&scratch[..n]);
    }
}

#[tokio::test]
async fn reset_query_sends_full_snapshot() {
    let history = payload::shared(7, 3);
    {
        let mut history = history.write().await;
        let set: VrpSet = vec![
            vrp("10.0.0.0/24", 64496, 24),
            vrp("2001:db8::/32", 64497, 48),
        ]
        .into_iter()
        .collect();
        history.update(set, "2024-01-01T00:00:00Z".to_string());
    }
    let (notifier, listener) = rtrd::rtr::channel(Serial(0));
    let (mut client, server_side) = tokio::io::duplex(8192);

    tokio::spawn(run(
        server_side,
        "test-peer".to_string(),
        history,
        listener,
        RtrServerMetrics::default(),
        session_config(),
    ));
    let _ = &notifier;

    send(&mut client, Pdu::ResetQuery { version: 1 }).await;

    let mut buf = BytesMut::new();
    match recv_one(&mut client, &mut buf).await {
        Pdu::CacheResponse { version, session } => {
            assert_eq!(version, 1);
            assert_eq!(session, 7);
        }
        other => panic!("expected CacheResponse, got {:?}", other),
    }

    let mut prefixes = Vec::new();
    loop {
        match recv_one(&mut client, &mut buf).await {
            Pdu::Prefix { vrp, .. } => prefixes.push(vrp),
            Pdu::EndOfData { serial, timing, .. } => {
                assert_eq!(serial, Serial(1));
                assert!(timing.is_some());
                break;
            }
            other => panic!("unexpected PDU in snapshot stream: {:?}", other),
        }
    }
    assert_eq!(prefixes.len(), 2);
}

#[tokio::test]
async fn serial_query_one_behind_gets_a_compacted_delta() {
    let history = payload::shared(3, 3);
    {
        let mut history = history.write().await;
        let set1: VrpSet = vec![vrp("10.0.0.0/24", 64496, 24)].into_iter().collect();
        history.update(set1, "2024-01-01T00:00:00Z".to_string());
        let set2: VrpSet = vec![
            vrp("10.0.0.0/24", 64496, 24),
            vrp("10.1.0.0/24", 64498, 24),
        ]
        .into_iter()
        .collect();
        history.update(set2, "2024-01-01T01:00:00Z".to_string());
    }
    let (_notifier, listener) = rtrd::rtr::channel(Serial(0));
    let (mut client, server_side) = tokio::io::duplex(8192);

    tokio::spawn(run(
        server_side,
        "test-peer".to_string(),
        history,
        listener,
        RtrServerMetrics::default(),
        session_config(),
    ));

    send(&mut client, Pdu::SerialQuery { version: 1, session: 3, serial: Serial(1) }).await;

    let mut buf = BytesMut::new();
    match recv_one(&mut client, &mut buf).await {
        Pdu::CacheResponse { session, .. } => assert_eq!(session, 3),
        other => panic!("expected CacheResponse, got {:?}", other),
    }
    match recv_one(&mut client, &mut buf).await {
        Pdu::Prefix { flags, vrp: delivered, .. } => {
            assert_eq!(flags, Pdu::FLAG_ANNOUNCE);
            assert_eq!(delivered, vrp("10.1.0.0/24", 64498, 24));
        }
        other => panic!("expected an announce, got {:?}", other),
    }
    match recv_one(&mut client, &mut buf).await {
        Pdu::EndOfData { serial, .. } => assert_eq!(serial, Serial(2)),
        other => panic!("expected EndOfData, got {:?}", other),
    }
}

#[tokio::test]
async fn serial_query_with_wrong_session_forces_cache_reset() {
    let history = payload::shared(9, 3);
    {
        let mut history = history.write().await;
        let set: VrpSet = vec![vrp("10.0.0.0/24", 64496, 24)].into_iter().collect();
        history.update(set, "2024-01-01T00:00:00Z".to_string());
    }
    let (_notifier, listener) = rtrd::rtr::channel(Serial(0));
    let (mut client, server_side) = tokio::io::duplex(8192);

    tokio::spawn(run(
        server_side,
        "test-peer".to_string(),
        history,
        listener,
        RtrServerMetrics::default(),
        session_config(),
    ));

    send(&mut client, Pdu::SerialQuery { version: 1, session: 123, serial: Serial(1) }).await;

    let mut buf = BytesMut::new();
    match recv_one(&mut client, &mut buf).await {
        Pdu::CacheReset { version } => assert_eq!(version, 1),
        other => panic!("expected CacheReset, got {:?}", other),
    }
}

#[tokio::test]
async fn serial_query_out_of_retained_window_forces_cache_reset() {
    let history = payload::shared(5, 2);
    {
        let mut history = history.write().await;
        for i in 0..5u32 {
            let set: VrpSet = vec![vrp(&format!("10.{}.0.0/24", i), 64496, 24)]
                .into_iter()
                .collect();
            history.update(set, "2024-01-01T00:00:00Z".to_string());
        }
    }
    let (_notifier, listener) = rtrd::rtr::channel(Serial(0));
    let (mut client, server_side) = tokio::io::duplex(8192);

    tokio::spawn(run(
        server_side,
        "test-peer".to_string(),
        history,
        listener,
        RtrServerMetrics::default(),
        session_config(),
    ));

    send(&mut client, Pdu::SerialQuery { version: 1, session: 5, serial: Serial(0) }).await;

    let mut buf = BytesMut::new();
    match recv_one(&mut client, &mut buf).await {
        Pdu::CacheReset { .. } => (),
        other => panic!("expected CacheReset, got {:?}", other),
    }
}

#[tokio::test]
async fn serial_notify_is_pushed_to_a_pinned_client_on_update() {
    let history = payload::shared(11, 3);
    {
        let mut history = history.write().await;
        let set: VrpSet = vec![vrp("10.0.0.0/24", 64496, 24)].into_iter().collect();
        history.update(set, "2024-01-01T00:00:00Z".to_string());
    }
    let (notifier, listener) = rtrd::rtr::channel(Serial(1));
    let (mut client, server_side) = tokio::io::duplex(8192);

    tokio::spawn(run(
        server_side,
        "test-peer".to_string(),
        history.clone(),
        listener,
        RtrServerMetrics::default(),
        session_config(),
    ));

    // Pin the client's protocol version with a Reset Query and drain the
    // resulting snapshot before triggering a push notification.
    send(&mut client, Pdu::ResetQuery { version: 1 }).await;
    let mut buf = BytesMut::new();
    loop {
        if let Pdu::EndOfData { .. } = recv_one(&mut client, &mut buf).await {
            break;
        }
    }

    {
        let mut history = history.write().await;
        let set: VrpSet = vec![
            vrp("10.0.0.0/24", 64496, 24),
            vrp("10.2.0.0/24", 64499, 24),
        ]
        .into_iter()
        .collect();
        history.update(set, "2024-01-01T00:00:00Z".to_string());
    }
    notifier.notify(Serial(2));

    match recv_one(&mut client, &mut buf).await {
        Pdu::SerialNotify { session, serial, .. } => {
            assert_eq!(session, 11);
            assert_eq!(serial, Serial(2));
        }
        other => panic!("expected SerialNotify, got {:?}", other),
    }
}
