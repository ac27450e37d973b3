//! Integration tests for Veilnet
//!
//! Runs both ends of the tunnel in-process:
//! - UDP and WebSocket relays between in-memory interfaces
//! - Peer session handshake with address lease over a loopback peer
//! - Configuration loading and validation

use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use veilnet::config::{generate_example_config, Config, Protocol};
use veilnet::node::{RelayContext, UdpClient, UdpServer, WsClient, WsServer};
use veilnet::obfuscation::FrameTransform;
use veilnet::protocol::{FlowKey, DATA_CHANNEL_LABEL};
use veilnet::session::ChannelSignaling;
use veilnet::transport::{Channel, LoopbackPeer, PeerChannel, TransportError, WsSettings};
use veilnet::tunnel::{
    DropReason, FlowTable, Forwarded, MemoryDevice, MemoryDeviceFactory, MemoryDeviceHandle,
    Relay, Routing, TunWriter,
};
use veilnet::Node;

const KEY: &str = "integration test secret";

/// Build a minimal IPv4/UDP frame
fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Bytes {
    let total = 20 + payload.len();
    let mut frame = vec![0u8; 20];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    frame[8] = 64;
    frame[9] = 17;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

fn context(cancel: &CancellationToken) -> RelayContext {
    RelayContext::new(
        Arc::new(FrameTransform::new(KEY).unwrap()),
        Duration::from_secs(1800),
        Duration::from_secs(600),
        cancel.clone(),
    )
}

/// Inject `frame` on one interface until it shows up on the other.
/// Retries cover flows that are still being learned on the far side, so
/// late duplicates of earlier frames are skipped.
async fn relay_frame(from: &MemoryDeviceHandle, to: &mut MemoryDeviceHandle, frame: &Bytes) {
    for _ in 0..50 {
        from.inject(frame.clone()).await;
        let deadline = tokio::time::sleep(Duration::from_millis(100));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                written = to.next_written() => match written {
                    Some(written) if &written == frame => return,
                    Some(_) => continue,
                    None => panic!("interface closed"),
                },
            }
        }
    }
    panic!("frame was never relayed");
}

/// Test a client frame reaching the server over UDP, and the reply coming back
#[tokio::test]
async fn test_udp_relay_end_to_end() {
    let cancel = CancellationToken::new();

    let server = UdpServer::bind(context(&cancel), "127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let (server_dev, mut server_if) = MemoryDevice::new();
    let server_task = tokio::spawn(server.serve(server_dev));

    let client = UdpClient::bind(context(&cancel), "127.0.0.1:0", &server_addr.to_string())
        .await
        .unwrap();
    let (client_dev, mut client_if) = MemoryDevice::new();
    let client_task = tokio::spawn(client.serve(client_dev));

    // 10.0.0.2 -> 10.0.0.3 resolves flow (10.0.0.3, 10.0.0.2) on the client
    let request = ipv4_frame(addr(2), addr(3), b"hello over udp");
    assert_eq!(
        FlowKey::outbound(&request),
        Some(FlowKey::new(addr(3), addr(2)))
    );
    relay_frame(&client_if, &mut server_if, &request).await;

    let reply = ipv4_frame(addr(3), addr(2), b"reply over udp");
    relay_frame(&server_if, &mut client_if, &reply).await;

    cancel.cancel();
    server_task.await.unwrap().unwrap();
    client_task.await.unwrap().unwrap();
}

/// Test the same exchange over WebSocket connections
#[tokio::test]
async fn test_ws_relay_end_to_end() {
    let cancel = CancellationToken::new();

    let server = WsServer::bind(context(&cancel), "127.0.0.1:0", WsSettings::default())
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();
    let (server_dev, mut server_if) = MemoryDevice::new();
    let server_task = tokio::spawn(server.serve(server_dev));

    let client = WsClient::new(
        context(&cancel),
        &server_addr.to_string(),
        false,
        WsSettings::default(),
    );
    let (client_dev, mut client_if) = MemoryDevice::new();
    let client_task = tokio::spawn(client.serve(client_dev));

    let request = ipv4_frame(addr(2), addr(3), b"hello over ws");
    relay_frame(&client_if, &mut server_if, &request).await;

    let reply = ipv4_frame(addr(3), addr(2), b"reply over ws");
    relay_frame(&server_if, &mut client_if, &reply).await;

    cancel.cancel();
    server_task.await.unwrap().unwrap();
    client_task.await.unwrap().unwrap();
}

fn peer_config(server_mode: bool) -> Config {
    let mut config = generate_example_config();
    config.node.key = KEY.to_string();
    config.node.protocol = Protocol::Rtc;
    config.node.cidr = "10.0.0.0/24".to_string();
    config.node.server_mode = server_mode;
    config.node.server_addr = None;
    config
}

/// Test the peer handshake: offer/answer, lease delivery, then data
#[tokio::test]
async fn test_peer_session_lease_and_relay() {
    let ((a, a_events), (b, b_events)) = LoopbackPeer::pair();
    let (mut sig_a, mut sig_b) = ChannelSignaling::pair();

    let server = Node::new(peer_config(true)).unwrap();
    let client = Node::new(peer_config(false)).unwrap();
    let server_cancel = server.cancel_token();
    let client_cancel = client.cancel_token();

    let (server_devices, mut server_created) = MemoryDeviceFactory::new();
    let (client_devices, mut client_created) = MemoryDeviceFactory::new();

    let server_task = tokio::spawn(async move {
        server
            .run_peer(&server_devices, Arc::new(a), a_events, &mut sig_a)
            .await
    });
    let client_task = tokio::spawn(async move {
        client
            .run_peer(&client_devices, Arc::new(b), b_events, &mut sig_b)
            .await
    });

    // Server interface carries the gateway address
    let (server_iface, server_if) = server_created.recv().await.unwrap();
    assert_eq!(server_iface.address, addr(1));
    assert_eq!(server_iface.prefix, 24);

    // Client interface is only created from the lease
    let (client_iface, mut client_if) =
        tokio::time::timeout(Duration::from_secs(5), client_created.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(client_iface.address, addr(2));
    assert_eq!(client_iface.prefix, 24);
    assert_eq!(client_iface.gateway, Some(addr(1)));

    let mut server_if = server_if;
    let request = ipv4_frame(addr(2), addr(1), b"ping over peer");
    relay_frame(&client_if, &mut server_if, &request).await;

    // Point-to-point: unaddressed frames go through too
    let raw = Bytes::from_static(b"not an ip frame at all");
    relay_frame(&server_if, &mut client_if, &raw).await;

    server_cancel.cancel();
    client_cancel.cancel();
    server_task.await.unwrap().unwrap();
    client_task.await.unwrap().unwrap();
}

/// Test that a peer connection failure ends the session with an error
#[tokio::test]
async fn test_peer_failure_is_fatal() {
    let ((a, a_events), (b, b_events)) = LoopbackPeer::pair();
    let a = Arc::new(a);
    let (mut sig_a, mut sig_b) = ChannelSignaling::pair();

    let server = Node::new(peer_config(true)).unwrap();
    let client = Node::new(peer_config(false)).unwrap();
    let (server_devices, _server_created) = MemoryDeviceFactory::new();
    let (client_devices, mut client_created) = MemoryDeviceFactory::new();

    let peer = Arc::clone(&a);
    let server_task = tokio::spawn(async move {
        server
            .run_peer(&server_devices, peer, a_events, &mut sig_a)
            .await
    });
    let client_task = tokio::spawn(async move {
        client
            .run_peer(&client_devices, Arc::new(b), b_events, &mut sig_b)
            .await
    });

    client_created.recv().await.unwrap();
    a.fail();

    let server_result = server_task.await.unwrap();
    let client_result = client_task.await.unwrap();
    assert!(matches!(server_result, Err(veilnet::Error::Session(_))));
    assert!(matches!(client_result, Err(veilnet::Error::Session(_))));
}

/// Test that sending before the data channel opens drops instead of blocking
#[tokio::test]
async fn test_unready_peer_channel_drops() {
    let ((a, _a_events), (_b, _b_events)) = LoopbackPeer::pair();
    let channel = Arc::new(PeerChannel::new(Arc::new(a), DATA_CHANNEL_LABEL));
    assert!(!channel.is_ready());
    assert!(matches!(
        channel.send(b"early").await,
        Err(TransportError::NotReady)
    ));

    let cancel = CancellationToken::new();
    let (device, _handle) = MemoryDevice::new();
    let (writer, _writer_task) = TunWriter::spawn(device, cancel.clone());
    let relay = Relay::new(
        Arc::new(FlowTable::new(Duration::from_secs(60))),
        Arc::new(FrameTransform::new(KEY).unwrap()),
        writer,
        cancel.clone(),
    );

    let frame = ipv4_frame(addr(2), addr(3), b"early");
    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        relay.forward(&frame, &Routing::PointToPoint(channel)),
    )
    .await
    .unwrap();
    assert_eq!(outcome, Forwarded::Dropped(DropReason::NotReady));
    cancel.cancel();
}

/// Test interface and configuration failures surface as errors
#[tokio::test]
async fn test_startup_failures() {
    let mut config = generate_example_config();
    config.node.server_mode = true;
    config.node.local_addr = "127.0.0.1:0".to_string();
    let node = Node::new(config).unwrap();

    let result = node.run(&MemoryDeviceFactory::failing()).await;
    assert!(matches!(result, Err(veilnet::Error::Tunnel(_))));

    let node = Node::new(peer_config(true)).unwrap();
    let (devices, _created) = MemoryDeviceFactory::new();
    assert!(matches!(
        node.run(&devices).await,
        Err(veilnet::Error::Config(_))
    ));

    let mut config = generate_example_config();
    config.node.key.clear();
    assert!(matches!(Node::new(config), Err(veilnet::Error::Config(_))));
}

/// Test configuration survives a save/load cycle
#[test]
fn test_config_file_round_trip() {
    let path = std::env::temp_dir().join(format!("veilnet-config-{}.toml", std::process::id()));

    let mut config = generate_example_config();
    config.node.protocol = Protocol::Wss;
    config.flows.ttl_secs = 120;
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.node.protocol, Protocol::Wss);
    assert_eq!(loaded.flows.ttl_secs, 120);
    assert_eq!(loaded.node.key, config.node.key);
    loaded.validate().unwrap();

    assert!(Config::load(std::env::temp_dir().join("veilnet-missing.toml")).is_err());
}
