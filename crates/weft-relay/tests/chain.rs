//! Integration tests for chain relays
//!
//! Builds real meshes over duplex transports, binds a chain listener
//! per node on loopback TCP, and tunnels live connections across one,
//! two, and three hops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use weft_node::{LinkConfig, MeshNode, NodeConfig, RoutingConfig, VirtualAddress};
use weft_relay::{ChainError, ChainListener, chain_connect};

fn addr(tail: u8) -> VirtualAddress {
    VirtualAddress::from_octets([169, 254, 0, tail])
}

fn fast_config(tail: u8) -> NodeConfig {
    NodeConfig::default()
        .with_address(addr(tail))
        .with_link(LinkConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..LinkConfig::default()
        })
        .with_routing(RoutingConfig {
            advertise_interval: Duration::from_millis(50),
            advertise_initial_delay: Duration::from_millis(10),
            join_timeout: Duration::from_secs(2),
            join_retry_interval: Duration::from_millis(25),
            ..RoutingConfig::default()
        })
}

struct ChainNode {
    node: Arc<MeshNode>,
    listener: Arc<ChainListener>,
}

/// A mesh node with its chain listener bound on loopback.
async fn chain_node(tail: u8) -> ChainNode {
    let node = MeshNode::start(fast_config(tail));
    let listener = ChainListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(node.routing()),
    )
    .await
    .unwrap();
    ChainNode { node, listener }
}

/// Wire two nodes together, each advertising its chain listener as its
/// service endpoint.
async fn link_nodes(a: &ChainNode, b: &ChainNode) {
    let (a_side, b_side) = tokio::io::duplex(65536);
    b.node
        .attach_link(b_side, Some(a.node.local_address()), Some(a.listener.local_addr()))
        .unwrap();
    a.node
        .connect_neighbor(a_side, Some(b.node.local_address()), Some(b.listener.local_addr()))
        .await
        .unwrap();

    let a_addr = a.node.local_address();
    wait_until("reverse route", || {
        b.node
            .routes()
            .iter()
            .any(|route| route.origin == a_addr && route.hop_count == 1)
    })
    .await;
}

async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A plain TCP echo server standing in for a destination service.
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_chain_to_self() {
    let a = chain_node(1).await;
    let echo = spawn_echo_server().await;

    let mut stream = chain_connect(a.node.routing(), addr(1), echo.port())
        .await
        .unwrap();
    stream.write_all(b"local loop").await.unwrap();
    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"local loop");

    a.node.close().await;
}

#[tokio::test]
async fn test_chain_to_neighbor_is_direct() {
    let a = chain_node(1).await;
    let b = chain_node(2).await;
    link_nodes(&a, &b).await;

    let echo = spawn_echo_server().await;

    // One overlay hop, so one real leg straight to the destination host
    let mut stream = chain_connect(a.node.routing(), addr(2), echo.port())
        .await
        .unwrap();
    stream.write_all(b"one hop").await.unwrap();
    let mut buf = [0u8; 7];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one hop");

    a.node.close().await;
    b.node.close().await;
}

#[tokio::test]
async fn test_chain_through_one_relay() {
    let a = chain_node(1).await;
    let b = chain_node(2).await;
    let c = chain_node(3).await;
    link_nodes(&a, &b).await;
    link_nodes(&b, &c).await;

    wait_until("a sees c at hop two", || {
        a.node
            .routes()
            .iter()
            .any(|route| route.origin == addr(3) && route.hop_count == 2)
    })
    .await;

    let echo = spawn_echo_server().await;

    let mut stream = chain_connect(a.node.routing(), addr(3), echo.port())
        .await
        .unwrap();
    stream.write_all(b"through the middle").await.unwrap();
    let mut buf = [0u8; 18];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the middle");

    a.node.close().await;
    b.node.close().await;
    c.node.close().await;
}

#[tokio::test]
async fn test_three_hop_chain_byte_fidelity() {
    let a = chain_node(1).await;
    let b = chain_node(2).await;
    let c = chain_node(3).await;
    let d = chain_node(4).await;
    link_nodes(&a, &b).await;
    link_nodes(&b, &c).await;
    link_nodes(&c, &d).await;

    wait_until("a sees d at hop three", || {
        a.node
            .routes()
            .iter()
            .any(|route| route.origin == addr(4) && route.hop_count == 3)
    })
    .await;

    let echo = spawn_echo_server().await;
    let stream = chain_connect(a.node.routing(), addr(4), echo.port())
        .await
        .unwrap();

    // Push well past any single buffer and read the echo back
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut read_half, mut write_half) = stream.into_split();
    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&to_send).await.unwrap();
        write_half.shutdown().await.unwrap();
    });

    let mut received = Vec::with_capacity(payload.len());
    read_half.read_to_end(&mut received).await.unwrap();
    writer.await.unwrap();
    assert_eq!(received, payload);

    a.node.close().await;
    b.node.close().await;
    c.node.close().await;
    d.node.close().await;
}

#[tokio::test]
async fn test_unroutable_chain_fails() {
    let a = chain_node(1).await;

    let err = chain_connect(a.node.routing(), addr(9), 80).await.unwrap_err();
    assert!(matches!(err, ChainError::Routing(_)));

    a.node.close().await;
}
