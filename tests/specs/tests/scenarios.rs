// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end broker scenarios over real sockets: local routing through
//! each exchange class, then two-node clustering, rebroadcast, and RPC.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use socketbox::cluster::cache::{CacheProvider, MemoryCache};
use socketbox::config::BrokerConfig;
use socketbox::error::BrokerError;
use socketbox::frame::{Command, Frame};
use socketbox_specs::{SpecNode, StompClient};

const TIMEOUT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(500);

fn config(json: &str) -> BrokerConfig {
    serde_json::from_str(json).expect("valid test config")
}

// -- Local routing ------------------------------------------------------------

#[tokio::test]
async fn heartbeat_round_trip() -> anyhow::Result<()> {
    let node = SpecNode::start(BrokerConfig::default()).await?;
    let mut client = StompClient::connect(&node.ws_url()).await?;

    client.send_text("\n").await?;
    assert_eq!(client.recv_text(TIMEOUT).await?, "\n");

    node.stop();
    Ok(())
}

#[tokio::test]
async fn direct_delivery() -> anyhow::Result<()> {
    let node = SpecNode::start(BrokerConfig::default()).await?;
    let mut subscriber = StompClient::connect(&node.ws_url()).await?;
    let mut publisher = StompClient::connect(&node.ws_url()).await?;

    subscriber.subscribe("0", "direct/room").await?;
    publisher.publish("direct/room", "hi").await?;

    let message = subscriber.recv(TIMEOUT).await?;
    assert_eq!(message.command, Command::Message);
    assert_eq!(message.body, "hi");
    assert_eq!(message.header("destination"), Some("room"));
    assert_eq!(message.header("subscription"), Some("0"));
    assert!(message.header("message-id").is_some());

    node.stop();
    Ok(())
}

#[tokio::test]
async fn topic_chains_into_direct() -> anyhow::Result<()> {
    let node = SpecNode::start(config(
        r#"{
            "exchanges": {
                "topic": { "class": "topic", "bindings": { "orders.*": "direct/orders" } }
            }
        }"#,
    ))
    .await?;
    let mut subscriber = StompClient::connect(&node.ws_url()).await?;
    let mut publisher = StompClient::connect(&node.ws_url()).await?;

    subscriber.subscribe("s1", "direct/orders").await?;
    publisher.publish("topic/orders.new", "order!").await?;

    let message = subscriber.recv(TIMEOUT).await?;
    assert_eq!(message.header("destination"), Some("orders"));
    assert_eq!(message.body, "order!");

    node.stop();
    Ok(())
}

#[tokio::test]
async fn fanout_delivers_exactly_once_per_target() -> anyhow::Result<()> {
    let node = SpecNode::start(config(
        r#"{
            "exchanges": {
                "fanout": {
                    "class": "fanout",
                    "bindings": { "broadcast": ["direct/x", "direct/y"] }
                }
            }
        }"#,
    ))
    .await?;
    let mut x = StompClient::connect(&node.ws_url()).await?;
    let mut y = StompClient::connect(&node.ws_url()).await?;
    let mut publisher = StompClient::connect(&node.ws_url()).await?;

    x.subscribe("0", "direct/x").await?;
    y.subscribe("0", "direct/y").await?;
    publisher.publish("fanout/broadcast", "all").await?;

    assert_eq!(x.recv(TIMEOUT).await?.body, "all");
    assert_eq!(y.recv(TIMEOUT).await?.body, "all");
    x.expect_quiet(QUIET).await?;
    y.expect_quiet(QUIET).await?;

    node.stop();
    Ok(())
}

#[tokio::test]
async fn distribution_round_robin_order() -> anyhow::Result<()> {
    let node = SpecNode::start(config(
        r#"{
            "exchanges": {
                "work": {
                    "class": "distribution",
                    "type": "roundrobin",
                    "bindings": { "jobs": ["direct/a", "direct/b", "direct/c"] }
                }
            }
        }"#,
    ))
    .await?;
    let mut a = StompClient::connect(&node.ws_url()).await?;
    let mut b = StompClient::connect(&node.ws_url()).await?;
    let mut c = StompClient::connect(&node.ws_url()).await?;
    let mut publisher = StompClient::connect(&node.ws_url()).await?;

    a.subscribe("0", "direct/a").await?;
    b.subscribe("0", "direct/b").await?;
    c.subscribe("0", "direct/c").await?;
    for n in 0..4 {
        publisher.publish("work/jobs", &n.to_string()).await?;
    }

    // Four consecutive publishes land on a, b, c, a.
    assert_eq!(a.recv(TIMEOUT).await?.body, "0");
    assert_eq!(b.recv(TIMEOUT).await?.body, "1");
    assert_eq!(c.recv(TIMEOUT).await?.body, "2");
    assert_eq!(a.recv(TIMEOUT).await?.body, "3");
    b.expect_quiet(QUIET).await?;
    c.expect_quiet(QUIET).await?;

    node.stop();
    Ok(())
}

#[tokio::test]
async fn error_frame_then_close_on_garbage() -> anyhow::Result<()> {
    let node = SpecNode::start(BrokerConfig::default()).await?;
    let mut client = StompClient::connect(&node.ws_url()).await?;

    client.send_text("NOT-A-COMMAND\n\n\u{0}").await?;

    let error = client.recv(TIMEOUT).await?;
    assert_eq!(error.command, Command::Error);
    assert_eq!(error.header("message"), Some("malformed frame"));

    node.stop();
    Ok(())
}

// -- Clustering ---------------------------------------------------------------

fn clustered_config(secret: &str) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.cluster.secret_key = secret.to_owned();
    config
}

#[tokio::test]
async fn cluster_rebroadcast_without_loops() -> anyhow::Result<()> {
    let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
    let n1 = SpecNode::start_clustered(clustered_config("s3cret"), Arc::clone(&cache)).await?;
    let n2 = SpecNode::start_clustered(clustered_config("s3cret"), Arc::clone(&cache)).await?;
    n1.wait_for_peers(1, TIMEOUT).await?;
    n2.wait_for_peers(1, TIMEOUT).await?;

    let mut remote_sub = StompClient::connect(&n2.ws_url()).await?;
    let mut local_sub = StompClient::connect(&n1.ws_url()).await?;
    let mut publisher = StompClient::connect(&n1.ws_url()).await?;
    remote_sub.subscribe("0", "direct/hello").await?;
    local_sub.subscribe("0", "direct/hello").await?;

    publisher.publish("direct/hello", "cross-node").await?;

    // Exactly one copy on each node; no echo loops back to N1.
    assert_eq!(remote_sub.recv(TIMEOUT).await?.body, "cross-node");
    assert_eq!(local_sub.recv(TIMEOUT).await?.body, "cross-node");
    remote_sub.expect_quiet(QUIET).await?;
    local_sub.expect_quiet(QUIET).await?;

    n1.stop();
    n2.stop();
    Ok(())
}

#[tokio::test]
async fn rpc_uptime_round_trip() -> anyhow::Result<()> {
    let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
    let n1 = SpecNode::start_clustered(clustered_config("s3cret"), Arc::clone(&cache)).await?;
    let n2 = SpecNode::start_clustered(clustered_config("s3cret"), Arc::clone(&cache)).await?;
    n1.wait_for_peers(1, TIMEOUT).await?;

    let manager = n1.manager.as_ref().expect("cluster node");
    let result = manager
        .rpc_request(&n2.name, "uptime", json!({}), Some(Duration::from_secs(5)), None)
        .await?;
    assert!(result.is_u64());

    n1.stop();
    n2.stop();
    Ok(())
}

#[tokio::test]
async fn rpc_cluster_request_fans_out() -> anyhow::Result<()> {
    let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
    let n1 = SpecNode::start_clustered(clustered_config("s3cret"), Arc::clone(&cache)).await?;
    let n2 = SpecNode::start_clustered(clustered_config("s3cret"), Arc::clone(&cache)).await?;
    n1.wait_for_peers(1, TIMEOUT).await?;

    // A client session on N2, visible through the connections built-in.
    let _client = StompClient::connect(&n2.ws_url()).await?;

    let manager = n1.manager.as_ref().expect("cluster node");
    let outcomes = manager
        .rpc_cluster_request("getSTOMPConnections", json!({}), Some(Duration::from_secs(5)), None)
        .await;

    let leg = outcomes.get(&n2.name).expect("an outcome for n2");
    assert!(leg.success);
    let sessions = leg.result.as_array().expect("array of connections");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["login"], "spec");

    n1.stop();
    n2.stop();
    Ok(())
}

#[tokio::test]
async fn rpc_times_out_when_the_peer_never_answers() -> anyhow::Result<()> {
    // Mismatched secrets: N1's link opens, but N2 classifies it as a
    // plain client and never speaks the management protocol back.
    let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
    let n1 = SpecNode::start_clustered(clustered_config("alpha"), Arc::clone(&cache)).await?;
    let n2 = SpecNode::start_clustered(clustered_config("beta"), Arc::clone(&cache)).await?;
    n1.wait_for_peers(1, TIMEOUT).await?;

    let manager = n1.manager.as_ref().expect("cluster node");
    let result = manager
        .rpc_request(&n2.name, "uptime", json!({}), Some(Duration::from_secs(2)), None)
        .await;
    assert!(matches!(result, Err(BrokerError::RpcTimeout(_))));

    // With a default supplied, the same call degrades silently.
    let result = manager
        .rpc_request(&n2.name, "uptime", json!({}), Some(Duration::from_secs(2)), Some(json!(-1)))
        .await?;
    assert_eq!(result, json!(-1));

    n1.stop();
    n2.stop();
    Ok(())
}

#[tokio::test]
async fn connected_header_carries_cluster_name() -> anyhow::Result<()> {
    let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
    let node = SpecNode::start_clustered(clustered_config("s3cret"), cache).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(node.ws_url()).await?;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;
    ws.send(Message::Text(Frame::new(Command::Connect).serialize().into())).await?;
    let reply = tokio::time::timeout(TIMEOUT, ws.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("stream ended"))??;
    let Message::Text(text) = reply else { anyhow::bail!("expected text") };
    let frame = match socketbox::frame::parse(&text.to_string())? {
        socketbox::frame::Inbound::Frame(frame) => frame,
        other => anyhow::bail!("expected frame, got {other:?}"),
    };
    assert_eq!(frame.command, Command::Connected);
    assert_eq!(frame.header("host"), Some(node.name.as_str()));

    node.stop();
    Ok(())
}
