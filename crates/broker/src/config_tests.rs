// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn defaults_when_empty() -> anyhow::Result<()> {
    let config: BrokerConfig = serde_json::from_str("{}")?;
    assert_eq!(config.heart_beat_ms, 10_000);
    assert!(!config.debug_mode);
    assert!(config.exchanges.is_empty());
    assert!(!config.cluster.enable);
    assert_eq!(config.cluster.peer_connect_timeout_secs, 5);
    assert_eq!(config.cluster.peer_idle_timeout_secs, 60);
    assert_eq!(config.cluster.default_rpc_timeout_secs, 15);
    Ok(())
}

#[test]
fn parses_wire_facing_key_names() -> anyhow::Result<()> {
    let config: BrokerConfig = serde_json::from_str(
        r#"{
            "heartBeatMS": 5000,
            "debugMode": true,
            "cluster": {
                "enable": true,
                "secretKey": "s3cret",
                "name": "ws://node-a:61613/stomp",
                "peers": ["ws://node-b:61613/stomp"],
                "cachePrefix": "prod-",
                "peerConnectionTimeoutSeconds": 2,
                "peerIdleTimeoutSeconds": 30,
                "defaultRPCTimeoutSeconds": 8
            }
        }"#,
    )?;
    assert_eq!(config.heart_beat_ms, 5000);
    assert!(config.debug_mode);
    assert!(config.cluster.enable);
    assert_eq!(config.cluster.secret_key, "s3cret");
    assert_eq!(config.cluster.name, "ws://node-a:61613/stomp");
    assert_eq!(config.cluster.peers.len(), 1);
    assert_eq!(config.cluster.cache_prefix, "prod-");
    assert_eq!(config.cluster.peer_connect_timeout(), Duration::from_secs(2));
    assert_eq!(config.cluster.default_rpc_timeout(), Duration::from_secs(8));
    Ok(())
}

#[test]
fn bindings_accept_single_target_or_list() -> anyhow::Result<()> {
    let config: BrokerConfig = serde_json::from_str(
        r#"{
            "exchanges": {
                "topic": {
                    "class": "topic",
                    "bindings": { "orders.*": "direct/orders" }
                },
                "fan": {
                    "class": "fanout",
                    "bindings": { "broadcast": ["direct/x", "direct/y"] }
                },
                "dist": {
                    "class": "distribution",
                    "type": "roundrobin",
                    "bindings": { "work": ["direct/a", "direct/b"] }
                }
            }
        }"#,
    )?;

    let topic = &config.exchanges["topic"];
    assert!(matches!(topic.bindings["orders.*"], BindingTargets::One(_)));

    let fan = &config.exchanges["fan"];
    match &fan.bindings["broadcast"] {
        BindingTargets::Many(targets) => assert_eq!(targets.len(), 2),
        other => panic!("expected list of targets, got {other:?}"),
    }

    assert_eq!(config.exchanges["dist"].distribution_type.as_deref(), Some("roundrobin"));
    Ok(())
}
