// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use indexmap::IndexMap;
use serde::Deserialize;

/// WebSocket STOMP message broker.
#[derive(Debug, Parser)]
#[command(name = "socketbox", version, about)]
pub struct BrokerArgs {
    /// Host address to bind to.
    #[arg(long, env = "SOCKETBOX_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "SOCKETBOX_PORT", default_value_t = 61613)]
    pub port: u16,

    /// Path to broker configuration JSON (exchanges, cluster).
    #[arg(long, env = "SOCKETBOX_CONFIG")]
    pub config: Option<PathBuf>,
}

impl BrokerArgs {
    /// Load the declarative broker config, or defaults when no file given.
    pub fn load_config(&self) -> anyhow::Result<BrokerConfig> {
        match &self.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&contents)?)
            }
            None => Ok(BrokerConfig::default()),
        }
    }
}

/// Declarative broker configuration. Key names follow the wire-facing
/// config schema, hence the explicit renames.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Both directions of the CONNECTED heart-beat header, milliseconds.
    #[serde(rename = "heartBeatMS")]
    pub heart_beat_ms: u64,

    /// Rebuild the exchange table on each reconfigure, preserving
    /// subscriptions and connections.
    #[serde(rename = "debugMode")]
    pub debug_mode: bool,

    pub exchanges: HashMap<String, ExchangeConfig>,

    pub cluster: ClusterConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heart_beat_ms: 10_000,
            debug_mode: false,
            exchanges: HashMap::new(),
            cluster: ClusterConfig::default(),
        }
    }
}

/// One exchange definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// `direct`, `topic`, `fanout`, or `distribution`.
    pub class: String,

    /// Pattern → target(s). Direct/topic bindings take a single target;
    /// fanout/distribution take a list.
    #[serde(default)]
    pub bindings: IndexMap<String, BindingTargets>,

    /// Distribution only: `random` or `roundrobin`.
    #[serde(default, rename = "type")]
    pub distribution_type: Option<String>,
}

/// A binding's right-hand side: one target or a list of targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BindingTargets {
    One(String),
    Many(Vec<String>),
}

/// Cluster configuration. Disabled by default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enable: bool,

    /// Shared secret validated on the management upgrade headers.
    #[serde(rename = "secretKey")]
    pub secret_key: String,

    /// This node's advertised WebSocket URL; the cluster-wide identity.
    pub name: String,

    /// Static peer list, always attempted in addition to discovery.
    pub peers: Vec<String>,

    /// Prepended to every cluster cache key.
    #[serde(rename = "cachePrefix")]
    pub cache_prefix: String,

    #[serde(rename = "peerConnectionTimeoutSeconds")]
    pub peer_connect_timeout_secs: u64,

    /// A peer is reaped from the cache when its checkin is older than this.
    #[serde(rename = "peerIdleTimeoutSeconds")]
    pub peer_idle_timeout_secs: u64,

    #[serde(rename = "defaultRPCTimeoutSeconds")]
    pub default_rpc_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            secret_key: String::new(),
            name: String::new(),
            peers: Vec::new(),
            cache_prefix: String::new(),
            peer_connect_timeout_secs: 5,
            peer_idle_timeout_secs: 60,
            default_rpc_timeout_secs: 15,
        }
    }
}

impl ClusterConfig {
    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }

    pub fn default_rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.default_rpc_timeout_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
