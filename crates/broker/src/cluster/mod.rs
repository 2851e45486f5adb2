// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster manager: cache-backed discovery, liveness, manager election,
//! peer connectivity, rebroadcast, and RPC.

pub mod cache;
pub mod peer;
pub mod rpc;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::channel::{ChannelHandle, ChannelId};
use crate::cluster::cache::{
    checkin_key, join_peer_list, manager_key, parse_peer_list, peers_key, CacheProvider,
};
use crate::cluster::peer::PeerLink;
use crate::cluster::rpc::{
    PeerRpcOutcome, RpcCoordinator, RpcRequest, RpcResponse, RPC_REQUEST_PREFIX,
    RPC_RESPONSE_PREFIX,
};
use crate::config::ClusterConfig;
use crate::error::BrokerError;
use crate::frame::{Command, Frame};

/// Upgrade header carrying the shared secret; compared case-sensitively.
pub const MANAGEMENT_HEADER: &str = "socketbox-management";
/// Upgrade header carrying the connecting node's advertised URL.
pub const MANAGEMENT_NAME_HEADER: &str = "socketbox-management-name";

pub const MESSAGE_REBROADCAST_PREFIX: &str = "__message_rebroadcast__";
pub const STOMP_REBROADCAST_PREFIX: &str = "__STOMP_message_rebroadcast__";
pub const PEER_DISCOVERED_PREFIX: &str = "__peer_discovered__";

/// Keep-alive tick of the discovery loop; the adaptive outer delay gates
/// the full scan.
const TICK: Duration = Duration::from_secs(2);
/// Read-modify-write attempts when registering in the peer list.
const PEER_LIST_RETRIES: u32 = 5;

/// Classification of an accepted WebSocket, decided once per connection
/// from the upgrade headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelClass {
    /// A regular STOMP client.
    Client,
    /// A management link from another node.
    Management { peer_name: String },
    /// Our own advertised URL routed back to us; all traffic is ignored.
    SelfLink,
}

/// Payload of a `__STOMP_message_rebroadcast__` envelope.
#[derive(Debug, Serialize, Deserialize)]
struct StompRebroadcast {
    destination: String,
    #[serde(rename = "messageData")]
    message_data: String,
    #[serde(default)]
    headers: IndexMap<String, String>,
}

pub struct ClusterManager {
    config: ClusterConfig,
    cache: Arc<dyn CacheProvider>,
    broker: Weak<Broker>,
    /// Back-reference handed to spawned link tasks.
    self_weak: Weak<ClusterManager>,
    /// Outbound links, keyed by peer name.
    peers: RwLock<HashMap<String, Arc<PeerLink>>>,
    /// Inbound management sockets, keyed by channel id, with the sender's
    /// declared name. Disjoint from `self_channels` and from the broker's
    /// client channel map.
    management_channels: RwLock<HashMap<ChannelId, (String, ChannelHandle)>>,
    /// Inbound sockets that turned out to be ourselves.
    self_channels: RwLock<HashMap<ChannelId, ChannelHandle>>,
    rpc: RpcCoordinator,
    started: Instant,
    last_change: Mutex<Instant>,
    next_run: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl ClusterManager {
    /// Build the manager. Fails when clustering is off or the node has no
    /// advertised name.
    pub fn new(
        config: ClusterConfig,
        cache: Arc<dyn CacheProvider>,
        broker: Weak<Broker>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, BrokerError> {
        if !config.enable {
            return Err(BrokerError::ClusterDisabled);
        }
        if config.name.is_empty() {
            return Err(BrokerError::InvalidConfiguration(
                "cluster.name must be set when clustering is enabled".to_owned(),
            ));
        }
        let now = Instant::now();
        Ok(Arc::new_cyclic(|self_weak| Self {
            config,
            cache,
            broker,
            self_weak: self_weak.clone(),
            peers: RwLock::new(HashMap::new()),
            management_channels: RwLock::new(HashMap::new()),
            self_channels: RwLock::new(HashMap::new()),
            rpc: RpcCoordinator::new(),
            started: now,
            last_change: Mutex::new(now),
            next_run: Mutex::new(now),
            shutdown,
        }))
    }

    /// Spawn the periodic discovery scan.
    pub fn start(&self) {
        let Some(manager) = self.self_weak.upgrade() else { return };
        tokio::spawn(async move {
            manager.run_scan_loop().await;
        });
    }

    pub(crate) fn secret_key(&self) -> &str {
        &self.config.secret_key
    }

    pub(crate) fn self_name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn peer_connect_timeout(&self) -> Duration {
        self.config.peer_connect_timeout()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Names of peers with an established link.
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .read()
            .iter()
            .filter(|(_, link)| link.is_open())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn manager_name(&self) -> Option<String> {
        self.cache
            .get(&manager_key(&self.config.cache_prefix))
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
    }

    pub fn is_manager(&self) -> bool {
        self.manager_name().as_deref() == Some(self.config.name.as_str())
    }

    // -- channel classification -----------------------------------------

    /// Classify an accepted socket from its upgrade headers. Called
    /// exactly once per connection.
    pub fn classify(&self, secret: Option<&str>, name: Option<&str>) -> ChannelClass {
        match (secret, name) {
            (Some(secret), Some(name)) if secret == self.config.secret_key => {
                if name == self.config.name {
                    ChannelClass::SelfLink
                } else {
                    ChannelClass::Management { peer_name: name.to_owned() }
                }
            }
            _ => ChannelClass::Client,
        }
    }

    /// Track an inbound management socket. Dials back so both sides hold
    /// an outbound link and announces the newcomer cluster-wide.
    pub fn register_management_channel(&self, peer_name: &str, channel: &ChannelHandle) {
        self.management_channels
            .write()
            .insert(channel.id(), (peer_name.to_owned(), channel.clone()));
        if self.ensure_peer(peer_name) {
            let announce = format!("{PEER_DISCOVERED_PREFIX}{peer_name}");
            self.broadcast_management_message(&announce, peer_name);
        }
    }

    /// Track an inbound socket that is our own advertised URL looping
    /// back. Its traffic is ignored entirely.
    pub fn register_self_channel(&self, channel: &ChannelHandle) {
        self.self_channels.write().insert(channel.id(), channel.clone());
    }

    pub fn management_channel_closed(&self, id: ChannelId) {
        self.management_channels.write().remove(&id);
        self.self_channels.write().remove(&id);
    }

    // -- peer connectivity ----------------------------------------------

    /// Open an outbound link to `name` unless one is already live.
    /// Returns true when a new link was spawned.
    pub fn ensure_peer(&self, name: &str) -> bool {
        if name.is_empty() || name == self.config.name {
            return false;
        }
        let Some(manager) = self.self_weak.upgrade() else { return false };
        let mut peers = self.peers.write();
        match peers.get(name) {
            Some(link) if !link.is_closed() => false,
            _ => {
                info!(peer = %name, "connecting to cluster peer");
                let link = PeerLink::spawn(&manager, name.to_owned());
                peers.insert(name.to_owned(), link);
                true
            }
        }
    }

    /// Drop the entry for a link whose pump task finished. The socket is
    /// already gone, so nothing is closed here.
    pub(crate) fn peer_link_closed(&self, name: &str) {
        let removed = {
            let mut peers = self.peers.write();
            if peers.get(name).is_some_and(|link| link.is_closed()) {
                peers.remove(name);
                true
            } else {
                false
            }
        };
        if removed {
            debug!(peer = %name, "peer link dropped");
            self.cluster_updated();
        }
    }

    /// Reset the adaptive scheduler after any topology change or error so
    /// the next scan happens promptly.
    pub(crate) fn cluster_updated(&self) {
        let now = Instant::now();
        *self.last_change.lock() = now;
        *self.next_run.lock() = now;
    }

    // -- discovery loop -------------------------------------------------

    async fn run_scan_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(TICK);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            self.write_checkin();

            if Instant::now() >= *self.next_run.lock() {
                self.scan().await;
                let delay = scan_delay(self.last_change.lock().elapsed());
                *self.next_run.lock() = Instant::now() + delay;
            }
        }
        debug!("cluster scan loop stopped");
    }

    async fn scan(&self) {
        if !self.ensure_self_in_peer_list().await {
            self.cluster_updated();
        }
        self.reap_stale_peers();
        self.refresh_peer_connections();
        self.elect_manager();
    }

    fn write_checkin(&self) {
        let key = checkin_key(&self.config.cache_prefix, &self.config.name);
        self.cache.set(&key, &epoch_secs().to_string());
    }

    /// Read-modify-write our name into the shared peer list, verifying
    /// after each write since cache writes are not atomic. Convergence is
    /// eventual; lost updates self-heal on a later attempt.
    async fn ensure_self_in_peer_list(&self) -> bool {
        let key = peers_key(&self.config.cache_prefix);
        for _ in 0..PEER_LIST_RETRIES {
            let raw = self.cache.get(&key).unwrap_or_default();
            let mut names = parse_peer_list(&raw);
            if names.iter().any(|name| name == &self.config.name) {
                return true;
            }
            names.push(self.config.name.clone());
            self.cache.set(&key, &join_peer_list(&names));

            let verify = self.cache.get(&key).unwrap_or_default();
            if parse_peer_list(&verify).iter().any(|name| name == &self.config.name) {
                return true;
            }

            let backoff = Duration::from_millis(rand::rng().random_range(1000..3000));
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        warn!("could not register in the cluster peer list");
        false
    }

    /// Drop peers whose checkin is older than the idle timeout.
    fn reap_stale_peers(&self) {
        let key = peers_key(&self.config.cache_prefix);
        let names = parse_peer_list(&self.cache.get(&key).unwrap_or_default());
        let now = epoch_secs();
        for name in names {
            if name == self.config.name {
                continue;
            }
            let fresh = self
                .cache
                .get(&checkin_key(&self.config.cache_prefix, &name))
                .and_then(|value| value.parse::<u64>().ok())
                .is_some_and(|ts| now.saturating_sub(ts) <= self.config.peer_idle_timeout_secs);
            if !fresh {
                info!(peer = %name, "reaping idle peer from cache");
                self.remove_peer_from_cache(&name);
            }
        }
    }

    /// Remove a peer's list entry and checkin key. Idempotent.
    pub fn remove_peer_from_cache(&self, name: &str) {
        let key = peers_key(&self.config.cache_prefix);
        let names = parse_peer_list(&self.cache.get(&key).unwrap_or_default());
        if names.iter().any(|n| n == name) {
            let kept: Vec<String> = names.into_iter().filter(|n| n != name).collect();
            self.cache.set(&key, &join_peer_list(&kept));
        }
        self.cache.clear(&checkin_key(&self.config.cache_prefix, name));
    }

    /// Diff the desired peer set (static config ∪ cache, minus self)
    /// against live links: disconnect removed peers, connect new ones,
    /// and prune links that report closed.
    fn refresh_peer_connections(&self) {
        let key = peers_key(&self.config.cache_prefix);
        let cached = parse_peer_list(&self.cache.get(&key).unwrap_or_default());

        let mut desired: Vec<String> = Vec::new();
        for name in self.config.peers.iter().chain(cached.iter()) {
            if name.is_empty() || name == &self.config.name {
                continue;
            }
            if !desired.iter().any(|n| n == name) {
                desired.push(name.clone());
            }
        }

        let mut changed = false;
        {
            let mut peers = self.peers.write();
            let stale: Vec<String> = peers
                .iter()
                .filter(|(name, link)| !desired.iter().any(|n| &n == name) || link.is_closed())
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                if let Some(link) = peers.remove(&name) {
                    info!(peer = %name, "disconnecting removed peer");
                    link.close();
                    changed = true;
                }
            }
        }

        for name in &desired {
            changed |= self.ensure_peer(name);
        }

        if changed {
            self.cluster_updated();
        }
    }

    /// Weak manager election: claim the key when it is empty or names a
    /// peer that is neither connected nor ourselves. Eventually
    /// consistent; suitable only for non-critical one-node tasks.
    fn elect_manager(&self) {
        let key = manager_key(&self.config.cache_prefix);
        let current = self.cache.get(&key).unwrap_or_default().trim().to_owned();
        if current == self.config.name {
            return;
        }
        let connected =
            !current.is_empty() && self.peers.read().get(&current).is_some_and(|l| l.is_open());
        if !connected {
            info!(previous = %current, "claiming cluster manager role");
            self.cache.set(&key, &self.config.name);
        }
    }

    // -- rebroadcast ----------------------------------------------------

    /// Send over every outbound peer link except `exclude_peer`.
    pub fn broadcast_management_message(&self, text: &str, exclude_peer: &str) {
        for (name, link) in self.peers.read().iter() {
            if name == exclude_peer {
                continue;
            }
            if !link.send_text(text) {
                debug!(peer = %name, "management send failed; link pending prune");
            }
        }
    }

    /// Send raw text to every local client channel; with `rebroadcast`,
    /// additionally wrap it for the rest of the cluster.
    pub fn broadcast_message(&self, text: &str, rebroadcast: bool) {
        if let Some(broker) = self.broker.upgrade() {
            for channel in broker.channel_handles() {
                channel.send_text(text);
            }
        }
        if rebroadcast {
            let envelope = format!("{MESSAGE_REBROADCAST_PREFIX}{text}");
            self.broadcast_management_message(&envelope, "");
        }
    }

    /// Wrap an outgoing SEND for cluster-wide replay.
    pub(crate) fn rebroadcast_send(&self, destination: &str, frame: &Frame) {
        let mut headers = IndexMap::new();
        for (name, value) in frame.headers() {
            headers.entry(name.clone()).or_insert_with(|| value.clone());
        }
        let payload = StompRebroadcast {
            destination: destination.to_owned(),
            message_data: frame.body.clone(),
            headers,
        };
        match serde_json::to_string(&payload) {
            Ok(json) => {
                self.broadcast_management_message(&format!("{STOMP_REBROADCAST_PREFIX}{json}"), "");
            }
            Err(err) => warn!(err = %err, "failed to encode rebroadcast envelope"),
        }
    }

    // -- management envelope dispatch -----------------------------------

    /// Demultiplex one management message, from either an outbound peer
    /// link or an inbound management channel. `origin` is the remote
    /// node's name.
    pub fn handle_management_message(&self, origin: &str, text: &str) {
        if let Some(payload) = text.strip_prefix(MESSAGE_REBROADCAST_PREFIX) {
            // Replayed with rebroadcast off to prevent storms.
            self.broadcast_message(payload, false);
        } else if let Some(payload) = text.strip_prefix(STOMP_REBROADCAST_PREFIX) {
            self.replay_stomp_rebroadcast(payload);
        } else if let Some(name) = text.strip_prefix(PEER_DISCOVERED_PREFIX) {
            self.ensure_peer(name);
        } else if let Some(payload) = text.strip_prefix(RPC_REQUEST_PREFIX) {
            self.handle_rpc_request(payload);
        } else if let Some(payload) = text.strip_prefix(RPC_RESPONSE_PREFIX) {
            self.handle_rpc_response(payload);
        } else {
            debug!(origin, "unrecognized management message");
        }
    }

    fn replay_stomp_rebroadcast(&self, payload: &str) {
        let envelope: StompRebroadcast = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(err = %err, "malformed STOMP rebroadcast envelope");
                return;
            }
        };
        let Some(broker) = self.broker.upgrade() else { return };

        let mut frame = Frame::new(Command::Send).with_body(envelope.message_data);
        for (name, value) in &envelope.headers {
            frame = frame.with_header(name.clone(), value.clone());
        }
        broker.route_message(&envelope.destination, &frame, false);
    }

    // -- RPC ------------------------------------------------------------

    /// Call `operation` on one peer and wait for its response.
    ///
    /// Without a `default`, an unconnected peer fails with `PeerNotFound`
    /// and an expired deadline with `RpcTimeout`; with one, both return it
    /// silently. A response that arrives after expiry is dropped.
    pub async fn rpc_request(
        &self,
        peer: &str,
        operation: &str,
        args: Value,
        timeout: Option<Duration>,
        default: Option<Value>,
    ) -> Result<Value, BrokerError> {
        let link = self.peers.read().get(peer).cloned();
        let link = match link {
            Some(link) if link.is_open() => link,
            _ => {
                return default.ok_or_else(|| BrokerError::PeerNotFound(peer.to_owned()));
            }
        };

        let id = Uuid::new_v4().to_string();
        let waiter = self.rpc.register(id.clone());
        let request = RpcRequest {
            operation: operation.to_owned(),
            peer_name: self.config.name.clone(),
            args,
            id: id.clone(),
        };
        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(err) => {
                self.rpc.cancel(&id);
                return Err(BrokerError::RpcFailed(err.to_string()));
            }
        };
        if !link.send_text(format!("{RPC_REQUEST_PREFIX}{json}")) {
            self.rpc.cancel(&id);
            return default.ok_or_else(|| BrokerError::PeerNotFound(peer.to_owned()));
        }

        let timeout = timeout.unwrap_or_else(|| self.config.default_rpc_timeout());
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(response)) if response.success => Ok(response.result),
            Ok(Ok(response)) => match default {
                Some(value) => Ok(value),
                None => Err(BrokerError::RpcFailed(
                    response.error.unwrap_or_else(|| "remote operation failed".to_owned()),
                )),
            },
            _ => {
                self.rpc.cancel(&id);
                default.ok_or_else(|| {
                    BrokerError::RpcTimeout(format!("{operation} to {peer}"))
                })
            }
        }
    }

    /// Call `operation` on every connected peer concurrently. A failed leg
    /// never fails the cluster call.
    pub async fn rpc_cluster_request(
        &self,
        operation: &str,
        args: Value,
        timeout: Option<Duration>,
        default: Option<Value>,
    ) -> HashMap<String, PeerRpcOutcome> {
        let names = self.connected_peers();
        let legs = names.into_iter().map(|name| {
            let args = args.clone();
            let default = default.clone();
            async move {
                let outcome =
                    match self.rpc_request(&name, operation, args, timeout, default).await {
                        Ok(result) => PeerRpcOutcome { success: true, result, error: None },
                        Err(err) => PeerRpcOutcome {
                            success: false,
                            result: Value::Null,
                            error: Some(err.to_string()),
                        },
                    };
                (name, outcome)
            }
        });
        futures_util::future::join_all(legs).await.into_iter().collect()
    }

    fn handle_rpc_request(&self, payload: &str) {
        let request: RpcRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(err = %err, "malformed RPC request");
                return;
            }
        };
        let (result, success, error) = self.execute_rpc(&request);
        self.send_rpc_response(&request.id, &request.peer_name, result, success, error);
    }

    /// Serve built-in operations directly; anything else falls through to
    /// the application hook.
    fn execute_rpc(&self, request: &RpcRequest) -> (Value, bool, Option<String>) {
        match request.operation.as_str() {
            "uptime" => (json!(self.uptime_secs()), true, None),
            "getSTOMPConnections" => match self.broker.upgrade() {
                Some(broker) => (
                    serde_json::to_value(broker.connections()).unwrap_or(Value::Null),
                    true,
                    None,
                ),
                None => (Value::Null, false, Some("broker unavailable".to_owned())),
            },
            operation => {
                match self.broker.upgrade().and_then(|b| b.dispatch_rpc(operation, &request.args)) {
                    Some(Ok(result)) => (result, true, None),
                    Some(Err(error)) => (Value::Null, false, Some(error)),
                    None => (
                        Value::Null,
                        false,
                        Some(format!("unknown RPC operation {operation:?}")),
                    ),
                }
            }
        }
    }

    /// Reply to an RPC request, exactly once. Prefers the outbound link to
    /// the caller; falls back to its inbound management channel.
    pub fn send_rpc_response(
        &self,
        id: &str,
        peer: &str,
        result: Value,
        success: bool,
        error: Option<String>,
    ) {
        let response =
            RpcResponse { id: id.to_owned(), result, success, error, execution_time_ms: None };
        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(err) => {
                warn!(err = %err, "failed to encode RPC response");
                return;
            }
        };
        let text = format!("{RPC_RESPONSE_PREFIX}{json}");

        if let Some(link) = self.peers.read().get(peer) {
            if link.send_text(&text) {
                return;
            }
        }
        let inbound = self
            .management_channels
            .read()
            .values()
            .find(|(name, _)| name == peer)
            .map(|(_, channel)| channel.clone());
        match inbound {
            Some(channel) => {
                channel.send_text(text);
            }
            None => warn!(peer, "no route to RPC caller; response dropped"),
        }
    }

    fn handle_rpc_response(&self, payload: &str) {
        match serde_json::from_str::<RpcResponse>(payload) {
            Ok(response) => self.rpc.complete(response),
            Err(err) => warn!(err = %err, "malformed RPC response"),
        }
    }

    // -- shutdown -------------------------------------------------------

    /// Leave the cluster: release the manager key, best-effort remove our
    /// cache entries, and close every link, swallowing individual errors.
    pub async fn shutdown(&self) {
        if self.is_manager() {
            self.cache.set(&manager_key(&self.config.cache_prefix), "");
        }
        for _ in 0..2 {
            self.remove_peer_from_cache(&self.config.name);
            let key = peers_key(&self.config.cache_prefix);
            let names = parse_peer_list(&self.cache.get(&key).unwrap_or_default());
            if !names.iter().any(|n| n == &self.config.name) {
                break;
            }
        }
        self.shutdown.cancel();
        for (name, link) in self.peers.write().drain() {
            debug!(peer = %name, "closing peer link");
            link.close();
        }
    }
}

/// Adaptive outer delay: scan every ~2 s while the topology is changing,
/// backing off to a minute once it has been stable for five.
fn scan_delay(stable_for: Duration) -> Duration {
    match stable_for.as_secs() {
        0..=9 => Duration::from_millis(2000 + rand::rng().random_range(0..2000)),
        10..=29 => Duration::from_secs(5),
        30..=59 => Duration::from_secs(10),
        60..=299 => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[path = "cluster_tests.rs"]
mod tests;
