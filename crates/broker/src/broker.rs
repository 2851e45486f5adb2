// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The broker core: connection registry, STOMP command dispatcher, and
//! routing entrypoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::{ChannelHandle, ChannelId};
use crate::cluster::ClusterManager;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::exchange::{self, parse_destination, Exchange, HOP_LIMIT};
use crate::frame::{Command, Frame};
use crate::subscription::{channel_key, AckMode, InternalCallback, Subscriber, SubscriptionTable};

/// How long an erroring client gets to drain before the socket closes.
const ERROR_DRAIN: Duration = Duration::from_secs(1);

/// Key/value pairs the authenticate hook attaches to a connection; echoed
/// back as `connectionMetadata-*` CONNECTED headers.
pub type ConnectionMetadata = HashMap<String, String>;

/// Credentials presented on CONNECT.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub login: &'a str,
    pub passcode: &'a str,
    pub host: &'a str,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// One SEND or SUBSCRIBE checked against the authorize hook.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub login: &'a str,
    pub exchange: &'a str,
    pub destination: &'a str,
    pub access: Access,
    pub channel: ChannelId,
    pub metadata: &'a ConnectionMetadata,
}

pub type AuthenticateHook =
    Arc<dyn Fn(&AuthRequest<'_>) -> Result<ConnectionMetadata, String> + Send + Sync>;
pub type AuthorizeHook = Arc<dyn Fn(&AccessRequest<'_>) -> bool + Send + Sync>;
/// Application handler for RPC operations the broker does not serve
/// itself. Returns the result value or an error message.
pub type RpcHook =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

/// Application-supplied integration points. Defaults allow everything and
/// serve no extra RPC operations.
#[derive(Clone)]
pub struct BrokerHooks {
    pub authenticate: AuthenticateHook,
    pub authorize: AuthorizeHook,
    pub rpc: Option<RpcHook>,
}

impl Default for BrokerHooks {
    fn default() -> Self {
        Self {
            authenticate: Arc::new(|_| Ok(ConnectionMetadata::new())),
            authorize: Arc::new(|_| true),
            rpc: None,
        }
    }
}

/// An authenticated STOMP session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub channel: ChannelHandle,
    pub login: String,
    pub session_id: ChannelId,
    pub connected_at_ms: u64,
    pub metadata: ConnectionMetadata,
}

/// Snapshot of one connection, as served by the `getSTOMPConnections`
/// RPC built-in.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    #[serde(rename = "sessionID")]
    pub session_id: ChannelId,
    pub login: String,
    #[serde(rename = "connectDate")]
    pub connect_date_ms: u64,
    #[serde(rename = "connectionMetadata")]
    pub metadata: ConnectionMetadata,
}

/// The broker instance owned by the process. No ambient globals; handlers
/// share it via `Arc`.
pub struct Broker {
    config: RwLock<BrokerConfig>,
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
    subscriptions: SubscriptionTable,
    connections: RwLock<HashMap<ChannelId, Connection>>,
    /// Every open client socket, authenticated or not.
    channels: RwLock<HashMap<ChannelId, ChannelHandle>>,
    hooks: BrokerHooks,
    cluster: RwLock<Option<Arc<ClusterManager>>>,
    next_channel_id: AtomicU64,
}

impl Broker {
    /// Build a broker from configuration. Fails without side effects when
    /// the exchange table cannot be built.
    pub fn new(config: BrokerConfig, hooks: BrokerHooks) -> Result<Self, BrokerError> {
        let exchanges = exchange::build_exchanges(&config.exchanges)?;
        Ok(Self {
            config: RwLock::new(config),
            exchanges: RwLock::new(exchanges),
            subscriptions: SubscriptionTable::new(),
            connections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            hooks,
            cluster: RwLock::new(None),
            next_channel_id: AtomicU64::new(1),
        })
    }

    /// Swap in a new configuration, preserving subscriptions and
    /// connections. The exchange table is built first so an invalid config
    /// leaves the previous one running. Internal subscriptions are cleared
    /// and must be re-registered by the caller.
    pub fn reconfigure(&self, config: BrokerConfig) -> Result<(), BrokerError> {
        let exchanges = exchange::build_exchanges(&config.exchanges)?;
        if self.config.read().debug_mode {
            // Debug reloads keep round-robin positions for surviving
            // distribution exchanges.
            let current = self.exchanges.read();
            for (name, exchange) in &exchanges {
                if let Some(previous) = current.get(name) {
                    exchange.adopt_cursor(previous);
                }
            }
        }
        *self.exchanges.write() = exchanges;
        *self.config.write() = config;
        self.subscriptions.remove_all_internal();
        Ok(())
    }

    pub fn config(&self) -> BrokerConfig {
        self.config.read().clone()
    }

    /// Attach the cluster manager. Called once at startup when clustering
    /// is enabled.
    pub fn set_cluster(&self, manager: Arc<ClusterManager>) {
        *self.cluster.write() = Some(manager);
    }

    pub fn cluster(&self) -> Option<Arc<ClusterManager>> {
        self.cluster.read().clone()
    }

    /// Register a server-side subscription; returns its table key.
    pub fn subscribe_internal(&self, destination: &str, callback: InternalCallback) -> String {
        let parsed = parse_destination(destination);
        self.subscriptions.add_internal(&parsed.tail.to_ascii_lowercase(), callback)
    }

    // -- channel lifecycle ----------------------------------------------

    /// Allocate a process-unique channel id. Used for every accepted
    /// socket regardless of classification.
    pub fn next_channel_id(&self) -> ChannelId {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a newly accepted client socket.
    pub fn channel_opened(&self, channel: &ChannelHandle) {
        self.channels.write().insert(channel.id(), channel.clone());
    }

    /// Tear down all state for a closed or dead client socket.
    pub fn channel_closed(&self, channel_id: ChannelId) {
        self.subscriptions.remove_by_channel(channel_id);
        self.connections.write().remove(&channel_id);
        self.channels.write().remove(&channel_id);
    }

    /// Handles to every open client socket, for cluster-wide raw
    /// broadcast.
    pub fn channel_handles(&self) -> Vec<ChannelHandle> {
        self.channels.read().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Offer an RPC operation to the application hook. `None` when no
    /// hook is registered.
    pub(crate) fn dispatch_rpc(
        &self,
        operation: &str,
        args: &serde_json::Value,
    ) -> Option<Result<serde_json::Value, String>> {
        self.hooks.rpc.as_ref().map(|hook| hook(operation, args))
    }

    /// Snapshot of authenticated connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .map(|conn| ConnectionInfo {
                session_id: conn.session_id,
                login: conn.login.clone(),
                connect_date_ms: conn.connected_at_ms,
                metadata: conn.metadata.clone(),
            })
            .collect()
    }

    // -- STOMP dispatcher -----------------------------------------------

    /// Process one client frame. Frames from one channel arrive in order;
    /// channels dispatch concurrently.
    pub fn handle_frame(&self, channel: &ChannelHandle, frame: &Frame) {
        match frame.command {
            Command::Connect | Command::Stomp => self.handle_connect(channel, frame),
            Command::Send => self.handle_send(channel, frame),
            Command::Subscribe => self.handle_subscribe(channel, frame),
            Command::Unsubscribe => self.handle_unsubscribe(channel, frame),
            Command::Disconnect => self.handle_disconnect(channel, frame),
            Command::Ack
            | Command::Nack
            | Command::Begin
            | Command::Commit
            | Command::Abort => {
                // Recognized at the frame level only; no transaction or
                // redelivery bookkeeping.
                self.send_receipt_if_requested(channel, frame);
            }
            Command::Connected | Command::Message | Command::Receipt | Command::Error => {
                self.send_error(
                    channel,
                    "unexpected command",
                    frame.header("receipt"),
                    format!("{} frames are server-originated", frame.command),
                );
            }
        }
    }

    fn handle_connect(&self, channel: &ChannelHandle, frame: &Frame) {
        let request = AuthRequest {
            login: frame.header("login").unwrap_or_default(),
            passcode: frame.header("passcode").unwrap_or_default(),
            host: frame.header("host").unwrap_or_default(),
            channel: channel.id(),
        };
        let metadata = match (self.hooks.authenticate)(&request) {
            Ok(metadata) => metadata,
            Err(reason) => {
                warn!(channel = channel.id(), login = request.login, "authentication rejected");
                self.send_error(channel, "authentication failed", frame.header("receipt"), reason);
                return;
            }
        };

        self.connections.write().insert(
            channel.id(),
            Connection {
                channel: channel.clone(),
                login: request.login.to_owned(),
                session_id: channel.id(),
                connected_at_ms: epoch_ms(),
                metadata: metadata.clone(),
            },
        );

        let (heart_beat_ms, host_name) = {
            let config = self.config.read();
            let host_name = if config.cluster.enable && !config.cluster.name.is_empty() {
                config.cluster.name.clone()
            } else {
                "<unknown>".to_owned()
            };
            (config.heart_beat_ms, host_name)
        };

        let mut connected = Frame::new(Command::Connected)
            .with_header("version", "1.2")
            .with_header("heart-beat", format!("{heart_beat_ms},{heart_beat_ms}"))
            .with_header("server", concat!("socketbox/", env!("CARGO_PKG_VERSION")))
            .with_header("session", channel.id().to_string())
            .with_header("host", host_name);
        for (key, value) in &metadata {
            connected = connected.with_header(format!("connectionMetadata-{key}"), value);
        }
        channel.send_frame(&connected);
        debug!(session = channel.id(), login = request.login, "client connected");
    }

    fn handle_send(&self, channel: &ChannelHandle, frame: &Frame) {
        let Some(destination) = frame.header("destination") else {
            self.send_error(
                channel,
                "missing destination",
                frame.header("receipt"),
                "SEND requires a destination header".to_owned(),
            );
            return;
        };

        if !self.authorized(channel, destination, Access::Write) {
            self.send_error(
                channel,
                "access denied",
                frame.header("receipt"),
                format!("write access to {destination} refused"),
            );
            return;
        }

        let mut message = frame.clone();
        message.set_header("publisher-id", channel.id().to_string());
        message.remove_header("login");
        message.remove_header("passcode");
        message.remove_header("receipt");

        self.route_message(destination, &message, true);
        self.send_receipt_if_requested(channel, frame);
    }

    fn handle_subscribe(&self, channel: &ChannelHandle, frame: &Frame) {
        let (Some(id), Some(destination)) = (frame.header("id"), frame.header("destination"))
        else {
            self.send_error(
                channel,
                "missing id or destination",
                frame.header("receipt"),
                "SUBSCRIBE requires id and destination headers".to_owned(),
            );
            return;
        };

        if !self.authorized(channel, destination, Access::Read) {
            self.send_error(
                channel,
                "access denied",
                frame.header("receipt"),
                format!("read access to {destination} refused"),
            );
            return;
        }

        let ack = AckMode::parse(frame.header("ack"));
        let parsed = parse_destination(destination);
        self.subscriptions.add_channel(
            &parsed.tail.to_ascii_lowercase(),
            channel,
            id,
            ack,
        );
        debug!(channel = channel.id(), destination, id, ack = ack.as_str(), "subscribed");
        self.send_receipt_if_requested(channel, frame);
    }

    fn handle_unsubscribe(&self, channel: &ChannelHandle, frame: &Frame) {
        let Some(id) = frame.header("id") else {
            self.send_error(
                channel,
                "missing id",
                frame.header("receipt"),
                "UNSUBSCRIBE requires an id header".to_owned(),
            );
            return;
        };
        self.subscriptions.remove_everywhere(&channel_key(channel.id(), id));
        self.send_receipt_if_requested(channel, frame);
    }

    fn handle_disconnect(&self, channel: &ChannelHandle, frame: &Frame) {
        self.subscriptions.remove_by_channel(channel.id());
        self.connections.write().remove(&channel.id());
        self.send_receipt_if_requested(channel, frame);
        // Writer drains the receipt before the socket actually closes.
        channel.close();
    }

    fn authorized(&self, channel: &ChannelHandle, destination: &str, access: Access) -> bool {
        let parsed = parse_destination(destination);
        let (login, metadata) = match self.connections.read().get(&channel.id()) {
            Some(conn) => (conn.login.clone(), conn.metadata.clone()),
            None => (String::new(), ConnectionMetadata::new()),
        };
        (self.hooks.authorize)(&AccessRequest {
            login: &login,
            exchange: parsed.exchange,
            destination: parsed.tail,
            access,
            channel: channel.id(),
            metadata: &metadata,
        })
    }

    fn send_receipt_if_requested(&self, channel: &ChannelHandle, frame: &Frame) {
        if let Some(receipt) = frame.header("receipt") {
            channel.send_frame(&Frame::new(Command::Receipt).with_header("receipt-id", receipt));
        }
    }

    /// Emit an ERROR frame, give the client a moment to drain, then close
    /// the transport, per STOMP.
    pub fn send_error(
        &self,
        channel: &ChannelHandle,
        message: &str,
        receipt_id: Option<&str>,
        detail: String,
    ) {
        let mut error = Frame::new(Command::Error).with_header("message", message);
        if let Some(receipt) = receipt_id {
            error = error.with_header("receipt-id", receipt);
        }
        channel.send_frame(&error.with_body(detail));

        let channel = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ERROR_DRAIN).await;
            channel.close();
        });
    }

    // -- routing --------------------------------------------------------

    /// Route one message through the exchange graph. With `rebroadcast`
    /// set and clustering enabled, the message is additionally wrapped in
    /// a rebroadcast envelope for every peer; replayed rebroadcasts MUST
    /// pass `rebroadcast = false` to prevent storms.
    pub fn route_message(&self, destination: &str, frame: &Frame, rebroadcast: bool) {
        self.route_local(destination, frame, 0);
        if rebroadcast {
            if let Some(cluster) = self.cluster() {
                cluster.rebroadcast_send(destination, frame);
            }
        }
    }

    /// Exchange re-entry point. Hops beyond [`HOP_LIMIT`] indicate a
    /// binding cycle; the message is dropped.
    pub(crate) fn route_local(&self, destination: &str, frame: &Frame, hops: u32) {
        if hops > HOP_LIMIT {
            error!(destination, "exchange hop limit exceeded; dropping message");
            return;
        }
        let parsed = parse_destination(destination);
        let exchange = self.exchanges.read().get(&parsed.exchange.to_ascii_lowercase()).cloned();
        match exchange {
            Some(exchange) => exchange.route(self, parsed.tail, frame, hops),
            None => {
                debug!(destination, exchange = parsed.exchange, "undefined exchange; dropped");
            }
        }
    }

    /// Deliver to every subscriber of a destination, in subscription
    /// order. Channel-backed subscribers get a MESSAGE frame; internal
    /// subscribers are invoked with the original frame.
    pub(crate) fn deliver_local(&self, destination: &str, frame: &Frame) {
        self.subscriptions.each(&destination.to_ascii_lowercase(), |_, sub| match sub {
            Subscriber::Channel { channel, subscription_id, .. } => {
                let mut message = frame.clone();
                message.command = Command::Message;
                message.remove_header("login");
                message.remove_header("passcode");
                message.remove_header("receipt");
                message.set_header("subscription", subscription_id.as_str());
                message.set_header("message-id", Uuid::new_v4().to_string());
                message.set_header("destination", destination);
                if !channel.send_frame(&message) {
                    debug!(channel = channel.id(), destination, "dead channel during delivery");
                }
            }
            Subscriber::Internal { callback } => callback(frame),
        });
    }
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
