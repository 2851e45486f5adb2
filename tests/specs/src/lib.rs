// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end broker scenarios over real sockets: in-process
//! nodes on ephemeral ports plus a minimal STOMP WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use socketbox::broker::{Broker, BrokerHooks};
use socketbox::cluster::cache::CacheProvider;
use socketbox::cluster::ClusterManager;
use socketbox::config::BrokerConfig;
use socketbox::frame::{self, Command, Frame, Inbound};

/// One broker node bound to an ephemeral port.
pub struct SpecNode {
    pub broker: Arc<Broker>,
    pub manager: Option<Arc<ClusterManager>>,
    /// The node's advertised URL (cluster identity when clustered).
    pub name: String,
    shutdown: CancellationToken,
}

impl SpecNode {
    /// Start a standalone broker.
    pub async fn start(config: BrokerConfig) -> anyhow::Result<Self> {
        Self::start_inner(config, None).await
    }

    /// Start a cluster node. The advertised name is fixed up to the bound
    /// address, since the port is only known after listening.
    pub async fn start_clustered(
        mut config: BrokerConfig,
        cache: Arc<dyn CacheProvider>,
    ) -> anyhow::Result<Self> {
        config.cluster.enable = true;
        Self::start_inner(config, Some(cache)).await
    }

    async fn start_inner(
        mut config: BrokerConfig,
        cache: Option<Arc<dyn CacheProvider>>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let name = format!("ws://127.0.0.1:{port}/stomp");
        if config.cluster.enable {
            config.cluster.name = name.clone();
        }

        let shutdown = CancellationToken::new();
        let broker = Arc::new(Broker::new(config, BrokerHooks::default())?);
        let manager = match cache {
            Some(cache) => {
                let manager = socketbox::attach_cluster(&broker, cache, shutdown.child_token())?;
                manager.start();
                Some(manager)
            }
            None => None,
        };

        tokio::spawn(socketbox::serve(Arc::clone(&broker), listener, shutdown.clone()));
        Ok(Self { broker, manager, name, shutdown })
    }

    pub fn ws_url(&self) -> String {
        self.name.clone()
    }

    /// Wait until this node holds open links to at least `count` peers.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> anyhow::Result<()> {
        let Some(manager) = &self.manager else {
            anyhow::bail!("not a cluster node");
        };
        let deadline = tokio::time::Instant::now() + timeout;
        while manager.connected_peers().len() < count {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "peers never connected (have {:?})",
                    manager.connected_peers()
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// A minimal STOMP client over a WebSocket.
pub struct StompClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StompClient {
    /// Open the socket and complete the STOMP CONNECT handshake.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let mut client = Self { ws };
        client
            .send(
                Frame::new(Command::Connect)
                    .with_header("login", "spec")
                    .with_header("passcode", "spec"),
            )
            .await?;
        let connected = client.recv(Duration::from_secs(5)).await?;
        anyhow::ensure!(
            connected.command == Command::Connected,
            "expected CONNECTED, got {connected:?}"
        );
        Ok(client)
    }

    pub async fn send(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.send_text(&frame.serialize()).await
    }

    pub async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.ws.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next raw text message from the server.
    pub async fn recv_text(&mut self, timeout: Duration) -> anyhow::Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for a message"))?;
            let msg = tokio::time::timeout(remaining, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for a message"))?
                .ok_or_else(|| anyhow::anyhow!("stream ended"))??;
            if let Message::Text(text) = msg {
                return Ok(text.to_string());
            }
        }
    }

    /// Next STOMP frame, skipping heart-beats.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for a frame"))?;
            match frame::parse(&self.recv_text(remaining).await?)? {
                Inbound::Frame(frame) => return Ok(frame),
                Inbound::Heartbeat => continue,
            }
        }
    }

    /// Assert that no frame arrives within the window.
    pub async fn expect_quiet(&mut self, window: Duration) -> anyhow::Result<()> {
        match tokio::time::timeout(window, self.ws.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => anyhow::bail!("unexpected frame: {text}"),
            Ok(_) => Ok(()),
        }
    }

    /// Subscribe and wait for the receipt so later publishes race nothing.
    pub async fn subscribe(&mut self, id: &str, destination: &str) -> anyhow::Result<()> {
        self.send(
            Frame::new(Command::Subscribe)
                .with_header("id", id)
                .with_header("destination", destination)
                .with_header("receipt", "sub"),
        )
        .await?;
        let receipt = self.recv(Duration::from_secs(5)).await?;
        anyhow::ensure!(receipt.command == Command::Receipt, "expected RECEIPT, got {receipt:?}");
        Ok(())
    }

    /// Publish and wait for the receipt, making delivery order
    /// deterministic across consecutive publishes.
    pub async fn publish(&mut self, destination: &str, body: &str) -> anyhow::Result<()> {
        self.send(
            Frame::new(Command::Send)
                .with_header("destination", destination)
                .with_header("receipt", "pub")
                .with_body(body),
        )
        .await?;
        let receipt = self.recv(Duration::from_secs(5)).await?;
        anyhow::ensure!(receipt.command == Command::Receipt, "expected RECEIPT, got {receipt:?}");
        Ok(())
    }
}
