// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One outbound management link to a cluster peer.
//!
//! Senders enqueue onto an unbounded channel drained by the link's pump
//! task, which satisfies the transport's single-writer requirement without
//! holding a lock across socket writes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::{ClusterManager, MANAGEMENT_HEADER, MANAGEMENT_NAME_HEADER};

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Handle to one outbound peer WebSocket. The name is the peer's
/// advertised URL, its only cluster-wide identity.
pub struct PeerLink {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl PeerLink {
    /// Create the link and spawn its connect-and-pump task.
    pub fn spawn(manager: &Arc<ClusterManager>, name: String) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            name: name.clone(),
            tx,
            state: AtomicU8::new(STATE_CONNECTING),
            cancel: manager.shutdown_token().child_token(),
        });
        tokio::spawn(run_link(Arc::clone(manager), Arc::clone(&link), rx));
        link
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue text for the pump task. Messages enqueued while the link is
    /// still connecting flush once the handshake completes; a send on a
    /// closed link is logged by the caller and pruned at the next scan.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(text.into()).is_ok()
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Ask the pump task to close the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn run_link(
    manager: Arc<ClusterManager>,
    link: Arc<PeerLink>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let request = match build_request(&link.name, manager.secret_key(), manager.self_name()) {
        Ok(request) => request,
        Err(err) => {
            warn!(peer = %link.name, err = %err, "invalid peer URL or headers");
            finish(&manager, &link);
            return;
        }
    };

    let connect = tokio_tungstenite::connect_async(request);
    let ws = tokio::select! {
        _ = link.cancel.cancelled() => {
            finish(&manager, &link);
            return;
        }
        attempt = tokio::time::timeout(manager.peer_connect_timeout(), connect) => match attempt {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                // Refused connections and unresolved hostnames are
                // transient; the adaptive scheduler retries quickly.
                warn!(peer = %link.name, err = %err, "peer connect failed");
                finish(&manager, &link);
                return;
            }
            Err(_) => {
                warn!(peer = %link.name, "peer connect timed out");
                finish(&manager, &link);
                return;
            }
        },
    };

    link.state.store(STATE_OPEN, Ordering::SeqCst);
    manager.cluster_updated();
    debug!(peer = %link.name, "management link established");

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(peer = %link.name, err = %err, "management send failed");
                        break;
                    }
                }
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    manager.handle_management_message(&link.name, &text);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(peer = %link.name, "management link closed by peer");
                    break;
                }
                Some(Err(err)) => {
                    debug!(peer = %link.name, err = %err, "management link error");
                    break;
                }
                _ => {} // ping/pong/binary handled by the transport
            },
        }
    }

    finish(&manager, &link);
}

/// Mark the link dead and let the manager drop its entry. The socket is
/// already gone, so no close is attempted.
fn finish(manager: &Arc<ClusterManager>, link: &Arc<PeerLink>) {
    link.state.store(STATE_CLOSED, Ordering::SeqCst);
    manager.peer_link_closed(&link.name);
}

fn build_request(
    url: &str,
    secret: &str,
    self_name: &str,
) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(MANAGEMENT_HEADER, HeaderValue::from_str(secret)?);
    headers.insert(MANAGEMENT_NAME_HEADER, HeaderValue::from_str(self_name)?);
    Ok(request)
}
