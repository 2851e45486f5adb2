// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint for STOMP clients and cluster management links.
//!
//! Every accepted socket is classified exactly once from its upgrade
//! headers: regular client, management link from a peer, or our own
//! advertised URL looping back (whose traffic is ignored entirely).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::Broker;
use crate::channel::ChannelHandle;
use crate::cluster::{ChannelClass, MANAGEMENT_HEADER, MANAGEMENT_NAME_HEADER};
use crate::frame::{self, Inbound};

/// `GET /stomp` — WebSocket upgrade for clients and peers alike.
pub async fn stomp_handler(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let class = match broker.cluster() {
        Some(cluster) => cluster.classify(
            header_str(&headers, MANAGEMENT_HEADER),
            header_str(&headers, MANAGEMENT_NAME_HEADER),
        ),
        None => ChannelClass::Client,
    };
    ws.on_upgrade(move |socket| handle_socket(broker, socket, class))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Per-connection loop: single reader preserves arrival order, single
/// writer drains the channel queue.
async fn handle_socket(broker: Arc<Broker>, socket: WebSocket, class: ChannelClass) {
    let id = broker.next_channel_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = ChannelHandle::new(id, tx, CancellationToken::new());

    match &class {
        ChannelClass::Client => broker.channel_opened(&channel),
        ChannelClass::Management { peer_name } => {
            debug!(channel = id, peer = %peer_name, "management link accepted");
            if let Some(cluster) = broker.cluster() {
                cluster.register_management_channel(peer_name, &channel);
            }
        }
        ChannelClass::SelfLink => {
            debug!(channel = id, "own advertised URL looped back");
            if let Some(cluster) = broker.cluster() {
                cluster.register_self_channel(&channel);
            }
        }
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            _ = channel.cancellation().cancelled() => {
                // Flush already-enqueued receipts and errors, then close.
                while let Ok(text) = rx.try_recv() {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&broker, &channel, &class, text.to_string());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(channel = id, err = %err, "websocket error");
                    break;
                }
                _ => {} // transport-level ping/pong/binary
            },
        }
    }

    match &class {
        ChannelClass::Client => broker.channel_closed(id),
        ChannelClass::Management { .. } | ChannelClass::SelfLink => {
            if let Some(cluster) = broker.cluster() {
                cluster.management_channel_closed(id);
            }
        }
    }
    debug!(channel = id, "connection closed");
}

fn handle_text(broker: &Arc<Broker>, channel: &ChannelHandle, class: &ChannelClass, text: String) {
    match class {
        ChannelClass::Client => match frame::parse(&text) {
            Ok(Inbound::Heartbeat) => {
                channel.send_text(frame::HEARTBEAT);
            }
            Ok(Inbound::Frame(frame)) => broker.handle_frame(channel, &frame),
            Err(err) => broker.send_error(channel, "malformed frame", None, err.to_string()),
        },
        ChannelClass::Management { peer_name } => {
            if let Some(cluster) = broker.cluster() {
                cluster.handle_management_message(peer_name, &text);
            }
        }
        ChannelClass::SelfLink => {} // never process our own loopback
    }
}
