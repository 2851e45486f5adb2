// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handle to one open WebSocket, decoupled from the transport task.
//!
//! Outbound frames are enqueued on an unbounded sender drained by the
//! connection's writer loop, so routing never awaits the socket.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::frame::Frame;

/// Process-unique identity of one open socket. Doubles as the STOMP
/// session id for the life of the connection.
pub type ChannelId = u64;

/// Cheap, cloneable handle to a live connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { id, tx, cancel }
    }

    /// Build a handle plus the receiver its writer loop drains. Used by the
    /// transport on accept and by tests that capture outbound traffic.
    pub fn pair(id: ChannelId) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx, CancellationToken::new()), rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Enqueue raw text for the writer loop. Returns false when the
    /// connection is already gone; callers treat that as a dead channel.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }

    pub fn send_frame(&self, frame: &Frame) -> bool {
        self.send_text(frame.serialize())
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    /// Ask the transport loop to close the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Token the transport loop selects on; cancelled by [`close`].
    ///
    /// [`close`]: Self::close
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
