// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC wire types and request/response correlation.
//!
//! Outstanding requests are keyed by uuid; each holds a one-shot waiter
//! released by response arrival. Timeouts are enforced by the caller, so a
//! response that lands after its entry was removed is dropped silently.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

pub const RPC_REQUEST_PREFIX: &str = "__rpc_request__";
pub const RPC_RESPONSE_PREFIX: &str = "__rpc_response__";

/// An RPC call as carried inside a `__rpc_request__` envelope.
/// `peer_name` is the *sender's* advertised URL, used to route the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub operation: String,
    #[serde(rename = "peerName")]
    pub peer_name: String,
    #[serde(default)]
    pub args: Value,
    pub id: String,
}

/// An RPC reply as carried inside a `__rpc_response__` envelope.
/// `execution_time_ms` is stamped by the *receiving* side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub result: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "executionTimeMS", default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// One peer's leg of a cluster-wide RPC.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRpcOutcome {
    pub success: bool,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PendingRpc {
    started: Instant,
    tx: oneshot::Sender<RpcResponse>,
}

/// Correlates in-flight request ids to their waiters.
pub(crate) struct RpcCoordinator {
    pending: Mutex<HashMap<String, PendingRpc>>,
}

impl RpcCoordinator {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Register an outstanding request; the returned receiver resolves on
    /// response arrival.
    pub fn register(&self, id: String) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingRpc { started: Instant::now(), tx });
        rx
    }

    /// Route a response to its waiter, stamping `executionTimeMS`. A
    /// response whose entry no longer exists (timed out, cancelled) is
    /// dropped.
    pub fn complete(&self, mut response: RpcResponse) {
        let Some(entry) = self.pending.lock().remove(&response.id) else {
            debug!(id = %response.id, "late RPC response dropped");
            return;
        };
        response.execution_time_ms = Some(entry.started.elapsed().as_millis() as u64);
        // The waiter may have given up between removal and send.
        let _ = entry.tx.send(response);
    }

    /// Forget an outstanding request after timeout or send failure.
    pub fn cancel(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
