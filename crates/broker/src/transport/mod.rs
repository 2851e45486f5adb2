// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the broker.

pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::broker::Broker;

/// Build the axum `Router`: the STOMP WebSocket endpoint plus a liveness
/// probe for load balancers.
pub fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/stomp", get(ws::stomp_handler))
        .layer(CorsLayer::permissive())
        .with_state(broker)
}

/// `GET /api/v1/health` — liveness JSON, no auth.
async fn health(State(broker): State<Arc<Broker>>) -> Json<Value> {
    let cluster = broker.cluster().map(|cluster| {
        json!({
            "peers": cluster.connected_peers().len(),
            "manager": cluster.manager_name(),
            "uptime_secs": cluster.uptime_secs(),
        })
    });
    Json(json!({
        "status": "running",
        "sessions": broker.session_count(),
        "cluster": cluster,
    }))
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
