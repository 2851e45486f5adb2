// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socketbox: a WebSocket-hosted STOMP 1.2 message broker with an
//! exchange-graph router and optional multi-node clustering.

pub mod broker;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod subscription;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerHooks};
use crate::cluster::cache::{CacheProvider, MemoryCache};
use crate::cluster::ClusterManager;
use crate::config::BrokerArgs;
use crate::error::BrokerError;

/// Run the broker until ctrl-c.
pub async fn run(args: BrokerArgs) -> anyhow::Result<()> {
    let config = args.load_config()?;
    let addr = format!("{}:{}", args.host, args.port);
    let shutdown = CancellationToken::new();

    let broker = Arc::new(Broker::new(config.clone(), BrokerHooks::default())?);
    if config.cluster.enable {
        let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
        let manager = attach_cluster(&broker, cache, shutdown.child_token())?;
        manager.start();
    }

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("socketbox listening on {addr}");

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    serve(broker, listener, shutdown).await
}

/// Serve an already-built broker on a listener until the token cancels,
/// then leave the cluster cleanly. Embedders and tests call this directly.
pub async fn serve(
    broker: Arc<Broker>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = transport::build_router(Arc::clone(&broker));
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;
    if let Some(cluster) = broker.cluster() {
        cluster.shutdown().await;
    }
    Ok(())
}

/// Wire a cluster manager to a broker using the broker's own cluster
/// configuration and the given cache provider.
pub fn attach_cluster(
    broker: &Arc<Broker>,
    cache: Arc<dyn CacheProvider>,
    shutdown: CancellationToken,
) -> Result<Arc<ClusterManager>, BrokerError> {
    let manager =
        ClusterManager::new(broker.config().cluster, cache, Arc::downgrade(broker), shutdown)?;
    broker.set_cluster(Arc::clone(&manager));
    Ok(manager)
}
