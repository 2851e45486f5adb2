// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Destination → subscriber table.
//!
//! Buckets are created lazily with a double-checked existence test so the
//! outer map is only write-locked on first use of a destination. Empty
//! buckets may remain after their last subscriber leaves; the table stays
//! bounded by the number of distinct destinations ever used.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::channel::{ChannelHandle, ChannelId};
use crate::frame::Frame;

/// Server-side handler invoked synchronously for each routed frame.
pub type InternalCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// STOMP acknowledgement mode. Recognized at the frame level only; no
/// redelivery bookkeeping is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("client") => Self::Client,
            Some("client-individual") => Self::ClientIndividual,
            _ => Self::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }
}

/// One live interest in a destination.
#[derive(Clone)]
pub enum Subscriber {
    /// A connected client; delivery serializes a MESSAGE frame.
    Channel { channel: ChannelHandle, subscription_id: String, ack: AckMode },
    /// A server-side callback registered at configure time.
    Internal { callback: InternalCallback },
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { channel, subscription_id, ack } => f
                .debug_struct("Channel")
                .field("channel", &channel.id())
                .field("subscription_id", subscription_id)
                .field("ack", ack)
                .finish(),
            Self::Internal { .. } => f.debug_struct("Internal").finish_non_exhaustive(),
        }
    }
}

/// Key for a channel-backed subscription. A client may reuse the same
/// subscription id across connections, so the channel id disambiguates.
pub fn channel_key(channel: ChannelId, subscription_id: &str) -> String {
    format!("{channel}:{subscription_id}")
}

type Bucket = Arc<RwLock<IndexMap<String, Subscriber>>>;

/// Concurrent destination → subscriptions map. Delivery order within a
/// destination is subscription insertion order.
pub struct SubscriptionTable {
    buckets: RwLock<HashMap<String, Bucket>>,
    next_internal: AtomicU64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self { buckets: RwLock::new(HashMap::new()), next_internal: AtomicU64::new(1) }
    }

    /// Fetch or lazily create the bucket for a destination.
    fn bucket(&self, destination: &str) -> Bucket {
        if let Some(bucket) = self.buckets.read().get(destination) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write();
        // Double-check: another writer may have created it meanwhile.
        Arc::clone(buckets.entry(destination.to_owned()).or_default())
    }

    /// Register a channel-backed subscription; returns its bucket key.
    pub fn add_channel(
        &self,
        destination: &str,
        channel: &ChannelHandle,
        subscription_id: &str,
        ack: AckMode,
    ) -> String {
        let key = channel_key(channel.id(), subscription_id);
        let sub = Subscriber::Channel {
            channel: channel.clone(),
            subscription_id: subscription_id.to_owned(),
            ack,
        };
        self.bucket(destination).write().insert(key.clone(), sub);
        key
    }

    /// Register an internal subscription; returns its generated key.
    pub fn add_internal(&self, destination: &str, callback: InternalCallback) -> String {
        let key = format!("internal-{}", self.next_internal.fetch_add(1, Ordering::Relaxed));
        self.bucket(destination).write().insert(key.clone(), Subscriber::Internal { callback });
        key
    }

    /// Remove one subscription. Missing destination or key is a no-op.
    pub fn remove(&self, destination: &str, key: &str) -> bool {
        let Some(bucket) = self.buckets.read().get(destination).map(Arc::clone) else {
            return false;
        };
        let removed = bucket.write().shift_remove(key).is_some();
        removed
    }

    /// Remove a key from every destination (UNSUBSCRIBE does not name one).
    pub fn remove_everywhere(&self, key: &str) {
        for bucket in self.snapshot_buckets() {
            bucket.write().shift_remove(key);
        }
    }

    /// Drop every subscription belonging to a closed channel.
    pub fn remove_by_channel(&self, channel_id: ChannelId) {
        for bucket in self.snapshot_buckets() {
            bucket.write().retain(|_, sub| match sub {
                Subscriber::Channel { channel, .. } => channel.id() != channel_id,
                Subscriber::Internal { .. } => true,
            });
        }
    }

    /// Drop every internal subscription (reconfigure clears them; callers
    /// re-register afterwards).
    pub fn remove_all_internal(&self) {
        for bucket in self.snapshot_buckets() {
            bucket.write().retain(|_, sub| matches!(sub, Subscriber::Channel { .. }));
        }
    }

    /// Visit each subscriber of a destination in insertion order.
    ///
    /// Iterates over a snapshot so callbacks may re-enter the table.
    pub fn each(&self, destination: &str, mut f: impl FnMut(&str, &Subscriber)) {
        let Some(bucket) = self.buckets.read().get(destination).map(Arc::clone) else {
            return;
        };
        let snapshot: Vec<(String, Subscriber)> =
            bucket.read().iter().map(|(k, s)| (k.clone(), s.clone())).collect();
        for (key, sub) in &snapshot {
            f(key, sub);
        }
    }

    /// Count live subscriptions across all destinations.
    pub fn len(&self) -> usize {
        self.snapshot_buckets().iter().map(|b| b.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot_buckets(&self) -> Vec<Bucket> {
        self.buckets.read().values().map(Arc::clone).collect()
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
