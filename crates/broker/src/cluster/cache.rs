// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared-cache discovery schema and the in-memory default provider.
//!
//! The cache is the cluster's only rendezvous: peers register under a
//! newline-delimited list key, heartbeat under per-peer checkin keys, and
//! elect a manager under a third key. Writes are assumed non-atomic;
//! callers use read-modify-write with verify and rely on convergence
//! within a few scheduler ticks.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Pluggable cluster cache. Implementations back onto whatever shared
/// store the deployment has; `get` returns `None` for missing keys.
pub trait CacheProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn clear(&self, key: &str);
}

/// Process-local cache, the default provider. Suitable for tests and for
/// single-process multi-broker setups; real clusters supply their own.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheProvider for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.write().insert(key.to_owned(), value.to_owned());
    }

    fn clear(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

pub(crate) fn peers_key(prefix: &str) -> String {
    format!("{prefix}socketbox-cluster-peers")
}

pub(crate) fn checkin_key(prefix: &str, peer: &str) -> String {
    format!("{prefix}socketbox-cluster-peers-{peer}")
}

pub(crate) fn manager_key(prefix: &str) -> String {
    format!("{prefix}socketbox-cluster-peers-manager")
}

/// Parse the newline-delimited peer list, dropping blanks.
pub(crate) fn parse_peer_list(raw: &str) -> Vec<String> {
    raw.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect()
}

pub(crate) fn join_peer_list(names: &[String]) -> String {
    names.join("\n")
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
