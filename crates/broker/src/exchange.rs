// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exchange graph: routing nodes that map destinations to subscribers or
//! to other destinations.
//!
//! Exchanges may chain into one another (a topic binding typically targets
//! a direct exchange). Re-entry is bounded by [`HOP_LIMIT`] so a
//! misconfigured graph drops messages instead of diverging.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use tracing::warn;

use crate::broker::Broker;
use crate::config::{BindingTargets, ExchangeConfig};
use crate::error::BrokerError;
use crate::frame::Frame;

/// Maximum exchange re-entries for one published message.
pub const HOP_LIMIT: u32 = 32;

/// The exchange a bare destination routes through.
pub const DEFAULT_EXCHANGE: &str = "direct";

/// A destination split into its exchange prefix and routable tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDestination<'a> {
    pub exchange: &'a str,
    pub tail: &'a str,
}

/// Split `<exchange>/<tail>`; a destination without `/` routes through the
/// default `direct` exchange. The tail may itself contain `/` and is
/// re-parsed when an exchange re-routes.
pub fn parse_destination(raw: &str) -> ParsedDestination<'_> {
    match raw.split_once('/') {
        Some((exchange, tail)) if !exchange.is_empty() => ParsedDestination { exchange, tail },
        _ => ParsedDestination { exchange: DEFAULT_EXCHANGE, tail: raw },
    }
}

/// Target-selection strategy for distribution exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Random,
    RoundRobin,
}

impl Strategy {
    pub fn parse(value: &str) -> Result<Self, BrokerError> {
        match value {
            "random" => Ok(Self::Random),
            "roundrobin" => Ok(Self::RoundRobin),
            other => Err(BrokerError::UnknownDistributionType(other.to_owned())),
        }
    }
}

enum ExchangeKind {
    /// Exact-match delivery to subscribers, then chained bindings.
    Direct { bindings: IndexMap<String, String> },
    /// Pattern-match re-routing; never delivers to subscribers directly.
    Topic { bindings: Vec<(Regex, String)> },
    /// Re-route to every bound target.
    Fanout { bindings: IndexMap<String, Vec<String>> },
    /// Re-route to exactly one bound target.
    Distribution {
        bindings: IndexMap<String, Vec<String>>,
        strategy: Strategy,
        cursor: Mutex<u64>,
    },
}

/// A named routing node. Stateless except the distribution cursor.
pub struct Exchange {
    name: String,
    kind: ExchangeKind,
}

impl Exchange {
    pub fn direct(name: impl Into<String>, bindings: IndexMap<String, String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Direct { bindings: lowercase_keys(bindings) } }
    }

    pub fn topic(
        name: impl Into<String>,
        bindings: IndexMap<String, String>,
    ) -> Result<Self, BrokerError> {
        let mut compiled = Vec::with_capacity(bindings.len());
        for (pattern, target) in bindings {
            compiled.push((compile_topic_pattern(&pattern)?, target));
        }
        Ok(Self { name: name.into(), kind: ExchangeKind::Topic { bindings: compiled } })
    }

    pub fn fanout(name: impl Into<String>, bindings: IndexMap<String, Vec<String>>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Fanout { bindings: lowercase_keys(bindings) } }
    }

    pub fn distribution(
        name: impl Into<String>,
        bindings: IndexMap<String, Vec<String>>,
        strategy: Strategy,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Distribution {
                bindings: lowercase_keys(bindings),
                strategy,
                cursor: Mutex::new(0),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Carry a distribution exchange's round-robin position across a
    /// rebuild. No-op for other classes.
    pub(crate) fn adopt_cursor(&self, previous: &Exchange) {
        if let (
            ExchangeKind::Distribution { cursor, .. },
            ExchangeKind::Distribution { cursor: previous, .. },
        ) = (&self.kind, &previous.kind)
        {
            *cursor.lock() = *previous.lock();
        }
    }

    pub fn class(&self) -> &'static str {
        match self.kind {
            ExchangeKind::Direct { .. } => "direct",
            ExchangeKind::Topic { .. } => "topic",
            ExchangeKind::Fanout { .. } => "fanout",
            ExchangeKind::Distribution { .. } => "distribution",
        }
    }

    /// Route one frame. `destination` is the tail after this exchange's
    /// prefix was stripped; comparisons are case-insensitive.
    pub fn route(&self, broker: &Broker, destination: &str, frame: &Frame, hops: u32) {
        let key = destination.to_ascii_lowercase();
        match &self.kind {
            ExchangeKind::Direct { bindings } => {
                broker.deliver_local(destination, frame);
                if let Some(target) = bindings.get(&key) {
                    broker.route_local(target, frame, hops + 1);
                }
            }
            ExchangeKind::Topic { bindings } => {
                for (pattern, target) in bindings {
                    if pattern.is_match(&key) {
                        broker.route_local(target, frame, hops + 1);
                    }
                }
            }
            ExchangeKind::Fanout { bindings } => {
                if let Some(targets) = bindings.get(&key) {
                    for target in targets {
                        broker.route_local(target, frame, hops + 1);
                    }
                }
            }
            ExchangeKind::Distribution { bindings, strategy, cursor } => {
                let Some(targets) = bindings.get(&key) else { return };
                // A zero-length target list is "no route".
                if let Some(target) = choose_target(targets, *strategy, cursor) {
                    broker.route_local(target, frame, hops + 1);
                }
            }
        }
    }
}

fn choose_target<'a>(
    targets: &'a [String],
    strategy: Strategy,
    cursor: &Mutex<u64>,
) -> Option<&'a str> {
    if targets.is_empty() {
        return None;
    }
    let idx = match strategy {
        Strategy::Random => rand::rng().random_range(0..targets.len()),
        Strategy::RoundRobin => {
            let mut cursor = cursor.lock();
            let idx = (*cursor % targets.len() as u64) as usize;
            *cursor += 1;
            idx
        }
    };
    targets.get(idx).map(String::as_str)
}

/// Translate a topic pattern to an anchored, lowercased regex:
/// `.` separates segments, `*` matches one segment, `#` matches any
/// remainder (`.#` also matches the empty remainder, so `a.#` covers `a`).
pub fn compile_topic_pattern(pattern: &str) -> Result<Regex, BrokerError> {
    let lowered = pattern.to_ascii_lowercase();
    let mut re = String::with_capacity(lowered.len() + 8);
    re.push('^');
    let mut chars = lowered.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' if chars.peek() == Some(&'#') => {
                chars.next();
                re.push_str("(\\..*)?");
            }
            '.' => re.push_str("\\."),
            '*' => re.push_str("[^\\.]*"),
            '#' => re.push_str(".*"),
            c if is_regex_meta(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|err| {
        BrokerError::InvalidConfiguration(format!("topic pattern {pattern:?}: {err}"))
    })
}

fn is_regex_meta(c: char) -> bool {
    matches!(c, '\\' | '+' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$')
}

fn lowercase_keys<V>(bindings: IndexMap<String, V>) -> IndexMap<String, V> {
    bindings.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect()
}

/// Build the exchange table from configuration. The default `direct`
/// exchange always exists even when omitted. Any error leaves the caller's
/// existing table untouched (build-then-swap).
pub fn build_exchanges(
    configs: &HashMap<String, ExchangeConfig>,
) -> Result<HashMap<String, Arc<Exchange>>, BrokerError> {
    let mut exchanges: HashMap<String, Arc<Exchange>> = HashMap::with_capacity(configs.len() + 1);
    for (name, config) in configs {
        let name = name.to_ascii_lowercase();
        let exchange = build_exchange(&name, config)?;
        if exchanges.insert(name.clone(), Arc::new(exchange)).is_some() {
            warn!(exchange = %name, "duplicate exchange name after case folding");
        }
    }
    exchanges
        .entry(DEFAULT_EXCHANGE.to_owned())
        .or_insert_with(|| Arc::new(Exchange::direct(DEFAULT_EXCHANGE, IndexMap::new())));
    Ok(exchanges)
}

fn build_exchange(name: &str, config: &ExchangeConfig) -> Result<Exchange, BrokerError> {
    match config.class.as_str() {
        "direct" => Ok(Exchange::direct(name, single_target_bindings(name, config)?)),
        "topic" => Exchange::topic(name, single_target_bindings(name, config)?),
        "fanout" => Ok(Exchange::fanout(name, multi_target_bindings(config))),
        "distribution" => {
            let strategy = match config.distribution_type.as_deref() {
                Some(value) => Strategy::parse(value)?,
                None => Strategy::RoundRobin,
            };
            Ok(Exchange::distribution(name, multi_target_bindings(config), strategy))
        }
        other => Err(BrokerError::InvalidConfiguration(format!(
            "exchange {name:?} has unknown class {other:?}"
        ))),
    }
}

fn single_target_bindings(
    name: &str,
    config: &ExchangeConfig,
) -> Result<IndexMap<String, String>, BrokerError> {
    let mut out = IndexMap::with_capacity(config.bindings.len());
    for (pattern, targets) in &config.bindings {
        match targets {
            BindingTargets::One(target) => {
                out.insert(pattern.clone(), target.clone());
            }
            BindingTargets::Many(_) => {
                return Err(BrokerError::InvalidConfiguration(format!(
                    "exchange {name:?} binding {pattern:?} must map to a single target"
                )));
            }
        }
    }
    Ok(out)
}

fn multi_target_bindings(config: &ExchangeConfig) -> IndexMap<String, Vec<String>> {
    config
        .bindings
        .iter()
        .map(|(pattern, targets)| {
            let list = match targets {
                BindingTargets::One(target) => vec![target.clone()],
                BindingTargets::Many(list) => list.clone(),
            };
            (pattern.clone(), list)
        })
        .collect()
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod tests;
