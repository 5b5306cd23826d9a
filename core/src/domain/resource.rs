// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tracked Resource and Delivered-Event Ledger (spec §3, §4.9, C9).

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

/// Per-server resource-tracking state.
#[derive(Debug, Default)]
pub struct TrackedServerResources {
    pub subscribed: HashSet<String>,
    pub pending_reads: HashSet<String>,
    pub retry_attempt: u32,
    pub unsupported: bool,
    pub disposed: bool,
}

impl TrackedServerResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds/removes differences relative to the new known resource set,
    /// returning `(to_subscribe, to_unsubscribe)`.
    pub fn diff(&self, known: &HashSet<String>) -> (Vec<String>, Vec<String>) {
        let to_subscribe = known.difference(&self.subscribed).cloned().collect();
        let to_unsubscribe = self.subscribed.difference(known).cloned().collect();
        (to_subscribe, to_unsubscribe)
    }

    pub fn apply_diff(&mut self, known: HashSet<String>) {
        self.subscribed = known;
    }
}

/// Process-wide bounded LRU mapping `(server_id, uri)` to the last delivered
/// timestamp, used to dedupe `resource_update` emissions within a window
/// (spec invariant 7). Eviction policy is FIFO-on-full (Open Question #3,
/// see DESIGN.md) — simplest rule that bounds memory without pretending to
/// model true access recency.
pub struct DedupeLedger {
    capacity: usize,
    order: VecDeque<(String, String)>,
    last_emit: HashMap<(String, String), DateTime<Utc>>,
}

impl DedupeLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            last_emit: HashMap::new(),
        }
    }

    /// Returns `true` if an update for `(server_id, uri)` should be
    /// suppressed because one was emitted within `window`.
    pub fn should_suppress(&self, server_id: &str, uri: &str, window: chrono::Duration) -> bool {
        let key = (server_id.to_string(), uri.to_string());
        match self.last_emit.get(&key) {
            Some(last) => Utc::now() - *last < window,
            None => false,
        }
    }

    pub fn record_emit(&mut self, server_id: &str, uri: &str) {
        let key = (server_id.to_string(), uri.to_string());
        if self.last_emit.insert(key.clone(), Utc::now()).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.last_emit.remove(&oldest);
                }
            }
        }
    }
}

impl Default for DedupeLedger {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_suppresses_within_window() {
        let mut ledger = DedupeLedger::new(10);
        let window = chrono::Duration::seconds(30);
        assert!(!ledger.should_suppress("server-a", "mcp://resource/alpha", window));
        ledger.record_emit("server-a", "mcp://resource/alpha");
        assert!(ledger.should_suppress("server-a", "mcp://resource/alpha", window));
    }

    #[test]
    fn dedupe_evicts_oldest_when_full() {
        let mut ledger = DedupeLedger::new(2);
        ledger.record_emit("s", "a");
        ledger.record_emit("s", "b");
        ledger.record_emit("s", "c");
        assert_eq!(ledger.order.len(), 2);
        assert!(!ledger.last_emit.contains_key(&("s".to_string(), "a".to_string())));
    }

    #[test]
    fn diff_computes_add_and_remove() {
        let mut tracked = TrackedServerResources::new();
        tracked.apply_diff(HashSet::from(["a".to_string(), "b".to_string()]));
        let known = HashSet::from(["b".to_string(), "c".to_string()]);
        let (add, remove) = tracked.diff(&known);
        assert_eq!(add, vec!["c".to_string()]);
        assert_eq!(remove, vec!["a".to_string()]);
    }
}
