// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process Registry (spec §4.2, C2): a pure, in-memory state container with
//! no I/O. Grounded on the teacher's `ToolRouter`'s
//! `Arc<RwLock<HashMap<ToolServerId, ToolServer>>>` registry shape.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::server::{ServerDefinition, ServerState};

#[derive(Default)]
pub struct ProcessRegistry {
    servers: RwLock<HashMap<String, ServerState>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing record for `def.id`, creating one in `stopped`
    /// state if absent.
    pub async fn ensure(&self, def: ServerDefinition) -> ServerState {
        let mut servers = self.servers.write().await;
        servers
            .entry(def.id.clone())
            .or_insert_with(|| ServerState::new(def))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<ServerState> {
        self.servers.read().await.get(id).cloned()
    }

    /// Applies `patch` to the stored record, if present, returning the
    /// updated snapshot.
    pub async fn update<F>(&self, id: &str, patch: F) -> Option<ServerState>
    where
        F: FnOnce(&mut ServerState),
    {
        let mut servers = self.servers.write().await;
        let state = servers.get_mut(id)?;
        patch(state);
        Some(state.clone())
    }

    pub async fn remove(&self, id: &str) -> Option<ServerState> {
        self.servers.write().await.remove(id)
    }

    pub async fn list(&self) -> Vec<ServerState> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str) -> ServerDefinition {
        ServerDefinition {
            id: id.to_string(),
            command: "true".to_string(),
            args: vec![],
            description: None,
            enabled: true,
            track_resources: false,
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let registry = ProcessRegistry::new();
        let first = registry.ensure(def("codex")).await;
        registry
            .update("codex", |s| {
                s.mark_spawned(42);
            })
            .await;
        let second = registry.ensure(def("codex")).await;
        assert_eq!(first.definition.id, second.definition.id);
        assert_eq!(second.pid, Some(42));
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let registry = ProcessRegistry::new();
        registry.ensure(def("codex")).await;
        assert!(registry.remove("codex").await.is_some());
        assert!(registry.get("codex").await.is_none());
    }
}
