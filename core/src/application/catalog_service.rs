// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Catalog Service (spec §4.7, C7).
//!
//! TTL cache with single-flight aggregation on miss (spec §5/§9): a
//! `tokio::sync::Mutex` serializes the "which payload is current" decision
//! so two simultaneous cache misses perform one aggregation, mirroring the
//! teacher's `ToolRouter::list_all_tools` fan-out-then-merge shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::application::client_pool::ClientPool;
use crate::application::policy_service::PolicyService;
use crate::application::process_registry::ProcessRegistry;
use crate::domain::catalog::{CatalogPayload, ToolDescriptor};
use crate::infrastructure::json_rpc::methods;
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Copy)]
pub struct CatalogConfig {
    pub ttl: Duration,
    pub startup_timeout: Duration,
    pub initial_poll: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(10),
            initial_poll: Duration::from_millis(50),
        }
    }
}

struct CachedPayload {
    payload: CatalogPayload,
    expires_at: chrono::DateTime<Utc>,
}

pub struct CatalogService {
    registry: Arc<ProcessRegistry>,
    client_pool: Arc<ClientPool>,
    policy: Arc<PolicyService>,
    config: CatalogConfig,
    cache: Mutex<Option<CachedPayload>>,
}

impl CatalogService {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        client_pool: Arc<ClientPool>,
        policy: Arc<PolicyService>,
        config: CatalogConfig,
    ) -> Self {
        Self {
            registry,
            client_pool,
            policy,
            config,
            cache: Mutex::new(None),
        }
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Returns the current catalog, aggregating fresh if the cache is
    /// absent or expired. The cache lock is held for the full miss path so
    /// concurrent callers single-flight onto one aggregation (spec §5).
    pub async fn get_catalog(&self) -> CatalogPayload {
        let mut cache = self.cache.lock().await;
        let now = Utc::now();
        if let Some(cached) = cache.as_ref() {
            if now < cached.expires_at {
                telemetry::record_catalog_handshake(true, cached.payload.tools.len());
                return cached.payload.clone();
            }
        }

        let tools = self.warm_up_and_aggregate().await;
        let filtered: Vec<ToolDescriptor> = tools
            .into_iter()
            .filter(|t| !self.policy.is_revoked(&t.id))
            .collect();
        let payload = CatalogPayload {
            tools: filtered,
            collected_at: now,
        };
        telemetry::record_catalog_handshake(false, payload.tools.len());
        *cache = Some(CachedPayload {
            payload: payload.clone(),
            expires_at: now + chrono::Duration::from_std(self.config.ttl).unwrap_or_default(),
        });
        payload
    }

    async fn warm_up_and_aggregate(&self) -> Vec<ToolDescriptor> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        let mut attempt: u32 = 0;

        loop {
            let eligible: Vec<String> = self
                .registry
                .list()
                .await
                .into_iter()
                .filter(|s| s.has_live_process())
                .map(|s| s.definition.id)
                .collect();

            if !eligible.is_empty() {
                let tools = self.aggregate(&eligible).await;
                if !tools.is_empty() || tokio::time::Instant::now() >= deadline {
                    return tools;
                }
            } else if tokio::time::Instant::now() >= deadline {
                tracing::warn!("catalog warm-up deadline elapsed with no eligible servers");
                return Vec::new();
            }

            let backoff = self.config.initial_poll.saturating_mul(1u32 << attempt.min(10));
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            attempt += 1;
        }
    }

    async fn aggregate(&self, server_ids: &[String]) -> Vec<ToolDescriptor> {
        let futures = server_ids.iter().map(|id| self.list_tools_for(id));
        let results = futures::future::join_all(futures).await;
        results.into_iter().flatten().collect()
    }

    async fn list_tools_for(&self, server_id: &str) -> Vec<ToolDescriptor> {
        let client = match self.client_pool.get_client(server_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(server_id, error = %e, "catalog: failed to acquire client");
                return Vec::new();
            }
        };

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({"cursor": c}))
                .or_else(|| Some(serde_json::json!({})));
            let response = match client.call(methods::TOOLS_LIST, params).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(server_id, error = %e, "catalog: tools/list failed");
                    self.client_pool.invalidate(server_id).await;
                    break;
                }
            };
            let Some(entries) = response.get("tools").and_then(Value::as_array) else {
                break;
            };
            for entry in entries {
                if let Some(descriptor) = parse_tool_entry(server_id, entry) {
                    tools.push(descriptor);
                }
            }
            cursor = response
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        tools
    }
}

fn parse_tool_entry(server_id: &str, entry: &Value) -> Option<ToolDescriptor> {
    let name = entry.get("name")?.as_str()?.to_string();
    let authorized = entry
        .get("annotations")
        .and_then(|a| a.get("authorized"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !authorized {
        return None;
    }
    let permissions = entry
        .get("permissions")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Some(ToolDescriptor {
        id: ToolDescriptor::qualify(server_id, &name),
        name,
        description: entry.get("description").and_then(Value::as_str).map(str::to_string),
        input_schema: entry.get("inputSchema").cloned(),
        permissions,
        transport: "stdio".to_string(),
        server_id: server_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tool_entry_drops_unauthorized_and_unnamed() {
        let v = serde_json::json!({"name": "Restricted", "annotations": {"authorized": false}});
        assert!(parse_tool_entry("server-a", &v).is_none());

        let v = serde_json::json!({"annotations": {}});
        assert!(parse_tool_entry("server-a", &v).is_none());

        let v = serde_json::json!({"name": "Summarize", "permissions": ["read"]});
        let d = parse_tool_entry("server-a", &v).unwrap();
        assert_eq!(d.id, "server-a:Summarize");
        assert_eq!(d.permissions, vec!["read".to_string()]);
    }
}
