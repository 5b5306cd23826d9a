// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Tracker (spec §4.9, C9).
//!
//! Periodic sync reconciles tracked servers against the registry; each
//! server's subscription set is refreshed against `resources/list` and kept
//! current via `resources/list_changed`/`resources/updated` notifications
//! forwarded by the client pool. A process-wide `DedupeLedger` suppresses
//! repeat `resource_update` emissions (spec invariant 7); a per-server
//! `tokio::sync::Mutex` refresh lock keeps overlapping refreshes from
//! racing (spec §5 "a second refresh request... joins the existing one").

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::application::client_pool::{ClientPool, RpcClient};
use crate::application::process_registry::ProcessRegistry;
use crate::domain::events::ResourceEvent;
use crate::domain::resource::{DedupeLedger, TrackedServerResources};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::json_rpc::methods;
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Copy)]
pub struct ResourceTrackerConfig {
    pub sync_interval: Duration,
    pub dedupe_window: chrono::Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for ResourceTrackerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            dedupe_window: chrono::Duration::seconds(30),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }
}

struct TrackedState {
    resources: TrackedServerResources,
    client: Option<Arc<RpcClient>>,
}

pub struct ResourceTracker {
    registry: Arc<ProcessRegistry>,
    client_pool: Arc<ClientPool>,
    event_bus: Arc<EventBus>,
    config: ResourceTrackerConfig,
    states: Arc<Mutex<HashMap<String, Arc<Mutex<TrackedState>>>>>,
    refresh_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    ledger: Arc<Mutex<DedupeLedger>>,
    stopped: Arc<AtomicBool>,
}

impl ResourceTracker {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        client_pool: Arc<ClientPool>,
        event_bus: Arc<EventBus>,
        config: ResourceTrackerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client_pool,
            event_bus,
            config,
            states: Arc::new(Mutex::new(HashMap::new())),
            refresh_locks: Arc::new(DashMap::new()),
            ledger: Arc::new(Mutex::new(DedupeLedger::default())),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            while !this.stopped.load(Ordering::SeqCst) {
                this.sync_once().await;
                tokio::time::sleep(this.config.sync_interval).await;
            }
        });
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<String> = self.states.lock().await.keys().cloned().collect();
        for id in ids {
            self.dispose(&id).await;
        }
        self.event_bus.publish(ResourceEvent::TrackerStopped { timestamp: chrono::Utc::now() });
    }

    async fn eligible_server_ids(&self) -> Vec<String> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|s| s.definition.track_resources && s.has_live_process())
            .map(|s| s.definition.id)
            .collect()
    }

    async fn sync_once(self: &Arc<Self>) {
        let eligible: HashSet<String> = self.eligible_server_ids().await.into_iter().collect();
        let tracked: HashSet<String> = self.states.lock().await.keys().cloned().collect();

        for id in tracked.difference(&eligible) {
            self.dispose(id).await;
        }
        for id in eligible.difference(&tracked) {
            self.states
                .lock()
                .await
                .insert(id.clone(), Arc::new(Mutex::new(TrackedState {
                    resources: TrackedServerResources::new(),
                    client: None,
                })));
        }

        for id in eligible {
            self.ensure_client_and_refresh(id).await;
        }
    }

    async fn dispose(&self, server_id: &str) {
        let Some(state_handle) = self.states.lock().await.remove(server_id) else {
            return;
        };
        let mut state = state_handle.lock().await;
        if let Some(client) = state.client.take() {
            for uri in state.resources.subscribed.iter().cloned().collect::<Vec<_>>() {
                let _ = client.call(methods::RESOURCES_UNSUBSCRIBE, Some(serde_json::json!({"uri": uri}))).await;
            }
        }
        state.resources.disposed = true;
    }

    async fn ensure_client_and_refresh(self: &Arc<Self>, server_id: String) {
        let Some(state_handle) = self.states.lock().await.get(&server_id).cloned() else {
            return;
        };

        let client = match self.client_pool.get_client(&server_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(server_id = %server_id, error = %e, "resource tracker: failed to acquire client");
                return;
            }
        };

        let needs_forwarder = {
            let state = state_handle.lock().await;
            !matches!(&state.client, Some(existing) if Arc::ptr_eq(existing, &client))
        };
        if needs_forwarder {
            self.spawn_notification_forwarder(server_id.clone(), client.clone());
            state_handle.lock().await.client = Some(client.clone());
        }

        self.refresh_with_retry(server_id, 0).await;
    }

    fn spawn_notification_forwarder(self: &Arc<Self>, server_id: String, client: Arc<RpcClient>) {
        let this = self.clone();
        let mut rx = client.subscribe_notifications();
        tokio::spawn(async move {
            while let Ok(notification) = rx.recv().await {
                match notification.method.as_str() {
                    m if m == methods::RESOURCES_LIST_CHANGED => {
                        this.refresh_with_retry(server_id.clone(), 0).await;
                    }
                    m if m == methods::RESOURCES_UPDATED => {
                        if let Some(params) = notification.params {
                            this.handle_update(&server_id, params).await;
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    fn refresh_with_retry<'a>(
        self: &'a Arc<Self>,
        server_id: String,
        attempt: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let lock = self
                .refresh_locks
                .entry(server_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _guard = lock.lock().await;

            match self.do_refresh(&server_id).await {
                Ok(()) => {}
                Err(RefreshError::Unsupported) => {
                    tracing::warn!(server_id = %server_id, "resource tracker: server does not support resources");
                    drop(_guard);
                    self.dispose(&server_id).await;
                }
                Err(RefreshError::Transient(e)) => {
                    tracing::warn!(server_id = %server_id, error = %e, attempt, "resource tracker: refresh failed, retrying");
                    let delay = self
                        .config
                        .retry_initial
                        .saturating_mul(1u32 << attempt.min(10))
                        .min(self.config.retry_max);
                    let this = self.clone();
                    let server_id = server_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        this.refresh_with_retry(server_id, attempt + 1).await;
                    });
                }
            }
        })
    }

    async fn do_refresh(&self, server_id: &str) -> Result<(), RefreshError> {
        let Some(state_handle) = self.states.lock().await.get(server_id).cloned() else {
            return Ok(());
        };
        let client = {
            let state = state_handle.lock().await;
            state.client.clone()
        };
        let Some(client) = client else {
            return Ok(());
        };

        let mut known = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({"cursor": c}))
                .or_else(|| Some(serde_json::json!({})));
            let response = client
                .call(methods::RESOURCES_LIST, params)
                .await
                .map_err(classify_error)?;
            let Some(resources) = response.get("resources").and_then(Value::as_array) else {
                break;
            };
            for r in resources {
                if let Some(uri) = r.get("uri").and_then(Value::as_str) {
                    known.insert(uri.to_string());
                }
            }
            cursor = response.get("nextCursor").and_then(Value::as_str).map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        let (to_subscribe, to_unsubscribe) = {
            let state = state_handle.lock().await;
            state.resources.diff(&known)
        };
        for uri in &to_subscribe {
            client
                .call(methods::RESOURCES_SUBSCRIBE, Some(serde_json::json!({"uri": uri})))
                .await
                .map_err(classify_error)?;
        }
        for uri in &to_unsubscribe {
            let _ = client
                .call(methods::RESOURCES_UNSUBSCRIBE, Some(serde_json::json!({"uri": uri})))
                .await;
        }

        let mut state = state_handle.lock().await;
        state.resources.apply_diff(known);
        state.resources.retry_attempt = 0;
        Ok(())
    }

    async fn handle_update(&self, server_id: &str, params: Value) {
        let Some(uri) = params.get("uri").and_then(Value::as_str).map(str::to_string) else {
            return;
        };

        let Some(state_handle) = self.states.lock().await.get(server_id).cloned() else {
            return;
        };
        {
            let state = state_handle.lock().await;
            if state.resources.disposed || state.resources.unsupported {
                return;
            }
        }

        if self.ledger.lock().await.should_suppress(server_id, &uri, self.config.dedupe_window) {
            return;
        }
        {
            let mut state = state_handle.lock().await;
            if !state.resources.pending_reads.insert(uri.clone()) {
                return;
            }
        }

        let client = {
            let state = state_handle.lock().await;
            state.client.clone()
        };
        let Some(client) = client else {
            state_handle.lock().await.resources.pending_reads.remove(&uri);
            return;
        };

        match client
            .call(methods::RESOURCES_READ, Some(serde_json::json!({"uri": uri})))
            .await
        {
            Ok(response) => {
                self.ledger.lock().await.record_emit(server_id, &uri);
                telemetry::record_resource_update(server_id);
                self.event_bus.publish(ResourceEvent::ResourceUpdate {
                    server_id: server_id.to_string(),
                    resource_uri: uri.clone(),
                    resource: params.get("resource").cloned(),
                    contents: response.get("contents").cloned(),
                    timestamp: chrono::Utc::now(),
                });
            }
            Err(e) => {
                self.event_bus.publish(ResourceEvent::ResourceError {
                    server_id: server_id.to_string(),
                    resource_uri: Some(uri.clone()),
                    reason: "read_failed".to_string(),
                    error: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
            }
        }
        state_handle.lock().await.resources.pending_reads.remove(&uri);
    }
}

enum RefreshError {
    Unsupported,
    Transient(crate::application::client_pool::ClientError),
}

fn classify_error(e: crate::application::client_pool::ClientError) -> RefreshError {
    let message = e.to_string();
    if message.contains("does not support") || message.contains("Method not found") {
        RefreshError::Unsupported
    } else {
        RefreshError::Transient(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::client_pool::ClientPool;
    use crate::infrastructure::event_bus::EventBus;

    #[tokio::test]
    async fn eligible_server_ids_filters_by_track_resources_and_liveness() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = crate::application::supervisor::Supervisor::new(
            registry.clone(),
            bus.clone(),
            crate::application::supervisor::BackoffConfig::default(),
        );
        let pool = Arc::new(ClientPool::new(registry.clone(), supervisor));
        let tracker = ResourceTracker::new(registry.clone(), pool, bus, ResourceTrackerConfig::default());

        registry
            .ensure(crate::domain::server::ServerDefinition {
                id: "server-a".to_string(),
                command: "true".to_string(),
                args: vec![],
                description: None,
                enabled: true,
                track_resources: true,
            })
            .await;
        assert!(tracker.eligible_server_ids().await.is_empty(), "not yet spawned, no pid");

        registry.update("server-a", |s| { s.mark_spawned(1); }).await;
        assert_eq!(tracker.eligible_server_ids().await, vec!["server-a".to_string()]);
    }
}
