// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! JSON-RPC Client Pool (spec §4.5, C5).
//!
//! One initialized `RpcClient` per live pid, keyed by server id. Handshake
//! is serialized per id via a per-id `tokio::sync::Mutex` so concurrent
//! `get_client` calls never race into two clients (spec §5). Grounded on
//! the teacher's `ToolRouter`'s client-acquisition shape, generalized from
//! an in-process call into a real JSON-RPC handshake over
//! `infrastructure::framed_transport`.
//!
//! The request/notification demux lives in `application::supervisor`'s
//! `SessionHandle`, not here: an `RpcClient` is a thin wrapper around that
//! shared, per-pid demux, so `invalidate()`-ing a pool entry for a still-
//! alive pid never stalls a rebuild (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::application::process_registry::ProcessRegistry;
use crate::application::supervisor::{RpcNotification, SessionHandle, Supervisor};
use crate::domain::errors::{NotFoundError, TimeoutError, TransportError};
use crate::infrastructure::framed_transport::FramedTransport;
use crate::infrastructure::json_rpc::{methods, Notification, Request};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("server {0} returned an RPC error: {1}")]
    Rpc(String, String),
}

pub struct RpcClient {
    pub server_id: String,
    pub pid: u32,
    transport: Arc<FramedTransport>,
    session: SessionHandle,
}

impl RpcClient {
    async fn handshake(server_id: String, session: SessionHandle) -> Result<Arc<Self>, ClientError> {
        let client = Arc::new(Self {
            server_id: server_id.clone(),
            pid: session.pid,
            transport: session.transport.clone(),
            session,
        });

        let init_params = serde_json::json!({
            "clientInfo": {"name": "mcp-fleetd", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {}, "resourcesNotifications": true},
        });
        client
            .call_with_timeout(methods::INITIALIZE, Some(init_params), HANDSHAKE_TIMEOUT)
            .await?;
        client
            .notify(methods::INITIALIZED, None)
            .await
            .map_err(ClientError::Transport)?;

        Ok(client)
    }

    pub fn subscribe_notifications(&self) -> tokio::sync::broadcast::Receiver<RpcNotification> {
        self.session.subscribe_notifications()
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.call_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.session.next_id();
        let rx = self.session.register(id).await;

        let request = Request::new(Value::from(id), method, params);
        if let Err(e) = self
            .transport
            .send(&serde_json::to_value(&request).expect("request always serializes"))
            .await
        {
            self.session.cancel(id).await;
            return Err(e.into());
        }

        let frame = match tokio::time::timeout(timeout, rx).await {
            Ok(inner) => inner,
            Err(_) => {
                self.session.cancel(id).await;
                return Err(TimeoutError {
                    operation: format!("{method} to {}", self.server_id),
                    elapsed_ms: timeout.as_millis() as u64,
                }
                .into());
            }
        };
        let frame = frame.map_err(|_| TransportError::Closed {
            server_id: self.server_id.clone(),
        })?;

        if let Some(error) = frame.error {
            return Err(ClientError::Rpc(self.server_id.clone(), error.message));
        }
        Ok(frame.result.unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notification = Notification::new(method, params);
        self.transport
            .send(&serde_json::to_value(&notification).expect("notification always serializes"))
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

pub struct ClientPool {
    registry: Arc<ProcessRegistry>,
    supervisor: Arc<Supervisor>,
    clients: RwLock<HashMap<String, Arc<RpcClient>>>,
    handshake_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ClientPool {
    pub fn new(registry: Arc<ProcessRegistry>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            registry,
            supervisor,
            clients: RwLock::new(HashMap::new()),
            handshake_locks: DashMap::new(),
        }
    }

    /// Returns the pooled client for `server_id`, creating and
    /// handshaking a new one if none exists for the server's current pid.
    ///
    /// A prior `invalidate()` for this id (e.g. after an RPC timeout) does
    /// not require the process to have exited: the supervisor's session
    /// demux for a still-alive pid keeps running independently of any one
    /// `RpcClient`, so this rebuilds against the same demux rather than
    /// failing `NotFound` until the process happens to restart.
    pub async fn get_client(&self, server_id: &str) -> Result<Arc<RpcClient>, ClientError> {
        let lock = self
            .handshake_locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let state = self
            .registry
            .get(server_id)
            .await
            .ok_or_else(|| NotFoundError::Server {
                server_id: server_id.to_string(),
            })?;
        let pid = state.pid.ok_or_else(|| NotFoundError::Server {
            server_id: server_id.to_string(),
        })?;

        if let Some(existing) = self.clients.read().await.get(server_id) {
            if existing.pid == pid && !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        self.invalidate(server_id).await;

        let session = self
            .supervisor
            .session_handle(server_id)
            .await
            .ok_or_else(|| NotFoundError::Server {
                server_id: server_id.to_string(),
            })?;

        let client = RpcClient::handshake(server_id.to_string(), session).await?;
        self.clients.write().await.insert(server_id.to_string(), client.clone());
        Ok(client)
    }

    /// Drops the pooled `RpcClient` wrapper for `server_id`. Does not touch
    /// the underlying transport or process: the supervisor owns closing the
    /// transport when the child's stdout actually ends, so a still-alive
    /// pid remains reachable on the next `get_client` call.
    pub async fn invalidate(&self, server_id: &str) {
        self.clients.write().await.remove(server_id);
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        futures::future::join_all(ids.iter().map(|id| self.invalidate(id))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::supervisor::BackoffConfig;
    use crate::infrastructure::event_bus::EventBus;

    #[tokio::test]
    async fn get_client_fails_for_unknown_server() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), bus, BackoffConfig::default());
        let pool = ClientPool::new(registry, supervisor);
        match pool.get_client("missing").await {
            Err(ClientError::NotFound(_)) => {}
            Ok(_) => panic!("expected NotFound, got Ok"),
            Err(other) => panic!("expected NotFound, got {other}"),
        }
    }
}
