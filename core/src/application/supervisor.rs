// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process Supervisor (spec §4.3, C3).
//!
//! Grounded on `infrastructure::tool_router::ToolServerManager` in the
//! teacher (`start_all`, per-server-failure-does-not-fail-the-batch), with
//! the MVP process-id placeholder replaced by a real
//! `tokio::process::Command` spawn and a genuine exit-driven backoff
//! restart loop per spec's invariant 3.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex, Notify, RwLock};
use tokio::task::AbortHandle;

use crate::application::process_registry::ProcessRegistry;
use crate::domain::server::ServerDefinition;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::framed_transport::{FramedTransport, InboundEvent};
use crate::infrastructure::json_rpc::InboundFrame;
use crate::infrastructure::telemetry;

/// A notification pushed by the child outside of a request/response pair
/// (`notifications/resources/updated`, progress frames keyed by a
/// `progressToken` equal to the originating request id).
#[derive(Debug, Clone)]
pub struct RpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// One live child's transport plus the request/notification demux that
/// multiplexes its inbound frames. The demux is spawned once per spawn
/// generation (here, not per `RpcClient`) so that a pool eviction never
/// strands frames a still-alive pid is about to send — see `SessionHandle`.
struct Session {
    pid: u32,
    transport: Arc<FramedTransport>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<InboundFrame>>>>,
    notifications: broadcast::Sender<RpcNotification>,
    next_id: Arc<AtomicU64>,
    /// Fires once this generation's exit watcher has reaped the child and
    /// torn down its session entry, so `stop_one` can block until the slot
    /// is actually free before a caller respawns under the same id.
    exited: Arc<Notify>,
}

/// A cheap, cloneable handle onto `server_id`'s current spawn generation.
/// The client pool uses this to build (and rebuild) an `RpcClient` without
/// ever taking exclusive ownership of the inbound stream: the demux behind
/// `pending`/`notifications` lives in the `Supervisor` for the life of the
/// pid, so invalidating a pool entry just drops the `RpcClient` wrapper —
/// the next `get_client` call re-handshakes through the same demux instead
/// of finding the inbound stream already consumed (spec §4.7).
#[derive(Clone)]
pub struct SessionHandle {
    pub pid: u32,
    pub transport: Arc<FramedTransport>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<InboundFrame>>>>,
    notifications: broadcast::Sender<RpcNotification>,
    next_id: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers interest in the response to request `id`, returning the
    /// receiving half the demux will complete when that response arrives.
    pub async fn register(&self, id: u64) -> oneshot::Receiver<InboundFrame> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Withdraws interest in `id` (timeout or send failure) so the demux
    /// silently drops a late reply instead of trying to fill a dead sender.
    pub async fn cancel(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<RpcNotification> {
        self.notifications.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ReloadResult {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
}

pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
    event_bus: Arc<EventBus>,
    backoff: BackoffConfig,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    definitions: Arc<RwLock<HashMap<String, ServerDefinition>>>,
    shutting_down: Arc<AtomicBool>,
    stopping_ids: Arc<DashSet<String>>,
    restart_handles: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl Supervisor {
    pub fn new(registry: Arc<ProcessRegistry>, event_bus: Arc<EventBus>, backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            event_bus,
            backoff,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            definitions: Arc::new(RwLock::new(HashMap::new())),
            shutting_down: Arc::new(AtomicBool::new(false)),
            stopping_ids: Arc::new(DashSet::new()),
            restart_handles: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// A handle onto `server_id`'s current spawn generation, if any — used
    /// by the client pool to build an `RpcClient` without taking ownership
    /// of the process or its inbound stream.
    pub async fn session_handle(&self, server_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(server_id).map(|s| SessionHandle {
            pid: s.pid,
            transport: s.transport.clone(),
            pending: s.pending.clone(),
            notifications: s.notifications.clone(),
            next_id: s.next_id.clone(),
        })
    }

    pub async fn start(self: &Arc<Self>, defs: Vec<ServerDefinition>) -> anyhow::Result<()> {
        self.shutting_down.store(false, Ordering::SeqCst);
        for def in defs {
            if !def.enabled {
                self.registry.ensure(def).await;
                continue;
            }
            self.definitions.write().await.insert(def.id.clone(), def.clone());
            if let Err(e) = self.spawn_one(def.clone()).await {
                tracing::error!(server_id = %def.id, error = %e, "failed to spawn server");
            }
        }
        Ok(())
    }

    async fn spawn_one(self: &Arc<Self>, def: ServerDefinition) -> anyhow::Result<()> {
        self.registry.ensure(def.clone()).await;

        let mut child = Command::new(&def.command)
            .args(&def.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let (transport, inbound) = FramedTransport::attach(def.id.clone(), stdin, stdout);
        let transport = Arc::new(transport);

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let (notif_tx, _) = broadcast::channel(256);
        let next_id = Arc::new(AtomicU64::new(1));
        let exited = Arc::new(Notify::new());

        self.sessions.write().await.insert(
            def.id.clone(),
            Session {
                pid,
                transport: transport.clone(),
                pending: pending.clone(),
                notifications: notif_tx.clone(),
                next_id,
                exited: exited.clone(),
            },
        );
        self.spawn_demux(inbound, pending, notif_tx, transport);

        self.registry.update(&def.id, |s| {
            let _ = s.mark_spawned(pid);
        }).await;
        if let Some(state) = self.registry.update(&def.id, |s| {
            let _ = s.mark_running();
        }).await {
            self.event_bus.publish(crate::domain::events::ServerEvent::Running {
                server_id: def.id.clone(),
                pid: state.pid.unwrap_or(0),
                at: chrono::Utc::now(),
            });
        }

        self.spawn_exit_watcher(def, pid, child, exited);
        Ok(())
    }

    /// Demultiplexes one generation's inbound frames onto pending request
    /// replies and the notification bus, for as long as the child's stdout
    /// reader keeps producing events. Owns no process handle and holds no
    /// shared lock across a receive, so it never blocks `stop`/`stop_one`.
    fn spawn_demux(
        self: &Arc<Self>,
        mut inbound: tokio::sync::mpsc::UnboundedReceiver<InboundEvent>,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<InboundFrame>>>>,
        notifications: broadcast::Sender<RpcNotification>,
        transport: Arc<FramedTransport>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    InboundEvent::Message(value) => {
                        let Ok(frame) = serde_json::from_value::<InboundFrame>(value) else {
                            continue;
                        };
                        if frame.is_response() {
                            if let Some(id) = frame.id.as_ref().and_then(Value::as_u64) {
                                if let Some(reply) = pending.lock().await.remove(&id) {
                                    let _ = reply.send(frame);
                                }
                            }
                        } else if let Some(method) = frame.method.clone() {
                            let _ = notifications.send(RpcNotification {
                                method,
                                params: frame.params,
                            });
                        }
                    }
                    InboundEvent::Error(_) | InboundEvent::Closed => break,
                }
            }
            transport.close();
        });
    }

    /// Owns the `Child` directly (moved in at spawn time) so reaping it
    /// never needs a shared map lock held across `wait()`. Guards every
    /// cleanup step on this generation's pid still being the one recorded
    /// in `sessions`, so a stale watcher from a server `stop_one()` already
    /// replaced can never tear down its successor (spec's no-clobber
    /// requirement on `reload()`).
    fn spawn_exit_watcher(self: &Arc<Self>, def: ServerDefinition, pid: u32, mut child: Child, exited: Arc<Notify>) {
        let this = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;

            let is_current = this
                .sessions
                .read()
                .await
                .get(&def.id)
                .map(|s| s.pid == pid)
                .unwrap_or(false);
            if is_current {
                this.sessions.write().await.remove(&def.id);
            }
            exited.notify_one();
            if !is_current {
                // A newer generation already owns this id; our cleanup
                // would clobber it, so stop here.
                return;
            }

            if this.stopping_ids.remove(&def.id).is_some() {
                this.registry.update(&def.id, |s| {
                    s.mark_stopped();
                }).await;
                return;
            }
            if this.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let (code, signal) = match status {
                Ok(exit_status) => (exit_status.code(), unix_signal(&exit_status)),
                Err(_) => (None, None),
            };
            this.registry.update(&def.id, |s| {
                let event = s.mark_exited(code, signal);
                this.event_bus.publish(event);
            }).await;

            telemetry::record_restart(&def.id);
            let state = this.registry.update(&def.id, |s| {
                let event = s.schedule_restart(this.backoff.initial_ms, this.backoff.max_ms);
                this.event_bus.publish(event);
            }).await;
            let Some(state) = state else { return };
            let delay_ms = crate::domain::server::restart_delay_ms(
                state.restart_count,
                this.backoff.initial_ms,
                this.backoff.max_ms,
            );

            let restart_def = def.clone();
            let restart_this = this.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                if restart_this.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = restart_this.spawn_one(restart_def.clone()).await {
                    tracing::error!(server_id = %restart_def.id, error = %e, "restart failed");
                }
            });
            this.restart_handles
                .lock()
                .await
                .insert(def.id.clone(), handle.abort_handle());
        });
    }

    /// Idempotent: stops accepting new work, cancels pending restart timers,
    /// SIGTERMs every live child, and marks all registry entries stopped.
    /// Does not wait for the children to actually exit — each generation's
    /// own exit watcher reaps it independently and asynchronously.
    pub async fn stop(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for (_, handle) in self.restart_handles.lock().await.drain() {
            handle.abort();
        }

        let live: Vec<(String, u32)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.pid))
            .collect();
        for (id, _) in &live {
            self.stopping_ids.insert(id.clone());
        }
        for (_, pid) in &live {
            send_sigterm(*pid);
        }
        for (id, _) in &live {
            self.registry.update(id, |s| {
                s.mark_stopped();
            }).await;
        }
    }

    /// Stops a single server without tearing down the whole fleet (used by
    /// `reload()` for servers that are removed or changed). Blocks until
    /// this generation's exit watcher has reaped the child and cleared its
    /// session entry, so a caller that immediately respawns under the same
    /// id can never race the old watcher.
    async fn stop_one(self: &Arc<Self>, id: &str) {
        self.stopping_ids.insert(id.to_string());
        if let Some(handle) = self.restart_handles.lock().await.remove(id) {
            handle.abort();
        }

        let session = self.sessions.read().await.get(id).map(|s| (s.pid, s.exited.clone()));
        match session {
            Some((pid, exited)) => {
                send_sigterm(pid);
                exited.notified().await;
            }
            None => {
                // No live session (already exited) — nothing to signal, but
                // the registry still needs to reflect the stop.
                self.stopping_ids.remove(id);
                self.registry.update(id, |s| {
                    s.mark_stopped();
                }).await;
            }
        }
    }

    pub fn reset_restarts(&self, id: &str) {
        let registry = self.registry.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            registry.update(&id, |s| s.reset_restarts()).await;
        });
    }

    /// Diffs `new_defs` against the registry: removed servers are stopped,
    /// changed servers are stopped then restarted, unchanged servers are
    /// left alone, new enabled servers are launched (spec §4.3 reload).
    pub async fn reload(self: &Arc<Self>, new_defs: Vec<ServerDefinition>) -> ReloadResult {
        let mut result = ReloadResult::default();
        let current_ids = self.registry.ids().await;
        let new_ids: std::collections::HashSet<&str> = new_defs.iter().map(|d| d.id.as_str()).collect();

        for id in &current_ids {
            if !new_ids.contains(id.as_str()) {
                self.stop_one(id).await;
                self.registry.remove(id).await;
                result.stopped.push(id.clone());
            }
        }

        for def in new_defs {
            let existing = self.registry.get(&def.id).await;
            self.definitions.write().await.insert(def.id.clone(), def.clone());
            match existing {
                None => {
                    if def.enabled {
                        if self.spawn_one(def.clone()).await.is_ok() {
                            result.started.push(def.id.clone());
                        }
                    } else {
                        self.registry.ensure(def).await;
                    }
                }
                Some(prev) => {
                    if prev.definition.same_process_shape(&def) {
                        continue;
                    }
                    self.stop_one(&def.id).await;
                    if def.enabled && self.spawn_one(def.clone()).await.is_ok() {
                        result.restarted.push(def.id.clone());
                    }
                }
            }
        }

        result
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::server::ServerStatus;

    fn def(id: &str, command: &str, args: &[&str]) -> ServerDefinition {
        ServerDefinition {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            description: None,
            enabled: true,
            track_resources: false,
        }
    }

    #[tokio::test]
    async fn start_spawns_and_marks_running() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), bus, BackoffConfig::default());

        supervisor.start(vec![def("cat-server", "cat", &[])]).await.unwrap();
        let state = registry.get("cat-server").await.unwrap();
        assert_eq!(state.status, ServerStatus::Running);
        assert!(state.pid.is_some());

        supervisor.stop().await;
    }

    /// Regression test for a deadlock where `spawn_exit_watcher` held the
    /// children map's lock across `child.wait()`, starving `stop()` forever
    /// against any long-lived child such as `cat`.
    #[tokio::test]
    async fn stop_does_not_deadlock_on_a_long_lived_child() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), bus, BackoffConfig::default());
        supervisor.start(vec![def("cat-server", "cat", &[])]).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop() must not hang while a long-lived child is running");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), bus, BackoffConfig::default());
        supervisor.start(vec![def("cat-server", "cat", &[])]).await.unwrap();
        supervisor.stop().await;
        supervisor.stop().await;
        let state = registry.get("cat-server").await.unwrap();
        assert_eq!(state.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn crashing_child_schedules_a_restart() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(
            registry.clone(),
            bus,
            BackoffConfig {
                initial_ms: 20,
                max_ms: 50,
            },
        );
        supervisor
            .start(vec![def("flaky", "sh", &["-c", "exit 1"])])
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let state = registry.get("flaky").await.unwrap();
        assert!(state.restart_count >= 1);

        supervisor.stop().await;
    }

    /// Regression test for `reload()` respawning a server under the same id
    /// before the old generation's exit watcher had reaped its child: the
    /// stale watcher used to clobber the new generation's session/registry
    /// state (and, via `kill_on_drop`, the new process itself).
    #[tokio::test]
    async fn reload_respawn_survives_the_old_generation_exiting() {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), bus, BackoffConfig::default());
        supervisor.start(vec![def("cat-server", "cat", &[])]).await.unwrap();
        let old_pid = registry.get("cat-server").await.unwrap().pid.unwrap();

        let result = supervisor.reload(vec![def("cat-server", "cat", &["-n"])]).await;
        assert_eq!(result.restarted, vec!["cat-server".to_string()]);

        let state = registry.get("cat-server").await.unwrap();
        assert_eq!(state.status, ServerStatus::Running);
        assert!(state.pid.is_some());
        assert_ne!(state.pid.unwrap(), old_pid);

        supervisor.stop().await;
    }
}
