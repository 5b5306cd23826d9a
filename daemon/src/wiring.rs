// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service wiring for the fleet daemon: constructs every application
//! service from `mcp-fleet-core` and assembles the HTTP `AppState`, the way
//! the teacher's `cli::daemon::server::start_daemon` wires its services
//! before building the router — minus the Postgres/Docker/Temporal/gRPC
//! machinery that spec.md's fleet has no analogue for.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use mcp_fleet_core::application::catalog_service::{CatalogConfig, CatalogService};
use mcp_fleet_core::application::client_pool::ClientPool;
use mcp_fleet_core::application::config_loader;
use mcp_fleet_core::application::invocation_service::{InvocationConfig, InvocationService};
use mcp_fleet_core::application::policy_service::PolicyService;
use mcp_fleet_core::application::process_registry::ProcessRegistry;
use mcp_fleet_core::application::resource_tracker::{ResourceTracker, ResourceTrackerConfig};
use mcp_fleet_core::application::supervisor::{BackoffConfig, Supervisor};
use mcp_fleet_core::infrastructure::event_bus::EventBus;
use mcp_fleet_core::presentation::http::{self, AppState};

pub struct Daemon {
    pub state: Arc<AppState>,
    supervisor: Arc<Supervisor>,
    resource_tracker: Arc<ResourceTracker>,
}

impl Daemon {
    /// Loads the server config at `<cwd>/config/mcp-servers.json`, starts
    /// the supervisor and resource tracker, and wires the Tool Policy's
    /// cancel hook to the Invocation Service (spec §4.6/§5: the hook must
    /// enqueue and return, never await an RPC inline).
    pub async fn bootstrap(cwd: &Path, admin_token: Option<String>, test_mode: bool) -> Result<Self> {
        let config_path = config_loader::default_path(cwd);
        let definitions = config_loader::load(&config_path).context("loading server config")?;

        let registry = Arc::new(ProcessRegistry::new());
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), event_bus.clone(), BackoffConfig::default());
        let client_pool = Arc::new(ClientPool::new(registry.clone(), supervisor.clone()));
        let policy = Arc::new(PolicyService::new(event_bus.clone()));
        let catalog = Arc::new(CatalogService::new(
            registry.clone(),
            client_pool.clone(),
            policy.clone(),
            CatalogConfig::default(),
        ));
        let invocation = InvocationService::new(
            registry.clone(),
            client_pool.clone(),
            catalog.clone(),
            policy.clone(),
            InvocationConfig::default(),
        );

        let hook_invocation = invocation.clone();
        policy
            .set_cancel_hook(Arc::new(move |ids: Vec<String>| {
                let invocation = hook_invocation.clone();
                tokio::spawn(async move {
                    invocation.cancel_by_tool(&ids).await;
                });
            }))
            .await;

        let resource_tracker = ResourceTracker::new(
            registry.clone(),
            client_pool.clone(),
            event_bus.clone(),
            ResourceTrackerConfig::default(),
        );

        supervisor.start(definitions).await?;
        resource_tracker.start();

        let state = Arc::new(AppState {
            catalog,
            invocation,
            policy,
            registry,
            supervisor: supervisor.clone(),
            event_bus,
            config_path,
            admin_token,
            test_mode,
        });

        Ok(Self {
            state,
            supervisor,
            resource_tracker,
        })
    }

    pub fn router(&self) -> axum::Router {
        http::app(self.state.clone())
    }

    /// Idempotent teardown: stops the resource tracker, then the
    /// supervisor (SIGTERM to every child, restart timers cancelled).
    pub async fn shutdown(&self) {
        self.resource_tracker.stop().await;
        self.supervisor.stop().await;
    }
}

pub fn default_config_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
