// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP Boundary (spec §4.10, §6.4, C10).
//!
//! Thin by design: parse and validate, dispatch to the relevant service,
//! stream or serialize the result. Grounded on the teacher's
//! `presentation::api` (`AppState`/`Router`/`State`/`Json`/`Sse` idiom) and
//! `cli::daemon::server` (`StatusCode` tuple responses, bearer-auth gating).

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use crate::application::catalog_service::CatalogService;
use crate::application::config_loader;
use crate::application::invocation_service::{InvocationService, InvokeRequest};
use crate::application::policy_service::PolicyService;
use crate::application::process_registry::ProcessRegistry;
use crate::application::supervisor::Supervisor;
use crate::domain::events::{FleetEvent, InvocationEvent, ResourceEvent};
use crate::infrastructure::event_bus::EventBus;

const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

pub struct AppState {
    pub catalog: Arc<CatalogService>,
    pub invocation: Arc<InvocationService>,
    pub policy: Arc<PolicyService>,
    pub registry: Arc<ProcessRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub event_bus: Arc<EventBus>,
    pub config_path: std::path::PathBuf,
    pub admin_token: Option<String>,
    pub test_mode: bool,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/mcp/catalog", get(get_catalog))
        .route("/api/mcp/invoke", post(post_invoke))
        .route("/api/mcp/invoke", delete(delete_invoke))
        .route("/api/mcp/admin", post(post_admin))
        .route("/api/mcp/resource-events", get(get_resource_events))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (axum::http::StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn get_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let payload = state.catalog.get_catalog().await;
    (
        axum::http::StatusCode::OK,
        Json(json!({
            "tools": payload.tools,
            "collectedAt": payload.collected_at.timestamp_millis(),
        })),
    )
}

#[derive(Debug, Deserialize)]
struct InvokeBody {
    #[serde(rename = "toolId")]
    tool_id: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default, rename = "invocationId")]
    invocation_id: Option<String>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
    #[serde(default, rename = "grantedPermissions")]
    granted_permissions: Vec<String>,
    #[serde(default, rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Each `InvocationEvent` becomes one SSE frame whose `event:` field is the
/// lowercase variant name from spec §6.6, `data:` the JSON body.
fn invocation_event_to_sse(event: InvocationEvent) -> Event {
    let name = match &event {
        InvocationEvent::Started { .. } => "started",
        InvocationEvent::Progress { .. } => "progress",
        InvocationEvent::Output { .. } => "output",
        InvocationEvent::Completed { .. } => "completed",
        InvocationEvent::Failed { .. } => "failed",
        InvocationEvent::Cancelled { .. } => "cancelled",
        InvocationEvent::Final { .. } => "final",
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(&event).unwrap_or_default())
}

async fn post_invoke(State(state): State<Arc<AppState>>, Json(body): Json<InvokeBody>) -> impl IntoResponse {
    let tool_id = body.tool_id;
    if tool_id.trim().is_empty() {
        return bad_request_stream("toolId is required");
    }

    let request = InvokeRequest {
        tool_id,
        input: body.input.unwrap_or(Value::Null),
        invocation_id: body.invocation_id.clone(),
        session_id: body.session_id,
        granted_permissions: body.granted_permissions,
        timeout: body.timeout_ms.map(Duration::from_millis),
    };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<InvocationEvent>();
    let invocation = state.invocation.clone();
    tokio::spawn(async move {
        invocation.invoke(request, tx).await;
    });

    let stream: SseStream = Box::pin(
        tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(|event| Ok(invocation_event_to_sse(event))),
    );
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT)).into_response()
}

fn bad_request_stream(message: &str) -> axum::response::Response {
    let body = json!({"error": message});
    (axum::http::StatusCode::BAD_REQUEST, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct InvocationIdQuery {
    #[serde(rename = "invocationId")]
    invocation_id: Option<String>,
}

async fn delete_invoke(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InvocationIdQuery>,
) -> impl IntoResponse {
    let Some(invocation_id) = query.invocation_id.filter(|s| !s.is_empty()) else {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({"error": "invocationId is required"})),
        );
    };
    let cancelled = state.invocation.cancel(&invocation_id).await;
    (axum::http::StatusCode::OK, Json(json!({"cancelled": cancelled})))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum AdminAction {
    Revoke {
        tools: Vec<String>,
        reason: Option<String>,
        actor: Option<String>,
    },
    Restore {
        tools: Vec<String>,
        reason: Option<String>,
        actor: Option<String>,
    },
    ReloadConfig,
    /// Supplemented action (SPEC_FULL.md §2): clears a server's restart
    /// counter without restarting it.
    ResetRestarts {
        #[serde(rename = "serverId")]
        server_id: String,
    },
}

fn admin_authorized(state: &AppState, auth_header: Option<&str>) -> bool {
    match &state.admin_token {
        Some(token) => auth_header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|provided| provided == token)
            .unwrap_or(false),
        None => state.test_mode,
    }
}

async fn post_admin(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(action): Json<AdminAction>,
) -> impl IntoResponse {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !admin_authorized(&state, auth_header) {
        return (axum::http::StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }

    match action {
        AdminAction::Revoke { tools, reason, actor } => {
            state.policy.revoke(tools.clone(), reason, actor).await;
            state.catalog.invalidate_cache().await;
            (
                axum::http::StatusCode::OK,
                Json(json!({"status": "revoked", "tools": tools})),
            )
        }
        AdminAction::Restore { tools, reason, actor } => {
            state.policy.restore(tools.clone(), reason, actor).await;
            state.catalog.invalidate_cache().await;
            (
                axum::http::StatusCode::OK,
                Json(json!({"status": "restored", "tools": tools})),
            )
        }
        AdminAction::ReloadConfig => match config_loader::load(&state.config_path) {
            Ok(defs) => {
                let result = state.supervisor.reload(defs).await;
                state.catalog.invalidate_cache().await;
                (
                    axum::http::StatusCode::OK,
                    Json(json!({"status": "reloaded", "result": result})),
                )
            }
            Err(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "config reload failed", "details": e.to_string()})),
            ),
        },
        AdminAction::ResetRestarts { server_id } => {
            state.supervisor.reset_restarts(&server_id);
            (
                axum::http::StatusCode::OK,
                Json(json!({"status": "reset", "serverId": server_id})),
            )
        }
    }
}

async fn get_resource_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(
            Event::default().event("handshake").data(
                serde_json::to_string(&ResourceEvent::Handshake {
                    status: "ready".to_string(),
                    timestamp: chrono::Utc::now(),
                })
                .unwrap_or_default(),
            ),
        );

        loop {
            tokio::select! {
                biased;
                event = rx.recv() => {
                    match event {
                        Ok(FleetEvent::Resource(ResourceEvent::TrackerStopped { .. })) => {
                            yield Ok(Event::default().event("tracker_stopped").data(
                                serde_json::to_string(&ResourceEvent::TrackerStopped { timestamp: chrono::Utc::now() })
                                    .unwrap_or_default(),
                            ));
                            break;
                        }
                        Ok(FleetEvent::Resource(resource_event)) => {
                            let name = match &resource_event {
                                ResourceEvent::Handshake { .. } => "handshake",
                                ResourceEvent::ResourceUpdate { .. } => "resource_update",
                                ResourceEvent::ResourceError { .. } => "resource_error",
                                ResourceEvent::TrackerStopped { .. } => "tracker_stopped",
                                ResourceEvent::StreamClosed { .. } => "stream_closed",
                            };
                            yield Ok(Event::default().event(name).data(
                                serde_json::to_string(&resource_event).unwrap_or_default(),
                            ));
                        }
                        Ok(_) => continue,
                        Err(crate::infrastructure::event_bus::EventBusError::Lagged(_)) => continue,
                        Err(crate::infrastructure::event_bus::EventBusError::Closed) => break,
                    }
                }
                _ = tokio::time::sleep(SSE_HEARTBEAT) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }

        yield Ok(Event::default().event("stream_closed").data(
            serde_json::to_string(&ResourceEvent::StreamClosed {
                reason: "client_aborted".to_string(),
                timestamp: chrono::Utc::now(),
            })
            .unwrap_or_default(),
        ));
    };

    let stream: SseStream = Box::pin(stream);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_token(token: Option<&str>, test_mode: bool) -> AppState {
        let registry = Arc::new(ProcessRegistry::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        let supervisor = Supervisor::new(registry.clone(), bus.clone(), Default::default());
        let client_pool = Arc::new(crate::application::client_pool::ClientPool::new(
            registry.clone(),
            supervisor.clone(),
        ));
        let policy = Arc::new(PolicyService::new(bus.clone()));
        let catalog = Arc::new(CatalogService::new(
            registry.clone(),
            client_pool.clone(),
            policy.clone(),
            Default::default(),
        ));
        let invocation = crate::application::invocation_service::InvocationService::new(
            registry.clone(),
            client_pool,
            catalog.clone(),
            policy.clone(),
            Default::default(),
        );
        AppState {
            catalog,
            invocation,
            policy,
            registry,
            supervisor,
            event_bus: bus,
            config_path: std::path::PathBuf::from("/nonexistent/mcp-servers.json"),
            admin_token: token.map(str::to_string),
            test_mode,
        }
    }

    #[test]
    fn admin_requires_bearer_token_when_configured() {
        let state = state_with_token(Some("secret"), false);
        assert!(!admin_authorized(&state, None));
        assert!(!admin_authorized(&state, Some("Bearer wrong")));
        assert!(admin_authorized(&state, Some("Bearer secret")));
    }

    #[test]
    fn admin_allowed_without_token_only_in_test_mode() {
        let state = state_with_token(None, false);
        assert!(!admin_authorized(&state, None));

        let state = state_with_token(None, true);
        assert!(admin_authorized(&state, None));
    }

    #[tokio::test]
    async fn get_catalog_returns_empty_catalog_for_empty_fleet() {
        let state = Arc::new(state_with_token(None, true));
        let response = get_catalog(State(state)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_invoke_without_id_is_bad_request() {
        let state = Arc::new(state_with_token(None, true));
        let response = delete_invoke(State(state), Query(InvocationIdQuery { invocation_id: None }))
            .await
            .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_action_parses_reset_restarts() {
        let action: AdminAction = serde_json::from_value(json!({
            "action": "reset-restarts",
            "serverId": "codex",
        }))
        .unwrap();
        assert!(matches!(action, AdminAction::ResetRestarts { server_id } if server_id == "codex"));
    }
}
