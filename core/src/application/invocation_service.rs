// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Invocation Service (spec §4.8, C8).
//!
//! Each active invocation is shared as `Arc<Mutex<Invocation>>` plus a
//! `tokio::sync::Notify` so `cancel`/`cancel_by_tool`/the timeout timer can
//! race to set the terminal `cancel_reason` from outside the task driving
//! the RPC call (spec invariant 6: first cause wins, enforced by
//! `Invocation::cancel` itself returning `None` on the second caller).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::application::catalog_service::CatalogService;
use crate::application::client_pool::ClientPool;
use crate::application::policy_service::PolicyService;
use crate::application::process_registry::ProcessRegistry;
use crate::domain::catalog::ToolDescriptor;
use crate::domain::errors::{NotFoundError, PermissionError, ValidationError};
use crate::domain::events::InvocationEvent;
use crate::domain::invocation::{select_output_content, CancelReason, Invocation};
use crate::infrastructure::json_rpc::methods;
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Copy)]
pub struct InvocationConfig {
    pub default_timeout: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub tool_id: String,
    pub input: Value,
    pub invocation_id: Option<String>,
    pub session_id: Option<String>,
    pub granted_permissions: Vec<String>,
    pub timeout: Option<Duration>,
}

struct ActiveInvocation {
    invocation: Arc<Mutex<Invocation>>,
    notify: Arc<Notify>,
    cancel_event: Arc<Mutex<Option<InvocationEvent>>>,
}

pub struct InvocationService {
    registry: Arc<ProcessRegistry>,
    client_pool: Arc<ClientPool>,
    catalog: Arc<CatalogService>,
    policy: Arc<PolicyService>,
    config: InvocationConfig,
    active: Arc<RwLock<HashMap<String, ActiveInvocation>>>,
}

impl InvocationService {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        client_pool: Arc<ClientPool>,
        catalog: Arc<CatalogService>,
        policy: Arc<PolicyService>,
        config: InvocationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client_pool,
            catalog,
            policy,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Drives one invocation to a terminal outcome, emitting events onto
    /// `events` as they occur and a trailing `Final` once the stream is
    /// done. Never panics on a bad request — every failure path is a
    /// `Failed`/`Cancelled` event, never a propagated `Err`.
    pub async fn invoke(self: &Arc<Self>, request: InvokeRequest, events: tokio::sync::mpsc::UnboundedSender<InvocationEvent>) {
        let tool_id = request.tool_id.clone();
        let invocation_id = request
            .invocation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self.policy.is_revoked(&tool_id) {
            let cancelled = InvocationEvent::Cancelled {
                invocation_id: invocation_id.clone(),
                reason: CancelReason::Revoked,
                duration_ms: 0,
            };
            let _ = events.send(cancelled.clone());
            telemetry::record_invocation("cancelled", 0);
            let _ = events.send(InvocationEvent::Final {
                invocation_id,
                outcome: Box::new(cancelled),
            });
            return;
        }

        let catalog = self.catalog.get_catalog().await;
        let Some(descriptor) = catalog.find(&tool_id).cloned() else {
            self.fail_before_start(&invocation_id, NotFoundError::Tool { tool_id }.to_string(), &events);
            return;
        };

        if let Some(missing) = missing_permissions(&descriptor, &request.granted_permissions) {
            self.fail_before_start(&invocation_id, PermissionError { missing }.to_string(), &events);
            return;
        }

        if let Some(schema) = descriptor.input_schema.as_ref() {
            if let Err(e) = validate_input(schema, &request.input) {
                self.fail_before_start(&invocation_id, e.to_string(), &events);
                return;
            }
        }

        let Some((server_id, tool_name)) = ToolDescriptor::split_qualified(&descriptor.id) else {
            self.fail_before_start(&invocation_id, "malformed qualified tool id".to_string(), &events);
            return;
        };
        let server_id = server_id.to_string();
        let tool_name = tool_name.to_string();

        let server_live = self
            .registry
            .get(&server_id)
            .await
            .map(|s| s.has_live_process())
            .unwrap_or(false);
        if !server_live {
            self.fail_before_start(&invocation_id, format!("server not available: {server_id}"), &events);
            return;
        }

        let invocation = Arc::new(Mutex::new(Invocation::new(
            Some(invocation_id.clone()),
            descriptor.id.clone(),
            request.input.clone(),
            request.session_id.clone(),
            request.granted_permissions.clone(),
        )));
        let notify = Arc::new(Notify::new());
        let cancel_event = Arc::new(Mutex::new(None));
        self.active.write().await.insert(
            invocation_id.clone(),
            ActiveInvocation {
                invocation: invocation.clone(),
                notify: notify.clone(),
                cancel_event: cancel_event.clone(),
            },
        );

        let started_event = {
            let mut inv = invocation.lock().await;
            inv.start(&tool_name, &server_id).ok()
        };
        if let Some(event) = started_event {
            let _ = events.send(event);
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let timeout_handle = self.spawn_timeout_guard(invocation_id.clone(), timeout);

        let outcome = self
            .run_call(&invocation_id, &server_id, &tool_name, &request.input, &notify, &events)
            .await;
        timeout_handle.abort();

        let terminal_event = match outcome {
            CallOutcome::Completed { content, structured } => {
                let _ = events.send(InvocationEvent::Output {
                    invocation_id: invocation_id.clone(),
                    content: content.clone(),
                    is_error: false,
                });
                invocation.lock().await.complete(content, structured).ok()
            }
            CallOutcome::Failed { error, code } => invocation.lock().await.fail(error, code).ok(),
            CallOutcome::Cancelled => cancel_event.lock().await.take(),
        };

        if let Some(event) = terminal_event.clone() {
            let _ = events.send(event);
        }
        let (status, duration_ms) = summarize(&terminal_event);
        telemetry::record_invocation(status, duration_ms);

        let outcome = terminal_event.unwrap_or_else(|| InvocationEvent::Failed {
            invocation_id: invocation_id.clone(),
            error: "invocation ended without a terminal event".to_string(),
            code: None,
            duration_ms,
        });
        self.active.write().await.remove(&invocation_id);
        let _ = events.send(InvocationEvent::Final {
            invocation_id,
            outcome: Box::new(outcome),
        });
    }

    fn fail_before_start(&self, invocation_id: &str, error: String, events: &tokio::sync::mpsc::UnboundedSender<InvocationEvent>) {
        let failed = InvocationEvent::Failed {
            invocation_id: invocation_id.to_string(),
            error,
            code: None,
            duration_ms: 0,
        };
        let _ = events.send(failed.clone());
        telemetry::record_invocation("failed", 0);
        let _ = events.send(InvocationEvent::Final {
            invocation_id: invocation_id.to_string(),
            outcome: Box::new(failed),
        });
    }

    fn spawn_timeout_guard(self: &Arc<Self>, invocation_id: String, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.cancel_internal(&invocation_id, CancelReason::Timeout).await;
        })
    }

    async fn run_call(
        &self,
        invocation_id: &str,
        server_id: &str,
        tool_name: &str,
        input: &Value,
        notify: &Arc<Notify>,
        events: &tokio::sync::mpsc::UnboundedSender<InvocationEvent>,
    ) -> CallOutcome {
        let client = match self.client_pool.get_client(server_id).await {
            Ok(c) => c,
            Err(e) => return CallOutcome::Failed { error: e.to_string(), code: None },
        };

        let mut progress_rx = client.subscribe_notifications();
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": input,
            "_meta": {"progressToken": invocation_id},
        });

        let call_fut = client.call(methods::TOOLS_CALL, Some(params));
        tokio::pin!(call_fut);

        loop {
            tokio::select! {
                result = &mut call_fut => {
                    return match result {
                        Ok(response) => classify_response(response),
                        Err(e) => CallOutcome::Failed { error: e.to_string(), code: None },
                    };
                }
                _ = notify.notified() => {
                    return CallOutcome::Cancelled;
                }
                notif = progress_rx.recv() => {
                    if let Ok(n) = notif {
                        if n.method == methods::PROGRESS {
                            if let Some(params) = n.params {
                                if params.get("progressToken").and_then(Value::as_str) == Some(invocation_id) {
                                    let _ = events.send(InvocationEvent::Progress {
                                        invocation_id: invocation_id.to_string(),
                                        progress: params,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn cancel_internal(&self, invocation_id: &str, reason: CancelReason) -> bool {
        let active = self.active.read().await;
        let Some(entry) = active.get(invocation_id) else {
            return false;
        };
        let event = {
            let mut inv = entry.invocation.lock().await;
            inv.cancel(reason)
        };
        match event {
            Some(event) => {
                *entry.cancel_event.lock().await = Some(event);
                entry.notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub async fn cancel(&self, invocation_id: &str) -> bool {
        self.cancel_internal(invocation_id, CancelReason::Request).await
    }

    /// Cancels every active invocation whose tool id is in `ids`, reason
    /// `revoked`. Wired as the Tool Policy's cancel hook.
    pub async fn cancel_by_tool(&self, ids: &[String]) {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let targets: Vec<String> = {
            let active = self.active.read().await;
            let mut targets = Vec::new();
            for (invocation_id, entry) in active.iter() {
                let tool_id = entry.invocation.lock().await.tool_id.clone();
                if ids.contains(tool_id.as_str()) {
                    targets.push(invocation_id.clone());
                }
            }
            targets
        };
        for invocation_id in targets {
            self.cancel_internal(&invocation_id, CancelReason::Revoked).await;
        }
    }
}

enum CallOutcome {
    Completed { content: Option<Value>, structured: Option<Value> },
    Failed { error: String, code: Option<i32> },
    Cancelled,
}

fn classify_response(response: Value) -> CallOutcome {
    let is_error = response.get("isError").and_then(Value::as_bool).unwrap_or(false);
    if is_error {
        let error = extract_error_message(&response);
        let code = response.get("code").and_then(Value::as_i64).map(|c| c as i32);
        return CallOutcome::Failed { error, code };
    }
    let content = select_output_content(&response);
    let structured = response.get("structuredContent").cloned();
    CallOutcome::Completed { content, structured }
}

fn extract_error_message(response: &Value) -> String {
    if let Some(blocks) = response.get("content").and_then(Value::as_array) {
        for block in blocks {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    response
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("tool invocation failed")
        .to_string()
}

fn missing_permissions(descriptor: &ToolDescriptor, granted: &[String]) -> Option<Vec<String>> {
    let granted: HashSet<&str> = granted.iter().map(String::as_str).collect();
    let missing: Vec<String> = descriptor
        .permissions
        .iter()
        .filter(|p| !granted.contains(p.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}

fn validate_input(schema: &Value, input: &Value) -> Result<(), ValidationError> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            return Err(ValidationError {
                messages: vec![e.to_string()],
            })
        }
    };
    let messages: Vec<String> = validator.iter_errors(input).map(|e| e.to_string()).collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { messages })
    }
}

fn summarize(event: &Option<InvocationEvent>) -> (&'static str, u64) {
    match event {
        Some(InvocationEvent::Completed { duration_ms, .. }) => ("completed", *duration_ms),
        Some(InvocationEvent::Failed { duration_ms, .. }) => ("failed", *duration_ms),
        Some(InvocationEvent::Cancelled { duration_ms, .. }) => ("cancelled", *duration_ms),
        _ => ("unknown", 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::CatalogPayload;

    fn descriptor(permissions: Vec<&str>, schema: Option<Value>) -> ToolDescriptor {
        ToolDescriptor {
            id: "server-a:Summarize".to_string(),
            name: "Summarize".to_string(),
            description: None,
            input_schema: schema,
            permissions: permissions.into_iter().map(str::to_string).collect(),
            transport: "stdio".to_string(),
            server_id: "server-a".to_string(),
        }
    }

    #[test]
    fn missing_permissions_reports_the_gap() {
        let d = descriptor(vec!["read", "write"], None);
        assert_eq!(
            missing_permissions(&d, &["read".to_string()]),
            Some(vec!["write".to_string()])
        );
        assert_eq!(missing_permissions(&d, &["read".to_string(), "write".to_string()]), None);
    }

    #[test]
    fn validate_input_collects_schema_violations() {
        let schema = serde_json::json!({"type": "object", "required": ["x"]});
        assert!(validate_input(&schema, &serde_json::json!({"x": 1})).is_ok());
        let err = validate_input(&schema, &serde_json::json!({})).unwrap_err();
        assert!(!err.messages.is_empty());
    }

    #[test]
    fn classify_response_prefers_output_field_and_detects_errors() {
        match classify_response(serde_json::json!({"output": "done"})) {
            CallOutcome::Completed { content, .. } => assert_eq!(content, Some(serde_json::json!("done"))),
            _ => panic!("expected Completed"),
        }
        match classify_response(serde_json::json!({"isError": true, "content": [{"text": "boom"}]})) {
            CallOutcome::Failed { error, .. } => assert_eq!(error, "boom"),
            _ => panic!("expected Failed"),
        }
    }

    #[tokio::test]
    async fn catalog_find_and_permission_wiring() {
        let payload = CatalogPayload {
            tools: vec![descriptor(vec!["read"], None)],
            collected_at: chrono::Utc::now(),
        };
        assert!(payload.find("server-a:Summarize").is_some());
        assert!(payload.find("server-a:Missing").is_none());
    }
}
