// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Invocation entity and state machine (spec §3, §4.8, C8).
//!
//! Mirrors the teacher's `ToolInvocation` (`new`/`start`/`complete`/`fail`
//! returning `Result<Event, DomainError>`), extended with `cancel()` for
//! spec's three-source cooperative cancellation and a `reason` captured
//! exactly once (spec invariant 6: whichever cause fires first wins).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::InvalidStateTransition;
use crate::domain::events::InvocationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Request,
    Revoked,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A single `tools/call` request and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: String,
    pub tool_id: String,
    pub input: Value,
    pub session_id: Option<String>,
    pub granted_permissions: Vec<String>,
    pub status: InvocationStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<CancelReason>,
}

impl Invocation {
    pub fn new(
        id: Option<String>,
        tool_id: String,
        input: Value,
        session_id: Option<String>,
        granted_permissions: Vec<String>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            tool_id,
            input,
            session_id,
            granted_permissions,
            status: InvocationStatus::Pending,
            requested_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel_reason: None,
        }
    }

    pub fn start(&mut self, tool_name: &str, server_id: &str) -> Result<InvocationEvent, InvalidStateTransition> {
        if self.status != InvocationStatus::Pending {
            return Err(InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Running".to_string(),
            });
        }
        self.status = InvocationStatus::Running;
        let started_at = Utc::now();
        self.started_at = Some(started_at);
        Ok(InvocationEvent::Started {
            invocation_id: self.id.clone(),
            tool_id: self.tool_id.clone(),
            tool_name: tool_name.to_string(),
            server_id: server_id.to_string(),
            started_at,
        })
    }

    fn duration_ms(&self) -> u64 {
        match self.started_at {
            Some(start) => (Utc::now() - start).num_milliseconds().max(0) as u64,
            None => 0,
        }
    }

    pub fn complete(
        &mut self,
        content: Option<Value>,
        structured_content: Option<Value>,
    ) -> Result<InvocationEvent, InvalidStateTransition> {
        if self.status != InvocationStatus::Running {
            return Err(InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Completed".to_string(),
            });
        }
        let duration_ms = self.duration_ms();
        self.completed_at = Some(Utc::now());
        self.status = InvocationStatus::Completed;
        Ok(InvocationEvent::Completed {
            invocation_id: self.id.clone(),
            duration_ms,
            content,
            structured_content,
        })
    }

    pub fn fail(&mut self, error: String, code: Option<i32>) -> Result<InvocationEvent, InvalidStateTransition> {
        if self.status != InvocationStatus::Running {
            return Err(InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Failed".to_string(),
            });
        }
        let duration_ms = self.duration_ms();
        self.completed_at = Some(Utc::now());
        self.status = InvocationStatus::Failed;
        Ok(InvocationEvent::Failed {
            invocation_id: self.id.clone(),
            error,
            code,
            duration_ms,
        })
    }

    /// Cancels the invocation for `reason`, unless it already has a terminal
    /// status or a cancel reason was already recorded (first cause wins —
    /// spec invariant 6). Valid from `Pending` or `Running`.
    pub fn cancel(&mut self, reason: CancelReason) -> Option<InvocationEvent> {
        if self.cancel_reason.is_some() || !matches!(self.status, InvocationStatus::Pending | InvocationStatus::Running) {
            return None;
        }
        self.cancel_reason = Some(reason);
        let duration_ms = self.duration_ms();
        self.completed_at = Some(Utc::now());
        self.status = InvocationStatus::Cancelled;
        Some(InvocationEvent::Cancelled {
            invocation_id: self.id.clone(),
            reason,
            duration_ms,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            InvocationStatus::Completed | InvocationStatus::Failed | InvocationStatus::Cancelled
        )
    }
}

/// Picks the canonical output content field: `output` → `formatted` →
/// `structuredContent` → first `content[]` text block → `None` (Open
/// Question #2, see DESIGN.md). The single place this ordering is applied.
pub fn select_output_content(response: &Value) -> Option<Value> {
    if let Some(v) = response.get("output") {
        return Some(v.clone());
    }
    if let Some(v) = response.get("formatted") {
        return Some(v.clone());
    }
    if let Some(v) = response.get("structuredContent") {
        return Some(v.clone());
    }
    if let Some(blocks) = response.get("content").and_then(Value::as_array) {
        for block in blocks {
            if let Some(text) = block.get("text") {
                return Some(text.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_invocation() -> Invocation {
        Invocation::new(None, "server-a:Summarize".to_string(), json!({}), None, vec![])
    }

    #[test]
    fn state_machine_happy_path() {
        let mut inv = new_invocation();
        assert_eq!(inv.status, InvocationStatus::Pending);
        inv.start("Summarize", "server-a").unwrap();
        assert_eq!(inv.status, InvocationStatus::Running);
        inv.complete(Some(json!("done")), None).unwrap();
        assert_eq!(inv.status, InvocationStatus::Completed);
        assert!(inv.is_terminal());
    }

    #[test]
    fn completing_before_running_is_invalid() {
        let mut inv = new_invocation();
        assert!(inv.complete(None, None).is_err());
    }

    #[test]
    fn first_cancel_cause_wins() {
        let mut inv = new_invocation();
        inv.start("Summarize", "server-a").unwrap();
        let first = inv.cancel(CancelReason::Revoked).unwrap();
        assert!(matches!(first, InvocationEvent::Cancelled { reason: CancelReason::Revoked, .. }));
        // A second cancellation cause must be a no-op.
        assert!(inv.cancel(CancelReason::Timeout).is_none());
        assert_eq!(inv.cancel_reason, Some(CancelReason::Revoked));
    }

    #[test]
    fn content_field_precedence() {
        assert_eq!(
            select_output_content(&json!({"output": "a", "formatted": "b"})),
            Some(json!("a"))
        );
        assert_eq!(
            select_output_content(&json!({"formatted": "b", "structuredContent": "c"})),
            Some(json!("b"))
        );
        assert_eq!(
            select_output_content(&json!({"structuredContent": {"x": 1}})),
            Some(json!({"x": 1}))
        );
        assert_eq!(
            select_output_content(&json!({"content": [{"text": "hi"}]})),
            Some(json!("hi"))
        );
        assert_eq!(select_output_content(&json!({})), None);
    }
}
