// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain events published by the fleet runtime's components.
//!
//! One aggregate enum per bounded concern, all timestamped, mirroring the
//! shape of the invoke-stream and SSE payloads in spec §6.6. `FleetEvent` is
//! the type carried on the in-process broadcast bus (see
//! `infrastructure::event_bus`) and fanned out to HTTP subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::invocation::CancelReason;

/// Process Supervisor / Process Registry lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    Starting {
        server_id: String,
        at: DateTime<Utc>,
    },
    Running {
        server_id: String,
        pid: u32,
        at: DateTime<Utc>,
    },
    Exited {
        server_id: String,
        code: Option<i32>,
        signal: Option<i32>,
        at: DateTime<Utc>,
    },
    RestartScheduled {
        server_id: String,
        attempt: u32,
        delay_ms: u64,
        at: DateTime<Utc>,
    },
    Stopped {
        server_id: String,
        at: DateTime<Utc>,
    },
}

/// Tool Policy revoke/restore/clear events, mirroring the audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PolicyEvent {
    Revoked {
        tool_ids: Vec<String>,
        reason: Option<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    },
    Restored {
        tool_ids: Vec<String>,
        reason: Option<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    },
    Cleared {
        at: DateTime<Utc>,
    },
}

/// Events emitted on an invocation's SSE stream (spec §6.6, §4.8 step 6-10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvocationEvent {
    Started {
        invocation_id: String,
        tool_id: String,
        tool_name: String,
        server_id: String,
        started_at: DateTime<Utc>,
    },
    Progress {
        invocation_id: String,
        progress: Value,
    },
    Output {
        invocation_id: String,
        content: Option<Value>,
        is_error: bool,
    },
    Completed {
        invocation_id: String,
        duration_ms: u64,
        content: Option<Value>,
        structured_content: Option<Value>,
    },
    Failed {
        invocation_id: String,
        error: String,
        code: Option<i32>,
        duration_ms: u64,
    },
    Cancelled {
        invocation_id: String,
        reason: CancelReason,
        duration_ms: u64,
    },
    /// Terminal frame closing the stream; `outcome` is whichever of
    /// `Completed`/`Failed`/`Cancelled` already ran so a client reading only
    /// `final` still gets the result (spec §6.6).
    Final {
        invocation_id: String,
        outcome: Box<InvocationEvent>,
    },
}

/// Resource Tracker events fanned out over the `/api/mcp/resource-events` SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResourceEvent {
    Handshake {
        status: String,
        timestamp: DateTime<Utc>,
    },
    ResourceUpdate {
        server_id: String,
        resource_uri: String,
        resource: Option<Value>,
        contents: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    ResourceError {
        server_id: String,
        resource_uri: Option<String>,
        reason: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TrackerStopped {
        timestamp: DateTime<Utc>,
    },
    StreamClosed {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Top-level event carried on the process-wide broadcast bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event")]
pub enum FleetEvent {
    Server(ServerEvent),
    Policy(PolicyEvent),
    Invocation(InvocationEvent),
    Resource(ResourceEvent),
}

impl From<ServerEvent> for FleetEvent {
    fn from(e: ServerEvent) -> Self {
        FleetEvent::Server(e)
    }
}

impl From<PolicyEvent> for FleetEvent {
    fn from(e: PolicyEvent) -> Self {
        FleetEvent::Policy(e)
    }
}

impl From<InvocationEvent> for FleetEvent {
    fn from(e: InvocationEvent) -> Self {
        FleetEvent::Invocation(e)
    }
}

impl From<ResourceEvent> for FleetEvent {
    fn from(e: ResourceEvent) -> Self {
        FleetEvent::Resource(e)
    }
}
