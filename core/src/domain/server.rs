// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Server Definition and Server State (spec §3, §4.2, C2/C3).
//!
//! | Type | Role |
//! |------|------|
//! | [`ServerDefinition`] | Immutable config-derived description of one configured child |
//! | [`ServerStatus`] | Lifecycle status: `starting`, `running`, `restarting`, `stopped`, `error` |
//! | [`ServerState`] | Mutable registry record: status, restart count, pid, last exit |
//!
//! Invariant (enforced by [`ServerState::set_pid`] / [`ServerState::clear_pid`]):
//! a process handle/pid is present iff status ∈ {starting, running}.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::InvalidStateTransition;
use crate::domain::events::ServerEvent;

/// How long a server must stay `running` before its restart counter resets
/// (Open Question #1, see DESIGN.md).
pub const RESTART_COUNTER_RESET_AFTER_SECS: i64 = 60;

/// Config-derived, immutable-within-a-generation description of one child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub track_resources: bool,
}

impl ServerDefinition {
    /// Two definitions are equivalent for reload-diff purposes when their
    /// observable process shape matches, ignoring cosmetic fields like
    /// `description`.
    pub fn same_process_shape(&self, other: &ServerDefinition) -> bool {
        self.command == other.command && self.args == other.args && self.enabled == other.enabled
    }
}

/// Lifecycle status of a registered server (spec §3 Server State).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

/// In-memory registry record for one logical server id. Pure state, no I/O
/// (owned and mutated by `application::process_registry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    pub definition: ServerDefinition,
    pub status: ServerStatus,
    pub restart_count: u32,
    pub last_exit: Option<LastExit>,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

impl ServerState {
    pub fn new(definition: ServerDefinition) -> Self {
        Self {
            definition,
            status: ServerStatus::Stopped,
            restart_count: 0,
            last_exit: None,
            started_at: None,
            pid: None,
        }
    }

    /// `starting → running`. Records the pid and start timestamp, resetting
    /// the restart counter if the prior run lasted long enough.
    pub fn mark_spawned(&mut self, pid: u32) -> ServerEvent {
        let now = Utc::now();
        self.status = ServerStatus::Starting;
        self.pid = Some(pid);
        self.started_at = Some(now);
        ServerEvent::Starting {
            server_id: self.definition.id.clone(),
            at: now,
        }
    }

    pub fn mark_running(&mut self) -> Result<ServerEvent, InvalidStateTransition> {
        if self.status != ServerStatus::Starting {
            return Err(InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Running".to_string(),
            });
        }
        self.status = ServerStatus::Running;
        let pid = self.pid.unwrap_or(0);
        Ok(ServerEvent::Running {
            server_id: self.definition.id.clone(),
            pid,
            at: Utc::now(),
        })
    }

    /// Whether enough continuous running time has elapsed to reset the
    /// restart counter on the next crash (Open Question #1).
    fn eligible_for_restart_reset(&self) -> bool {
        self.started_at
            .map(|started| {
                (Utc::now() - started).num_seconds() >= RESTART_COUNTER_RESET_AFTER_SECS
            })
            .unwrap_or(false)
    }

    /// Child process exited or errored. Clears the pid (invariant: pid
    /// present iff starting/running) and returns the exit event plus
    /// whether a restart should be scheduled.
    pub fn mark_exited(&mut self, code: Option<i32>, signal: Option<i32>) -> ServerEvent {
        if self.status == ServerStatus::Running && self.eligible_for_restart_reset() {
            self.restart_count = 0;
        }
        let now = Utc::now();
        self.last_exit = Some(LastExit {
            code,
            signal,
            at: now,
        });
        self.pid = None;
        self.status = ServerStatus::Error;
        ServerEvent::Exited {
            server_id: self.definition.id.clone(),
            code,
            signal,
            at: now,
        }
    }

    /// Schedules a restart: increments the counter, transitions to
    /// `restarting`, and computes the backoff delay (spec invariant 3):
    /// `min(initial * 2^(n-1), max)`.
    pub fn schedule_restart(&mut self, initial_ms: u64, max_ms: u64) -> ServerEvent {
        self.restart_count += 1;
        self.status = ServerStatus::Restarting;
        let delay_ms = restart_delay_ms(self.restart_count, initial_ms, max_ms);
        ServerEvent::RestartScheduled {
            server_id: self.definition.id.clone(),
            attempt: self.restart_count,
            delay_ms,
            at: Utc::now(),
        }
    }

    pub fn mark_stopped(&mut self) -> ServerEvent {
        self.status = ServerStatus::Stopped;
        self.pid = None;
        ServerEvent::Stopped {
            server_id: self.definition.id.clone(),
            at: Utc::now(),
        }
    }

    pub fn reset_restarts(&mut self) {
        self.restart_count = 0;
    }

    pub fn has_live_process(&self) -> bool {
        matches!(self.status, ServerStatus::Starting | ServerStatus::Running) && self.pid.is_some()
    }
}

/// `min(initial * 2^(n-1), max)` for attempt `n` (n ≥ 1).
pub fn restart_delay_ms(attempt: u32, initial_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(63);
    let scaled = initial_ms.saturating_mul(1u64 << shift);
    scaled.min(max_ms)
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

    #[test]
    fn restart_backoff_is_monotone_and_capped() {
        assert_eq!(restart_delay_ms(1, 50, 100), 50);
        assert_eq!(restart_delay_ms(2, 50, 100), 100);
        assert_eq!(restart_delay_ms(3, 50, 100), 100);
        assert_eq!(restart_delay_ms(4, 50, 100), 100);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut state = ServerState::new(def("codex"));
        assert_eq!(state.status, ServerStatus::Stopped);

        state.mark_spawned(123);
        assert_eq!(state.status, ServerStatus::Starting);
        assert_eq!(state.pid, Some(123));

        state.mark_running().unwrap();
        assert_eq!(state.status, ServerStatus::Running);

        state.mark_exited(Some(1), None);
        assert_eq!(state.status, ServerStatus::Error);
        assert_eq!(state.pid, None);

        state.schedule_restart(50, 100);
        assert_eq!(state.status, ServerStatus::Restarting);
        assert_eq!(state.restart_count, 1);
    }

    #[test]
    fn running_twice_is_invalid_transition() {
        let mut state = ServerState::new(def("codex"));
        state.mark_spawned(1);
        state.mark_running().unwrap();
        assert!(state.mark_running().is_err());
    }
}
