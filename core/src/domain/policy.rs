// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Revocation Set and audit trail (spec §3, §4.6, C6).
//!
//! Thread-safe via `dashmap::DashSet`, matching the teacher's use of
//! `dashmap` for hot-path concurrent lookups (`ToolPolicy::is_tool_allowed`
//! in the tool-routing domain, here specialized to `isRevoked` being O(1)).

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Revoked,
    Restored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tool_id: String,
    pub action: AuditAction,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

/// The live revoked-tool-id set plus its audit trail. Audit entries are
/// never a source of truth for client behavior — only for operators (spec
/// §9 design note).
#[derive(Debug, Default)]
pub struct RevocationSet {
    ids: DashSet<String>,
    audit: audit_log::AuditLog,
}

mod audit_log {
    //! The audit log only needs a `Mutex<Vec<_>>`; it is append-only and
    //! read infrequently (operator inspection), so `std::sync::Mutex` is
    //! adequate and avoids pulling in `parking_lot` for a single field.
    use super::AuditRecord;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct AuditLog(Mutex<Vec<AuditRecord>>);

    impl AuditLog {
        pub fn push(&self, record: AuditRecord) {
            self.0.lock().unwrap().push(record);
        }

        pub fn snapshot(&self) -> Vec<AuditRecord> {
            self.0.lock().unwrap().clone()
        }
    }
}

impl RevocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_revoked(&self, tool_id: &str) -> bool {
        self.ids.contains(tool_id)
    }

    /// Adds each id not already present; appends one audit entry per id.
    /// Returns the ids that were newly revoked (used to drive
    /// `InvocationService::cancel_by_tool`).
    pub fn revoke(
        &self,
        ids: &[String],
        reason: Option<String>,
        actor: Option<String>,
    ) -> Vec<String> {
        let now = Utc::now();
        let mut newly = Vec::new();
        for id in ids {
            if self.ids.insert(id.clone()) {
                newly.push(id.clone());
            }
            self.audit.push(AuditRecord {
                tool_id: id.clone(),
                action: AuditAction::Revoked,
                reason: reason.clone(),
                actor: actor.clone(),
                at: now,
            });
        }
        newly
    }

    pub fn restore(&self, ids: &[String], reason: Option<String>, actor: Option<String>) {
        let now = Utc::now();
        for id in ids {
            self.ids.remove(id);
            self.audit.push(AuditRecord {
                tool_id: id.clone(),
                action: AuditAction::Restored,
                reason: reason.clone(),
                actor: actor.clone(),
                at: now,
            });
        }
    }

    pub fn clear(&self) {
        let ids: Vec<String> = self.ids.iter().map(|r| r.clone()).collect();
        self.restore(&ids, Some("clear".to_string()), None);
    }

    /// Sorted snapshot of currently revoked ids, for subscriber registration
    /// and the admin response.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.iter().map(|r| r.clone()).collect();
        ids.sort();
        ids
    }

    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoke_then_restore() {
        let set = RevocationSet::new();
        let newly = set.revoke(&["server-a:tool-x".to_string()], None, None);
        assert_eq!(newly, vec!["server-a:tool-x".to_string()]);
        assert!(set.is_revoked("server-a:tool-x"));

        // revoking again yields no newly-revoked ids
        let newly_again = set.revoke(&["server-a:tool-x".to_string()], None, None);
        assert!(newly_again.is_empty());

        set.restore(&["server-a:tool-x".to_string()], None, None);
        assert!(!set.is_revoked("server-a:tool-x"));
        assert_eq!(set.audit_log().len(), 3);
    }

    #[test]
    fn snapshot_is_sorted() {
        let set = RevocationSet::new();
        set.revoke(
            &["b:tool".to_string(), "a:tool".to_string()],
            None,
            None,
        );
        assert_eq!(set.snapshot(), vec!["a:tool".to_string(), "b:tool".to_string()]);
    }

    #[test]
    fn clear_restores_everything() {
        let set = RevocationSet::new();
        set.revoke(&["a:tool".to_string(), "b:tool".to_string()], None, None);
        set.clear();
        assert!(set.snapshot().is_empty());
    }
}
