// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tool Policy service (spec §4.6, C6).
//!
//! Wraps `domain::policy::RevocationSet`, publishes a `PolicyEvent` on every
//! change, and invokes a cancellation hook with the ids newly revoked. The
//! hook must enqueue cancellations and return quickly — no RPC call happens
//! inside it (spec §5); `InvocationService::cancel_by_tool` is wired in as
//! that hook once it exists.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::events::PolicyEvent;
use crate::domain::policy::{AuditRecord, RevocationSet};
use crate::infrastructure::event_bus::EventBus;

/// Invoked with the ids newly revoked, outside of any lock held by
/// `PolicyService`.
pub type CancelHook = Arc<dyn Fn(Vec<String>) + Send + Sync>;

pub struct PolicyService {
    revocations: RevocationSet,
    event_bus: Arc<EventBus>,
    cancel_hook: RwLock<Option<CancelHook>>,
}

impl PolicyService {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            revocations: RevocationSet::new(),
            event_bus,
            cancel_hook: RwLock::new(None),
        }
    }

    pub async fn set_cancel_hook(&self, hook: CancelHook) {
        *self.cancel_hook.write().await = Some(hook);
    }

    pub fn is_revoked(&self, tool_id: &str) -> bool {
        self.revocations.is_revoked(tool_id)
    }

    pub async fn revoke(&self, ids: Vec<String>, reason: Option<String>, actor: Option<String>) {
        let newly = self.revocations.revoke(&ids, reason.clone(), actor.clone());
        self.event_bus.publish(PolicyEvent::Revoked {
            tool_ids: ids,
            reason,
            actor,
            at: chrono::Utc::now(),
        });
        if !newly.is_empty() {
            if let Some(hook) = self.cancel_hook.read().await.as_ref() {
                hook(newly);
            }
        }
    }

    pub async fn restore(&self, ids: Vec<String>, reason: Option<String>, actor: Option<String>) {
        self.revocations.restore(&ids, reason.clone(), actor.clone());
        self.event_bus.publish(PolicyEvent::Restored {
            tool_ids: ids,
            reason,
            actor,
            at: chrono::Utc::now(),
        });
    }

    pub fn clear(&self) {
        self.revocations.clear();
        self.event_bus.publish(PolicyEvent::Cleared { at: chrono::Utc::now() });
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.revocations.snapshot()
    }

    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.revocations.audit_log()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn revoke_invokes_hook_with_newly_revoked_only() {
        let bus = Arc::new(EventBus::with_default_capacity());
        let service = PolicyService::new(bus);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        service
            .set_cancel_hook(Arc::new(move |ids: Vec<String>| {
                calls2.fetch_add(ids.len(), Ordering::SeqCst);
            }))
            .await;

        service.revoke(vec!["a:tool".to_string()], None, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        service.revoke(vec!["a:tool".to_string()], None, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "re-revoking is a no-op for the hook");
    }

    #[tokio::test]
    async fn restore_and_clear_update_snapshot() {
        let bus = Arc::new(EventBus::with_default_capacity());
        let service = PolicyService::new(bus);
        service.revoke(vec!["a:tool".to_string(), "b:tool".to_string()], None, None).await;
        service.restore(vec!["a:tool".to_string()], None, None).await;
        assert_eq!(service.snapshot(), vec!["b:tool".to_string()]);
        service.clear();
        assert!(service.snapshot().is_empty());
    }
}
