//! Duplicate-action guard.
//!
//! Per-session idempotency for side effects that must happen at most once
//! per (actor, entity), such as recording a recipe view.

use dashmap::DashSet;
use tracing::{debug, trace};

use crate::{EntityId, OnceActionKind, RemoteGateway, SyncError};

/// One attempted once-only action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupRecord {
    pub actor_id: EntityId,
    pub entity_id: EntityId,
    pub action: OnceActionKind,
}

impl DedupRecord {
    pub fn new(action: OnceActionKind, actor_id: EntityId, entity_id: EntityId) -> Self {
        Self {
            actor_id,
            entity_id,
            action,
        }
    }
}

/// Result of [`DuplicateActionGuard::log_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceOutcome {
    /// The backend recorded the action.
    Recorded,
    /// The backend already had it; counts as success.
    AlreadyRecorded,
    /// This session already attempted it; no call was made.
    Skipped,
}

/// Session-scoped table of fired actions.
#[derive(Default)]
pub struct DuplicateActionGuard {
    fired: DashSet<DedupRecord>,
}

impl DuplicateActionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, record: &DedupRecord) -> bool {
        self.fired.contains(record)
    }

    /// Record the action. Returns true if it was not recorded before.
    pub fn mark_fired(&self, record: DedupRecord) -> bool {
        self.fired.insert(record)
    }

    /// Forget an action so a later attempt may retry it.
    pub fn release(&self, record: &DedupRecord) -> bool {
        self.fired.remove(record).is_some()
    }

    /// Fire a once-only action through `gateway`.
    ///
    /// The record is claimed before the call, so concurrent attempts issue
    /// exactly one call. A conflict from the backend means the action was
    /// already recorded and keeps the claim; any other failure releases it.
    pub async fn log_once(
        &self,
        gateway: &dyn RemoteGateway,
        action: OnceActionKind,
        actor_id: &EntityId,
        entity_id: &EntityId,
    ) -> Result<OnceOutcome, SyncError> {
        let record = DedupRecord::new(action, actor_id.clone(), entity_id.clone());
        if !self.mark_fired(record.clone()) {
            trace!(action = %action, entity = %entity_id, "guard: already fired this session");
            return Ok(OnceOutcome::Skipped);
        }

        match gateway.log_once_action(action, actor_id, entity_id).await {
            Ok(()) => Ok(OnceOutcome::Recorded),
            Err(e) if e.is_conflict() => {
                debug!(action = %action, entity = %entity_id, "guard: backend already recorded action");
                Ok(OnceOutcome::AlreadyRecorded)
            }
            Err(e) => {
                self.release(&record);
                debug!(action = %action, entity = %entity_id, error = %e, "guard: action failed, claim released");
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fired.is_empty()
    }

    /// Forget everything. Called at sign-out.
    pub fn clear(&self) {
        self.fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Rpc, ScriptedGateway};
    use std::sync::Arc;

    fn view_record() -> DedupRecord {
        DedupRecord::new(OnceActionKind::RecipeView, "u1".into(), "r1".into())
    }

    #[test]
    fn test_mark_fired_once() {
        let guard = DuplicateActionGuard::new();
        assert!(!guard.has_fired(&view_record()));
        assert!(guard.mark_fired(view_record()));
        assert!(!guard.mark_fired(view_record()));
        assert!(guard.has_fired(&view_record()));
    }

    #[tokio::test]
    async fn test_second_attempt_skipped() {
        let gateway = ScriptedGateway::new();
        let guard = DuplicateActionGuard::new();

        let first = guard
            .log_once(gateway.as_ref(), OnceActionKind::RecipeView, &"u1".into(), &"r1".into())
            .await
            .unwrap();
        let second = guard
            .log_once(gateway.as_ref(), OnceActionKind::RecipeView, &"u1".into(), &"r1".into())
            .await
            .unwrap();

        assert_eq!(first, OnceOutcome::Recorded);
        assert_eq!(second, OnceOutcome::Skipped);
        assert_eq!(gateway.call_count(Rpc::LogOnceAction), 1);
        assert!(guard.has_fired(&view_record()));
    }

    #[tokio::test]
    async fn test_concurrent_attempts_issue_one_call() {
        let gateway = ScriptedGateway::new();
        let guard = Arc::new(DuplicateActionGuard::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let gateway = Arc::clone(&gateway);
                let guard = Arc::clone(&guard);
                tokio::spawn(async move {
                    guard
                        .log_once(gateway.as_ref(), OnceActionKind::ProfileView, &"u1".into(), &"u2".into())
                        .await
                })
            })
            .collect();

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == OnceOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(gateway.call_count(Rpc::LogOnceAction), 1);
    }

    #[tokio::test]
    async fn test_conflict_counts_as_success() {
        let gateway = ScriptedGateway::new();
        // Recorded by a previous session.
        gateway
            .log_once_action(OnceActionKind::RecipeView, &"u1".into(), &"r1".into())
            .await
            .unwrap();

        let guard = DuplicateActionGuard::new();
        let outcome = guard
            .log_once(gateway.as_ref(), OnceActionKind::RecipeView, &"u1".into(), &"r1".into())
            .await
            .unwrap();
        assert_eq!(outcome, OnceOutcome::AlreadyRecorded);
        assert!(guard.has_fired(&view_record()));
    }

    #[tokio::test]
    async fn test_network_failure_releases_claim() {
        let gateway = ScriptedGateway::new();
        gateway.fail_next(Rpc::LogOnceAction, SyncError::Network("offline".into()));
        let guard = DuplicateActionGuard::new();

        let err = guard
            .log_once(gateway.as_ref(), OnceActionKind::RecipeView, &"u1".into(), &"r1".into())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!guard.has_fired(&view_record()));

        let retry = guard
            .log_once(gateway.as_ref(), OnceActionKind::RecipeView, &"u1".into(), &"r1".into())
            .await
            .unwrap();
        assert_eq!(retry, OnceOutcome::Recorded);
    }
}
