//! Change ledger
//!
//! Every content mutation to an ontology is a [`PendingChange`]. Stage output is
//! written to the object as staged and recorded here in the same commit;
//! manual edits are only recorded. Approval applies a change atomically,
//! rejection discards it.

pub mod apply;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{conflict_error, not_found_error, AppError};
use crate::models::{ChangeDiff, ChangeOrigin, ChangeStatus, PendingChange};
use crate::pipeline::types::DagNode;
use crate::store::{OntologyState, OntologyStore};

/// Record stage output: write it as staged and log the change, inside the
/// caller's commit. Returns `None` when nothing would change or an identical
/// change is already pending.
pub fn record_staged(
    state: &mut OntologyState,
    diff: ChangeDiff,
    node: DagNode,
) -> Result<Option<PendingChange>, AppError> {
    if is_noop(&diff) {
        return Ok(None);
    }

    let target = diff.target();
    let mut superseded = Vec::new();
    for existing in state.pending_for(&target) {
        if existing.diff == diff {
            return Ok(None);
        }
        // An older stage proposal of the same kind is replaced by this one
        if matches!(existing.origin, ChangeOrigin::Stage { .. })
            && std::mem::discriminant(&existing.diff) == std::mem::discriminant(&diff)
        {
            superseded.push(existing.clone());
        }
    }

    // The replacement keeps the oldest before-values so a rejection restores
    // what was live, not the superseded staging
    let mut diff = diff;
    if let Some(oldest) = superseded.first() {
        inherit_before(&mut diff, &oldest.diff);
    }
    for mut old in superseded {
        old.status = ChangeStatus::Rejected;
        old.reason = Some("superseded by a newer stage result".to_string());
        old.resolved_at = Some(Utc::now());
        old.updated_at = Utc::now();
        state.put_change(old);
    }

    apply::write_staged(state, &diff);
    let change = PendingChange::new(state.ontology().id, diff, ChangeOrigin::Stage { node });
    state.put_change(change.clone());
    Ok(Some(change))
}

fn is_noop(diff: &ChangeDiff) -> bool {
    match diff {
        ChangeDiff::UpdateEntity { before, after, .. } => before.as_ref() == Some(after),
        ChangeDiff::AnnotateRelationship { before, after, .. } => before.as_ref() == Some(after),
        ChangeDiff::AnnotateColumn { before, after, .. } => before.as_ref() == Some(after),
        ChangeDiff::UpsertGlossaryTerm { before, after, .. } => before.as_ref() == Some(after),
        ChangeDiff::SetDomainSummary { before, after } => before.as_ref() == Some(after),
        _ => false,
    }
}

fn inherit_before(diff: &mut ChangeDiff, older: &ChangeDiff) {
    match (diff, older) {
        (ChangeDiff::UpdateEntity { before, .. }, ChangeDiff::UpdateEntity { before: old, .. }) => {
            *before = old.clone()
        }
        (
            ChangeDiff::AnnotateRelationship { before, .. },
            ChangeDiff::AnnotateRelationship { before: old, .. },
        ) => *before = old.clone(),
        (ChangeDiff::AnnotateColumn { before, .. }, ChangeDiff::AnnotateColumn { before: old, .. }) => {
            *before = old.clone()
        }
        (
            ChangeDiff::UpsertGlossaryTerm { before, .. },
            ChangeDiff::UpsertGlossaryTerm { before: old, .. },
        ) => *before = old.clone(),
        (ChangeDiff::SetDomainSummary { before, .. }, ChangeDiff::SetDomainSummary { before: old, .. }) => {
            *before = old.clone()
        }
        _ => {}
    }
}

/// Failure detail for one change in an approve-all pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFailure {
    pub change_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveAllReport {
    pub applied_count: usize,
    pub failed_count: usize,
    pub failures: Vec<ChangeFailure>,
}

enum Approval {
    Applied(PendingChange),
    AlreadyApproved(PendingChange),
    Failed(AppError),
}

pub struct ChangeLedger {
    store: Arc<OntologyStore>,
}

impl ChangeLedger {
    pub fn new(store: Arc<OntologyStore>) -> Self {
        Self { store }
    }

    /// Changes in creation order, optionally filtered by status
    pub async fn list(
        &self,
        ontology_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> Result<Vec<PendingChange>, AppError> {
        self.store
            .read(ontology_id, |state| {
                state
                    .changes()
                    .into_iter()
                    .filter(|c| status.map_or(true, |s| c.status == s))
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn get(&self, ontology_id: Uuid, change_id: Uuid) -> Result<PendingChange, AppError> {
        self.store
            .read(ontology_id, |state| state.change(change_id).cloned())
            .await?
            .ok_or_else(|| not_found_error(format!("Change {} not found", change_id)))
    }

    /// Record a manual edit for review. Validated now, applied on approval.
    pub async fn propose(
        &self,
        ontology_id: Uuid,
        diff: ChangeDiff,
        author: Option<String>,
    ) -> Result<PendingChange, AppError> {
        let change = self
            .store
            .commit(ontology_id, |state| {
                apply::check_proposal(state, &diff)?;
                let change = PendingChange::new(ontology_id, diff, ChangeOrigin::Manual { author });
                state.put_change(change.clone());
                Ok(change)
            })
            .await?;

        info!(
            %ontology_id,
            change_id = %change.id,
            destructive = change.diff.is_destructive(),
            "Proposed: {}",
            change.diff.description()
        );
        Ok(change)
    }

    /// Apply a pending change. Re-approving is a no-op success; a failed
    /// apply leaves the change pending with the reason attached.
    pub async fn approve(&self, ontology_id: Uuid, change_id: Uuid) -> Result<PendingChange, AppError> {
        let outcome = self
            .store
            .commit(ontology_id, |state| {
                let mut change = state
                    .change(change_id)
                    .cloned()
                    .ok_or_else(|| not_found_error(format!("Change {} not found", change_id)))?;

                match change.status {
                    ChangeStatus::Approved => return Ok(Approval::AlreadyApproved(change)),
                    ChangeStatus::Rejected => {
                        return Err(conflict_error(format!(
                            "Change {} was rejected and cannot be approved",
                            change_id
                        )))
                    }
                    ChangeStatus::Pending => {}
                }

                if let Err(e) = apply::check(state, &change.diff) {
                    change.reason = Some(e.to_string());
                    change.updated_at = Utc::now();
                    state.put_change(change);
                    return Ok(Approval::Failed(e));
                }

                apply::apply(state, &change.diff);
                let now = Utc::now();
                change.status = ChangeStatus::Approved;
                change.reason = None;
                change.resolved_at = Some(now);
                change.updated_at = now;
                state.put_change(change.clone());
                apply::settle_review(state, &change.target);
                Ok(Approval::Applied(change))
            })
            .await?;

        match outcome {
            Approval::Applied(change) => {
                info!(%ontology_id, %change_id, "Approved: {}", change.diff.description());
                Ok(change)
            }
            Approval::AlreadyApproved(change) => Ok(change),
            Approval::Failed(e) => {
                warn!(%ontology_id, %change_id, error = %e, "Change could not be applied");
                Err(e)
            }
        }
    }

    /// Discard a pending change. Re-rejecting is a no-op success.
    pub async fn reject(
        &self,
        ontology_id: Uuid,
        change_id: Uuid,
        reason: Option<String>,
    ) -> Result<PendingChange, AppError> {
        let change = self
            .store
            .commit(ontology_id, |state| {
                let mut change = state
                    .change(change_id)
                    .cloned()
                    .ok_or_else(|| not_found_error(format!("Change {} not found", change_id)))?;

                match change.status {
                    ChangeStatus::Rejected => return Ok(change),
                    ChangeStatus::Approved => {
                        return Err(conflict_error(format!(
                            "Change {} was already approved",
                            change_id
                        )))
                    }
                    ChangeStatus::Pending => {}
                }

                // Manual edits were never written, so there is nothing to undo
                if matches!(change.origin, ChangeOrigin::Stage { .. }) {
                    apply::revert(state, &change.diff);
                }
                let now = Utc::now();
                change.status = ChangeStatus::Rejected;
                change.reason = reason;
                change.resolved_at = Some(now);
                change.updated_at = now;
                state.put_change(change.clone());
                Ok(change)
            })
            .await?;

        info!(%ontology_id, %change_id, "Rejected: {}", change.diff.description());
        Ok(change)
    }

    /// Approve every change pending right now, in creation order, each in its
    /// own commit. Failures are collected, not fatal.
    pub async fn approve_all(&self, ontology_id: Uuid) -> Result<ApproveAllReport, AppError> {
        let pending: Vec<Uuid> = self
            .list(ontology_id, Some(ChangeStatus::Pending))
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut report = ApproveAllReport::default();
        for change_id in pending {
            match self.approve(ontology_id, change_id).await {
                Ok(_) => report.applied_count += 1,
                Err(e) => {
                    report.failed_count += 1;
                    report.failures.push(ChangeFailure {
                        change_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            %ontology_id,
            applied = report.applied_count,
            failed = report.failed_count,
            "Approve-all finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Cardinality, ColumnLocation, DiscoveryMethod, Entity, Ontology, Relationship, RelationshipAnnotation,
        ReviewState,
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<OntologyStore>,
        ledger: ChangeLedger,
        ontology_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(OntologyStore::in_memory());
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        Fixture {
            ledger: ChangeLedger::new(store.clone()),
            store,
            ontology_id: ontology.id,
        }
    }

    fn user(ontology_id: Uuid) -> Entity {
        Entity::new(ontology_id, "User", ColumnLocation::new("public", "users", "id"))
    }

    fn order_user(ontology_id: Uuid) -> Relationship {
        Relationship::new(
            ontology_id,
            "Order",
            "User",
            ColumnLocation::new("public", "orders", "user_id"),
            ColumnLocation::new("public", "users", "id"),
            Cardinality::ManyToOne,
            DiscoveryMethod::ForeignKey,
        )
    }

    async fn stage(f: &Fixture, diff: ChangeDiff) -> Option<PendingChange> {
        f.store
            .commit(f.ontology_id, |state| record_staged(state, diff, DagNode::EntityDiscovery))
            .await
            .unwrap()
    }

    async fn stage_users_and_orders(f: &Fixture) -> (PendingChange, PendingChange) {
        let id = f.ontology_id;
        let users = stage(f, ChangeDiff::CreateEntity { entity: user(id) }).await.unwrap();
        let orders = stage(
            f,
            ChangeDiff::CreateEntity {
                entity: Entity::new(id, "Order", ColumnLocation::new("public", "orders", "id")),
            },
        )
        .await
        .unwrap();
        (users, orders)
    }

    #[tokio::test]
    async fn test_staged_write_then_approve_goes_live() {
        let f = fixture().await;
        let change = stage(&f, ChangeDiff::CreateEntity { entity: user(f.ontology_id) }).await.unwrap();

        let review = f
            .store
            .read(f.ontology_id, |s| s.entity("User").map(|e| e.review))
            .await
            .unwrap();
        assert_eq!(review, Some(ReviewState::Staged));

        let approved = f.ledger.approve(f.ontology_id, change.id).await.unwrap();
        assert_eq!(approved.status, ChangeStatus::Approved);
        let review = f
            .store
            .read(f.ontology_id, |s| s.entity("User").map(|e| e.review))
            .await
            .unwrap();
        assert_eq!(review, Some(ReviewState::Live));
    }

    #[tokio::test]
    async fn test_reapproval_is_idempotent() {
        let f = fixture().await;
        let change = stage(&f, ChangeDiff::CreateEntity { entity: user(f.ontology_id) }).await.unwrap();

        let first = f.ledger.approve(f.ontology_id, change.id).await.unwrap();
        let second = f.ledger.approve(f.ontology_id, change.id).await.unwrap();
        assert_eq!(first.resolved_at, second.resolved_at);
        assert_eq!(second.status, ChangeStatus::Approved);

        let count = f.store.read(f.ontology_id, |s| s.entities().count()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_identical_stage_output_is_not_recorded_twice() {
        let f = fixture().await;
        let entity = user(f.ontology_id);
        assert!(stage(&f, ChangeDiff::CreateEntity { entity: entity.clone() }).await.is_some());
        assert!(stage(&f, ChangeDiff::CreateEntity { entity }).await.is_none());
        assert_eq!(f.ledger.list(f.ontology_id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_restores_before_values() {
        let f = fixture().await;
        let created = stage(&f, ChangeDiff::CreateEntity { entity: user(f.ontology_id) }).await.unwrap();
        f.ledger.approve(f.ontology_id, created.id).await.unwrap();

        let before = user(f.ontology_id).fields();
        let mut after = before.clone();
        after.description = Some("Someone who shops".to_string());
        let update = stage(
            &f,
            ChangeDiff::UpdateEntity {
                name: "User".to_string(),
                before: Some(before),
                after,
            },
        )
        .await
        .unwrap();

        let staged = f
            .store
            .read(f.ontology_id, |s| s.entity("User").and_then(|e| e.description.clone()))
            .await
            .unwrap();
        assert_eq!(staged.as_deref(), Some("Someone who shops"));

        let rejected = f
            .ledger
            .reject(f.ontology_id, update.id, Some("too vague".to_string()))
            .await
            .unwrap();
        assert_eq!(rejected.reason.as_deref(), Some("too vague"));
        let restored = f
            .store
            .read(f.ontology_id, |s| s.entity("User").and_then(|e| e.description.clone()))
            .await
            .unwrap();
        assert_eq!(restored, None);

        // Rejecting again is a no-op, approving a rejected change is not
        assert!(f.ledger.reject(f.ontology_id, update.id, None).await.is_ok());
        let err = f.ledger.approve(f.ontology_id, update.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rejecting_a_creation_marks_it_rejected_in_place() {
        let f = fixture().await;
        let (users, _) = stage_users_and_orders(&f).await;
        let forward = order_user(f.ontology_id);
        stage(
            &f,
            ChangeDiff::CreateRelationshipPair {
                reverse: forward.mirror(),
                forward,
            },
        )
        .await
        .unwrap();

        f.ledger.reject(f.ontology_id, users.id, None).await.unwrap();

        let (review, rows) = f
            .store
            .read(f.ontology_id, |s| {
                (s.entity("User").map(|e| e.review), s.relationships().count())
            })
            .await
            .unwrap();
        assert_eq!(review, Some(ReviewState::Rejected));
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_failed_apply_stays_pending_with_reason() {
        let f = fixture().await;
        let (users, orders) = stage_users_and_orders(&f).await;
        let forward = order_user(f.ontology_id);
        let key = forward.key();
        let pair = stage(
            &f,
            ChangeDiff::CreateRelationshipPair {
                reverse: forward.mirror(),
                forward,
            },
        )
        .await
        .unwrap();
        for id in [users.id, orders.id, pair.id] {
            f.ledger.approve(f.ontology_id, id).await.unwrap();
        }

        let label = f
            .ledger
            .propose(
                f.ontology_id,
                ChangeDiff::AnnotateRelationship {
                    key: key.clone(),
                    before: None,
                    after: RelationshipAnnotation {
                        association: Some("placed_by".to_string()),
                        description: None,
                    },
                },
                Some("analyst".to_string()),
            )
            .await
            .unwrap();
        let delete = f
            .ledger
            .propose(f.ontology_id, ChangeDiff::DeleteRelationship { key: key.clone() }, None)
            .await
            .unwrap();

        f.ledger.approve(f.ontology_id, delete.id).await.unwrap();
        let err = f.ledger.approve(f.ontology_id, label.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let label = f.ledger.get(f.ontology_id, label.id).await.unwrap();
        assert_eq!(label.status, ChangeStatus::Pending);
        assert!(label.reason.is_some());

        // Only the forward row was deleted
        let pair = f.store.read(f.ontology_id, |s| s.pair(&key)).await.unwrap();
        assert!(pair.forward.is_none());
        assert!(pair.reverse.is_some());
    }

    #[tokio::test]
    async fn test_delete_entity_blocked_by_relationships() {
        let f = fixture().await;
        stage_users_and_orders(&f).await;
        let forward = order_user(f.ontology_id);
        stage(
            &f,
            ChangeDiff::CreateRelationshipPair {
                reverse: forward.mirror(),
                forward,
            },
        )
        .await
        .unwrap();

        let err = f
            .ledger
            .propose(
                f.ontology_id,
                ChangeDiff::DeleteEntity {
                    name: "User".to_string(),
                    reason: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_approve_all_continues_past_failures() {
        let f = fixture().await;
        let (users, _) = stage_users_and_orders(&f).await;
        let forward = order_user(f.ontology_id);
        let key = forward.key();
        stage(
            &f,
            ChangeDiff::CreateRelationshipPair {
                reverse: forward.mirror(),
                forward,
            },
        )
        .await
        .unwrap();
        // Pair creation cannot apply once its target entity is gone
        f.ledger.reject(f.ontology_id, users.id, None).await.unwrap();

        let report = f.ledger.approve_all(f.ontology_id).await.unwrap();
        assert_eq!(report.applied_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.failures.len(), 1);

        let pending = f
            .ledger
            .list(f.ontology_id, Some(ChangeStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, crate::models::TargetRef::RelationshipPair { key });
    }

    #[tokio::test]
    async fn test_unknown_change_is_not_found_and_touches_nothing() {
        let f = fixture().await;
        let (users, _) = stage_users_and_orders(&f).await;

        let err = f.ledger.approve(f.ontology_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let users = f.ledger.get(f.ontology_id, users.id).await.unwrap();
        assert_eq!(users.status, ChangeStatus::Pending);
        assert_eq!(users.reason, None);
    }
}
