/// Association reconciliation
///
/// Brings the persisted associations of one (care request, origin) in line
/// with a desired partner set. Planning is pure; applying the plan talks to
/// the store and aborts on the first persistence failure.

use std::sync::Arc;

use crate::errors::PartnerError;
use crate::matching::PartnerSet;
use crate::store::{CareRequestPartner, Origin, PartnerId, PartnerStore};

/// Changes needed to make the existing rows match the desired set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Existing rows whose partner is still desired
    pub kept: Vec<CareRequestPartner>,
    /// Association ids to soft delete, including duplicate rows for a kept partner
    pub to_delete: Vec<i64>,
    pub to_create: Vec<PartnerId>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty()
    }
}

/// Plan a reconciliation. Rows of other origins in `existing` are ignored.
pub fn plan(existing: &[CareRequestPartner], origin: Origin, desired: &PartnerSet) -> ReconcilePlan {
    let mut remaining = desired.clone();
    let mut plan = ReconcilePlan::default();

    for association in existing.iter().filter(|a| a.origin == origin && a.deleted_at.is_none()) {
        // first row for a desired partner is kept; a second one is a duplicate
        if remaining.remove(&association.partner_id) {
            plan.kept.push(association.clone());
        } else {
            plan.to_delete.push(association.id);
        }
    }

    plan.to_create = remaining.into_iter().collect();
    plan
}

/// Result of applying a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Canonical active associations for the origin: kept plus created
    pub associations: Vec<CareRequestPartner>,
    pub created: usize,
    pub deleted: usize,
}

impl ReconcileOutcome {
    pub fn partner_ids(&self) -> Vec<PartnerId> {
        let mut ids: Vec<PartnerId> = self.associations.iter().map(|a| a.partner_id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn match_count(&self) -> usize {
        self.associations.len()
    }
}

pub struct AssociationReconciler {
    store: Arc<dyn PartnerStore>,
}

impl AssociationReconciler {
    pub fn new(store: Arc<dyn PartnerStore>) -> Self {
        AssociationReconciler { store }
    }

    /// Load the current associations of the care request and reconcile `origin`.
    pub async fn reconcile_current(
        &self,
        care_request_id: i64,
        origin: Origin,
        desired: &PartnerSet,
    ) -> Result<ReconcileOutcome, PartnerError> {
        let existing = self
            .store
            .list_active_associations(care_request_id)
            .await
            .map_err(|e| PartnerError::Internal(format!("GetCareRequestPartnersByStationCareRequestID error: {}", e)))?;
        self.reconcile(care_request_id, origin, &existing, desired).await
    }

    /// Apply deletes and creates so the origin's rows equal `desired`.
    ///
    /// Source applies creates before deletes so the request never has zero
    /// source partners in between.
    pub async fn reconcile(
        &self,
        care_request_id: i64,
        origin: Origin,
        existing: &[CareRequestPartner],
        desired: &PartnerSet,
    ) -> Result<ReconcileOutcome, PartnerError> {
        let plan = plan(existing, origin, desired);
        if plan.is_noop() {
            return Ok(ReconcileOutcome {
                associations: plan.kept,
                created: 0,
                deleted: 0,
            });
        }

        let created = if origin == Origin::Source {
            let created = self.create_all(care_request_id, origin, &plan.to_create).await?;
            self.delete_all(&plan.to_delete).await?;
            created
        } else {
            self.delete_all(&plan.to_delete).await?;
            self.create_all(care_request_id, origin, &plan.to_create).await?
        };

        tracing::debug!(
            care_request_id = care_request_id,
            origin = %origin,
            kept = plan.kept.len(),
            created = created.len(),
            deleted = plan.to_delete.len(),
            "Reconciled care request partners"
        );

        let created_count = created.len();
        let mut associations = plan.kept;
        associations.extend(created);
        Ok(ReconcileOutcome {
            associations,
            created: created_count,
            deleted: plan.to_delete.len(),
        })
    }

    async fn create_all(
        &self,
        care_request_id: i64,
        origin: Origin,
        partner_ids: &[PartnerId],
    ) -> Result<Vec<CareRequestPartner>, PartnerError> {
        let mut created = Vec::with_capacity(partner_ids.len());
        for &partner_id in partner_ids {
            let association = self
                .store
                .add_association(care_request_id, partner_id, origin)
                .await
                .map_err(|e| PartnerError::Internal(format!("AddCareRequestPartner error: {}", e)))?;
            created.push(association);
        }
        Ok(created)
    }

    async fn delete_all(&self, association_ids: &[i64]) -> Result<(), PartnerError> {
        for &id in association_ids {
            self.store
                .delete_association(id)
                .await
                .map_err(|e| PartnerError::Internal(format!("DeleteCareRequestPartner error: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryPartnerStore, StoreOp};
    use chrono::{TimeZone, Utc};

    fn row(id: i64, partner_id: PartnerId, origin: Origin) -> CareRequestPartner {
        CareRequestPartner {
            id,
            care_request_id: 1,
            partner_id,
            origin,
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_plan_splits_existing_and_desired() {
        let existing = vec![
            row(1, 10, Origin::Location),
            row(2, 20, Origin::Location),
            row(3, 30, Origin::Insurance),
        ];
        let desired = PartnerSet::from([20, 40]);

        let plan = plan(&existing, Origin::Location, &desired);
        assert_eq!(plan.kept, vec![row(2, 20, Origin::Location)]);
        assert_eq!(plan.to_delete, vec![1]);
        assert_eq!(plan.to_create, vec![40]);
    }

    #[test]
    fn test_plan_deletes_duplicate_rows() {
        let existing = vec![row(1, 10, Origin::PopHealth), row(2, 10, Origin::PopHealth)];
        let plan = plan(&existing, Origin::PopHealth, &PartnerSet::from([10]));
        assert_eq!(plan.kept.len(), 1);
        assert_eq!(plan.to_delete, vec![2]);
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn test_empty_desired_deletes_everything() {
        let existing = vec![row(1, 10, Origin::Insurance), row(2, 11, Origin::Insurance)];
        let plan = plan(&existing, Origin::Insurance, &PartnerSet::new());
        assert!(plan.kept.is_empty());
        assert_eq!(plan.to_delete, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_noop() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let reconciler = AssociationReconciler::new(store.clone());
        let desired = PartnerSet::from([3, 4]);

        let first = reconciler.reconcile_current(9, Origin::Location, &desired).await.unwrap();
        assert_eq!(first.created, 2);

        let second = reconciler.reconcile_current(9, Origin::Location, &desired).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.deleted, 0);
        assert_eq!(second.partner_ids(), vec![3, 4]);
        assert_eq!(store.all_associations().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_source_swap_leaves_one_association() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let reconciler = AssociationReconciler::new(store.clone());
        reconciler
            .reconcile_current(9, Origin::Source, &PartnerSet::from([1]))
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile_current(9, Origin::Source, &PartnerSet::from([2]))
            .await
            .unwrap();
        assert_eq!(outcome.partner_ids(), vec![2]);

        let active = store.list_active_associations(9).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].partner_id, 2);
    }

    #[tokio::test]
    async fn test_source_create_failure_keeps_old_partner() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let reconciler = AssociationReconciler::new(store.clone());
        reconciler
            .reconcile_current(9, Origin::Source, &PartnerSet::from([1]))
            .await
            .unwrap();

        store.fail_next(StoreOp::AddAssociation).unwrap();
        let result = reconciler
            .reconcile_current(9, Origin::Source, &PartnerSet::from([2]))
            .await;
        assert!(matches!(result, Err(PartnerError::Internal(_))));

        let active = store.list_active_associations(9).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].partner_id, 1);
    }

    #[tokio::test]
    async fn test_delete_failure_aborts_before_create() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let reconciler = AssociationReconciler::new(store.clone());
        reconciler
            .reconcile_current(9, Origin::Location, &PartnerSet::from([1]))
            .await
            .unwrap();

        store.fail_next(StoreOp::DeleteAssociation).unwrap();
        let result = reconciler
            .reconcile_current(9, Origin::Location, &PartnerSet::from([2]))
            .await;
        assert!(result.is_err());
        let active = store.list_active_associations(9).await.unwrap();
        assert_eq!(active.iter().map(|a| a.partner_id).collect::<Vec<_>>(), vec![1]);
    }
}
