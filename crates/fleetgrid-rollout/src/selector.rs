//! Collaborator seams: target resolution and assignment bookkeeping.
//!
//! The engine only talks to these traits. [`StateStore`] implements both,
//! evaluating filters over its targets table and tracking each target's
//! assigned/installed distribution.

use fleet_core::TargetFilter;
use fleetgrid_state::{
    Action, ActionStatus, PageRequest, StateStore, TargetId, TargetUpdateStatus,
};
use tracing::debug;

/// Resolves a filter expression to an ordered target population.
pub trait TargetSelector: Send + Sync {
    fn count(&self, filter: &TargetFilter) -> anyhow::Result<u64>;

    /// One page of matching target ids, in a stable order.
    fn resolve(&self, filter: &TargetFilter, page: PageRequest) -> anyhow::Result<Vec<TargetId>>;
}

/// Told whenever a target gains or loses an assignment.
pub trait AssignmentRecorder: Send + Sync {
    fn assigned(&self, action: &Action) -> anyhow::Result<()>;

    /// `action` has reached a terminal status.
    fn closed(&self, action: &Action) -> anyhow::Result<()>;
}

impl TargetSelector for StateStore {
    fn count(&self, filter: &TargetFilter) -> anyhow::Result<u64> {
        Ok(self.count_matching_targets(filter)?)
    }

    fn resolve(&self, filter: &TargetFilter, page: PageRequest) -> anyhow::Result<Vec<TargetId>> {
        Ok(self.resolve_targets(filter, page)?)
    }
}

impl AssignmentRecorder for StateStore {
    fn assigned(&self, action: &Action) -> anyhow::Result<()> {
        let updated = self.update_target(&action.target_id, |target| {
            target.assigned_distribution = Some(action.distribution.clone());
            target.update_status = TargetUpdateStatus::Pending;
        })?;
        if updated.is_none() {
            debug!(target_id = %action.target_id, "assignment for unregistered target");
        }
        Ok(())
    }

    fn closed(&self, action: &Action) -> anyhow::Result<()> {
        self.update_target(&action.target_id, |target| match action.status {
            ActionStatus::Finished => {
                target.installed_distribution = Some(action.distribution.clone());
                target.update_status = TargetUpdateStatus::InSync;
            }
            ActionStatus::Error => {
                target.update_status = TargetUpdateStatus::Error;
            }
            _ => {
                target.assigned_distribution = target.installed_distribution.clone();
                target.update_status = if target.installed_distribution.is_some() {
                    TargetUpdateStatus::InSync
                } else {
                    TargetUpdateStatus::Registered
                };
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{ActionType, Target, UpdateType};

    fn action(status: ActionStatus) -> Action {
        Action {
            id: 1,
            target_id: "dev-1".to_string(),
            rollout_id: None,
            group_id: None,
            distribution: "ds-2".to_string(),
            status,
            action_type: ActionType::Forced,
            update_type: UpdateType::Combined,
            status_count: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn store_tracks_target_distribution() {
        let store = StateStore::open_in_memory().unwrap();
        let mut target = Target::new("dev-1", 0);
        target.installed_distribution = Some("ds-1".to_string());
        store.put_target(&target).unwrap();

        store.assigned(&action(ActionStatus::Scheduled)).unwrap();
        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.assigned_distribution.as_deref(), Some("ds-2"));
        assert_eq!(target.update_status, TargetUpdateStatus::Pending);

        store.closed(&action(ActionStatus::Canceled)).unwrap();
        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.assigned_distribution.as_deref(), Some("ds-1"));
        assert_eq!(target.update_status, TargetUpdateStatus::InSync);

        store.closed(&action(ActionStatus::Finished)).unwrap();
        let target = store.get_target("dev-1").unwrap().unwrap();
        assert_eq!(target.installed_distribution.as_deref(), Some("ds-2"));
    }

    #[test]
    fn store_selector_counts_and_pages() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["b", "a", "c"] {
            store.put_target(&Target::new(id, 0)).unwrap();
        }
        let filter = TargetFilter::parse("id==*").unwrap();
        let selector: &dyn TargetSelector = &store;
        assert_eq!(selector.count(&filter).unwrap(), 3);
        assert_eq!(
            selector.resolve(&filter, PageRequest::new(1, 5)).unwrap(),
            vec!["b", "c"]
        );
    }
}
