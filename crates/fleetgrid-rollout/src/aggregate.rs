//! Status aggregation: per-category target counts for a rollout or group.
//!
//! Counts come from one grouped pass over the store's group/status index,
//! never from loading individual actions. Members taken over by a newer
//! assignment before they got an action count as
//! [`TargetCountCategory::Cancelled`]; other targets without an action in
//! scope are reported as [`TargetCountCategory::NotStarted`].

use std::collections::BTreeMap;

use fleetgrid_state::{ActionStatus, GroupId, Rollout, RolloutGroup, RolloutId, StateStore};
use serde::Serialize;

use crate::error::{RolloutError, RolloutResult};

/// Category a target is counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetCountCategory {
    #[serde(rename = "NOTSTARTED")]
    NotStarted,
    Scheduled,
    Running,
    Finished,
    Error,
    Cancelled,
    Warning,
}

impl TargetCountCategory {
    pub const ALL: [TargetCountCategory; 7] = [
        Self::NotStarted,
        Self::Scheduled,
        Self::Running,
        Self::Finished,
        Self::Error,
        Self::Cancelled,
        Self::Warning,
    ];
}

impl From<ActionStatus> for TargetCountCategory {
    fn from(status: ActionStatus) -> Self {
        match status {
            ActionStatus::Scheduled => Self::Scheduled,
            ActionStatus::Running
            | ActionStatus::Download
            | ActionStatus::Downloaded
            | ActionStatus::Retrieved
            | ActionStatus::Start
            | ActionStatus::Canceling => Self::Running,
            ActionStatus::Finished => Self::Finished,
            ActionStatus::Error => Self::Error,
            ActionStatus::Canceled => Self::Cancelled,
            ActionStatus::Warning => Self::Warning,
        }
    }
}

/// Derived per-category counts for one scope. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalTargetCountStatus {
    total_targets: u64,
    counts: BTreeMap<TargetCountCategory, u64>,
}

impl TotalTargetCountStatus {
    pub fn from_status_counts(total_targets: u64, by_status: &BTreeMap<ActionStatus, u64>) -> Self {
        let mut counts: BTreeMap<_, _> = TargetCountCategory::ALL.iter().map(|c| (*c, 0)).collect();
        let mut with_action = 0u64;
        for (status, count) in by_status {
            *counts.entry(TargetCountCategory::from(*status)).or_insert(0) += count;
            with_action += count;
        }
        counts.insert(
            TargetCountCategory::NotStarted,
            total_targets.saturating_sub(with_action),
        );
        Self {
            total_targets,
            counts,
        }
    }

    /// Move `superseded` members from NOTSTARTED to CANCELLED.
    pub fn with_superseded(mut self, superseded: u64) -> Self {
        let not_started = self.count(TargetCountCategory::NotStarted);
        let moved = superseded.min(not_started);
        self.counts
            .insert(TargetCountCategory::NotStarted, not_started - moved);
        *self
            .counts
            .entry(TargetCountCategory::Cancelled)
            .or_insert(0) += moved;
        self
    }

    pub fn total_targets(&self) -> u64 {
        self.total_targets
    }

    pub fn count(&self, category: TargetCountCategory) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    /// `floor(100 * count / total)`; zero for an empty scope.
    pub fn percent(&self, category: TargetCountCategory) -> u8 {
        if self.total_targets == 0 {
            return 0;
        }
        (self.count(category) * 100 / self.total_targets) as u8
    }

    pub fn finished_percent(&self) -> u8 {
        self.percent(TargetCountCategory::Finished)
    }

    pub fn error_percent(&self) -> u8 {
        self.percent(TargetCountCategory::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetCountCategory, u64)> + '_ {
        self.counts.iter().map(|(c, n)| (*c, *n))
    }
}

/// What to aggregate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateScope {
    Rollout(RolloutId),
    Group(GroupId),
}

#[derive(Clone)]
pub struct StatusAggregator {
    store: StateStore,
}

impl StatusAggregator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn aggregate(&self, scope: AggregateScope) -> RolloutResult<TotalTargetCountStatus> {
        match scope {
            AggregateScope::Rollout(id) => {
                let rollout = self
                    .store
                    .get_rollout(id)?
                    .ok_or_else(|| RolloutError::NotFound(format!("rollout {id}")))?;
                self.rollout_status(&rollout)
            }
            AggregateScope::Group(id) => {
                let group = self
                    .store
                    .get_group(id)?
                    .ok_or_else(|| RolloutError::NotFound(format!("rollout group {id}")))?;
                self.group_status(&group)
            }
        }
    }

    pub fn rollout_status(&self, rollout: &Rollout) -> RolloutResult<TotalTargetCountStatus> {
        let by_status = self.store.count_actions_by_status(&rollout.group_ids)?;
        let superseded = self.store.count_superseded_members(&rollout.group_ids)?;
        Ok(
            TotalTargetCountStatus::from_status_counts(rollout.total_targets, &by_status)
                .with_superseded(superseded),
        )
    }

    pub fn group_status(&self, group: &RolloutGroup) -> RolloutResult<TotalTargetCountStatus> {
        let by_status = self.store.count_actions_by_status(&[group.id])?;
        let superseded = self.store.count_superseded_members(&[group.id])?;
        Ok(
            TotalTargetCountStatus::from_status_counts(group.target_count, &by_status)
                .with_superseded(superseded),
        )
    }
}
