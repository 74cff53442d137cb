//! Cancellation coordinator: hands a target over to a new assignment.
//!
//! A target carries at most one active action. When a new assignment
//! arrives while one is active, the old action is moved toward CANCELED:
//!
//! - still SCHEDULED (never picked up) or `force` requested: the old action
//!   gets CANCELING and CANCELED entries and the new action is created in
//!   the same commit;
//! - otherwise: the old action goes to CANCELING and the assignment is
//!   parked until the old action reaches a terminal status, at which point
//!   [`CancellationCoordinator::promote`] creates it.
//!
//! Rollout groups are activated one after the other, so a member may meet an
//! assignment made after its rollout started. That assignment wins and the
//! member's slot is closed as superseded. A member already running the
//! rollout's distribution is skipped.
//!
//! Nothing here waits for a device.

use std::sync::Arc;

use fleetgrid_state::{
    Action, ActionBatch, ActionCommit, ActionId, ActionStatus, ActionType, DistributionRef,
    GroupId, MemberSlot, NewAction, PendingAssignment, RolloutId, StateError, StateStore,
    StatusUpdate, TargetId, TargetUpdateStatus, UpdateType,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{RolloutError, RolloutResult};
use crate::selector::AssignmentRecorder;

/// Prefix of status messages generated by the server rather than a device.
pub const SERVER_MESSAGE_PREFIX: &str = "Update Server: ";

/// A request to move a target to a distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target_id: TargetId,
    pub distribution: DistributionRef,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    /// Cancel the previous action without waiting for the device.
    pub force: bool,
}

impl Assignment {
    /// A direct assignment outside of any rollout.
    pub fn direct(target_id: &str, distribution: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            distribution: distribution.to_string(),
            action_type: ActionType::Soft,
            update_type: UpdateType::Combined,
            rollout_id: None,
            group_id: None,
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_action_type(mut self, action_type: ActionType) -> Self {
        self.action_type = action_type;
        self
    }

    pub fn with_update_type(mut self, update_type: UpdateType) -> Self {
        self.update_type = update_type;
        self
    }

    fn into_new_action(self, now: u64) -> NewAction {
        let message = match self.rollout_id {
            Some(rollout) => format!("{SERVER_MESSAGE_PREFIX}assigned by rollout {rollout}"),
            None => format!("{SERVER_MESSAGE_PREFIX}assigned directly"),
        };
        NewAction {
            action_type: if self.force {
                ActionType::Forced
            } else {
                self.action_type
            },
            target_id: self.target_id,
            rollout_id: self.rollout_id,
            group_id: self.group_id,
            distribution: self.distribution,
            update_type: self.update_type,
            created_at: now,
            message,
        }
    }

    fn into_pending(self, superseded_action: ActionId, now: u64) -> PendingAssignment {
        PendingAssignment {
            target_id: self.target_id,
            distribution: self.distribution,
            action_type: self.action_type,
            update_type: self.update_type,
            rollout_id: self.rollout_id,
            group_id: self.group_id,
            superseded_action,
            requested_at: now,
            ticket: 0,
        }
    }
}

/// What [`CancellationCoordinator::supersede`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum SupersedeOutcome {
    /// The target had no active action.
    Assigned(Action),
    /// The previous action had not been picked up and was cancelled outright.
    Replaced { canceled: ActionId, action: Action },
    /// Force requested: previous action cancelled, new action tagged FORCED.
    ForceAssigned { canceled: ActionId, action: Action },
    /// The previous action is CANCELING; the assignment waits for it.
    Pending { canceling: ActionId },
}

/// How one assignment was folded into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Planned {
    Create,
    Replace { old: ActionId, forced: bool },
    Park { old: ActionId },
    /// Group member already on the distribution.
    Skip,
    /// Group member taken over by a newer action or parked assignment.
    Yield { newer: ActionId },
}

#[derive(Clone)]
pub struct CancellationCoordinator {
    store: StateStore,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn AssignmentRecorder>,
}

impl CancellationCoordinator {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn AssignmentRecorder>,
    ) -> Self {
        Self {
            store,
            clock,
            recorder,
        }
    }

    /// Assign a target, cancelling its active action if it has one.
    pub fn supersede(&self, assignment: Assignment) -> RolloutResult<SupersedeOutcome> {
        let now = self.clock.now_millis();
        let target_id = assignment.target_id.clone();
        let mut batch = ActionBatch::default();
        let planned = self.plan(&mut batch, assignment, now)?;
        let commit = self
            .store
            .commit_actions(batch)
            .map_err(RolloutError::from_store)?;
        self.settle(&commit);

        let created = commit.created.into_iter().next();
        let outcome = match (planned, created) {
            (Planned::Create, Some(action)) => SupersedeOutcome::Assigned(action),
            (Planned::Replace { old, forced: true }, Some(action)) => {
                SupersedeOutcome::ForceAssigned { canceled: old, action }
            }
            (Planned::Replace { old, forced: false }, Some(action)) => {
                SupersedeOutcome::Replaced { canceled: old, action }
            }
            (Planned::Park { old }, _) => SupersedeOutcome::Pending { canceling: old },
            _ => {
                return Err(RolloutError::ConcurrentModification(format!(
                    "no action created for target {target_id}"
                )));
            }
        };
        info!(target_id = %target_id, ?planned, "assignment superseded");
        Ok(outcome)
    }

    /// Fold one assignment into `batch`, reading the target's current action.
    ///
    /// The store re-checks everything on commit, so a plan made against
    /// stale reads fails instead of breaking the one-active-action rule.
    pub(crate) fn plan(
        &self,
        batch: &mut ActionBatch,
        assignment: Assignment,
        now: u64,
    ) -> RolloutResult<Planned> {
        let Some(old) = self.store.active_action(&assignment.target_id)? else {
            batch.creates.push(assignment.into_new_action(now));
            return Ok(Planned::Create);
        };

        let cancel_reason = format!(
            "{SERVER_MESSAGE_PREFIX}cancellation requested, superseded by {}",
            assignment.distribution
        );
        if assignment.force || old.status == ActionStatus::Scheduled {
            if old.status != ActionStatus::Canceling {
                batch
                    .updates
                    .push((old.id, StatusUpdate::new(ActionStatus::Canceling, now, cancel_reason)));
            }
            batch.updates.push((
                old.id,
                StatusUpdate::new(
                    ActionStatus::Canceled,
                    now,
                    format!("{SERVER_MESSAGE_PREFIX}canceled without device confirmation"),
                ),
            ));
            if let Some(parked) = self.store.pending_assignment(&assignment.target_id)? {
                batch.consume_pending.push(assignment.target_id.clone());
                if let Some(group_id) = parked.group_id {
                    batch
                        .marks
                        .push((group_id, parked.target_id, MemberSlot::Superseded));
                }
            }
            let forced = assignment.force;
            batch.creates.push(assignment.into_new_action(now));
            return Ok(Planned::Replace { old: old.id, forced });
        }

        if old.status != ActionStatus::Canceling {
            batch
                .updates
                .push((old.id, StatusUpdate::new(ActionStatus::Canceling, now, cancel_reason)));
        }
        batch.park.push(assignment.into_pending(old.id, now));
        Ok(Planned::Park { old: old.id })
    }

    /// Fold a rollout group member into `batch`.
    ///
    /// `watermark` is the rollout's start watermark. Anything the target got
    /// after it is newer than the rollout and is left alone.
    pub(crate) fn plan_member(
        &self,
        batch: &mut ActionBatch,
        assignment: Assignment,
        watermark: Option<ActionId>,
        now: u64,
    ) -> RolloutResult<Planned> {
        let Some(group_id) = assignment.group_id else {
            return self.plan(batch, assignment, now);
        };
        if let Some(watermark) = watermark
            && let Some(newer) = self.newer_than(&assignment.target_id, watermark)?
        {
            debug!(
                target_id = %assignment.target_id,
                group = group_id,
                newer,
                "member superseded by a later assignment"
            );
            batch
                .marks
                .push((group_id, assignment.target_id, MemberSlot::Superseded));
            return Ok(Planned::Yield { newer });
        }
        if let Some(target) = self.store.get_target(&assignment.target_id)?
            && target.update_status == TargetUpdateStatus::InSync
            && target.installed_distribution.as_deref() == Some(assignment.distribution.as_str())
        {
            batch
                .marks
                .push((group_id, assignment.target_id, MemberSlot::Skipped));
            return Ok(Planned::Skip);
        }
        self.plan(batch, assignment, now)
    }

    /// Newest action or parked assignment of a target numbered above `watermark`.
    fn newer_than(&self, target_id: &str, watermark: ActionId) -> RolloutResult<Option<ActionId>> {
        let latest = self.store.latest_action_id(target_id)?;
        let parked = self
            .store
            .pending_assignment(target_id)?
            .map(|pending| pending.ticket);
        Ok(latest.into_iter().chain(parked).filter(|id| *id > watermark).max())
    }

    /// Create the target's parked assignment if its previous action closed.
    pub fn promote(&self, target_id: &str) -> RolloutResult<Option<Action>> {
        let Some(pending) = self.store.pending_assignment(target_id)? else {
            return Ok(None);
        };
        if self.store.active_action(target_id)?.is_some() {
            return Ok(None);
        }

        let batch = ActionBatch {
            consume_pending: vec![target_id.to_string()],
            creates: vec![pending.into_new_action(self.clock.now_millis())],
            ..Default::default()
        };
        match self.store.commit_actions(batch) {
            Ok(commit) => {
                self.settle(&commit);
                let action = commit.created.into_iter().next();
                if let Some(action) = &action {
                    info!(target_id = %target_id, action = action.id, "parked assignment released");
                }
                Ok(action)
            }
            Err(e) if e.is_conflict() || matches!(e, StateError::NotFound(_)) => {
                debug!(target_id = %target_id, error = %e, "parked assignment already handled");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Promote every parked assignment whose previous action has closed.
    pub fn promote_released(&self) -> RolloutResult<usize> {
        let mut promoted = 0;
        for pending in self.store.list_pending_assignments()? {
            if self.promote(&pending.target_id)?.is_some() {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Report a committed batch to the assignment recorder.
    pub(crate) fn settle(&self, commit: &ActionCommit) {
        for (action, entry) in &commit.updated {
            if entry.status.is_terminal()
                && let Err(e) = self.recorder.closed(action)
            {
                warn!(action = action.id, error = %e, "assignment recorder failed on close");
            }
        }
        for action in &commit.created {
            if let Err(e) = self.recorder.assigned(action) {
                warn!(action = action.id, error = %e, "assignment recorder failed on assign");
            }
        }
    }
}
