//! Group progression evaluator.
//!
//! Looks at the running groups of one running rollout and decides, from
//! each group's finished/error percentages, whether the group finishes,
//! errors, or keeps running. The result is an [`Evaluation`]: the records
//! to commit under a version check plus the events to emit once the commit
//! succeeded. The evaluator itself writes nothing.

use fleetgrid_state::{
    ErrorAction, GroupConditions, GroupId, GroupStatus, Rollout, RolloutGroup, RolloutStatus,
    SuccessAction, Transition,
};
use tracing::debug;

use crate::aggregate::{StatusAggregator, TotalTargetCountStatus};
use crate::error::RolloutResult;
use crate::events::{PauseReason, RolloutEvent};

/// Outcome for one running group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDecision {
    Error,
    Finish,
    Hold,
}

/// Apply the thresholds to a group's counts. Error wins over success.
pub fn decide(status: &TotalTargetCountStatus, conditions: &GroupConditions) -> GroupDecision {
    if status.total_targets() == 0 {
        return GroupDecision::Finish;
    }
    if status.error_percent() >= conditions.error_threshold {
        GroupDecision::Error
    } else if status.finished_percent() >= conditions.success_threshold {
        GroupDecision::Finish
    } else {
        GroupDecision::Hold
    }
}

/// Changes computed for one rollout in one tick.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub transition: Transition,
    /// Emitted only after `transition` commits.
    pub events: Vec<RolloutEvent>,
    /// Groups switched to RUNNING whose actions still need materializing.
    pub activated: Vec<GroupId>,
    pub finished_groups: usize,
    pub errored_groups: usize,
}

impl Evaluation {
    pub fn is_hold(&self) -> bool {
        self.transition.rollout.is_none() && self.transition.groups.is_empty()
    }
}

pub struct GroupProgressionEvaluator {
    aggregator: StatusAggregator,
}

impl GroupProgressionEvaluator {
    pub fn new(aggregator: StatusAggregator) -> Self {
        Self { aggregator }
    }

    /// Evaluate `rollout` with its `groups` in ordinal order.
    pub fn evaluate(
        &self,
        rollout: &Rollout,
        groups: &[RolloutGroup],
        now: u64,
    ) -> RolloutResult<Evaluation> {
        let mut evaluation = Evaluation::default();
        if rollout.status != RolloutStatus::Running {
            return Ok(evaluation);
        }

        let mut statuses: Vec<GroupStatus> = groups.iter().map(|g| g.status).collect();
        let mut next_rollout_status = RolloutStatus::Running;
        let running: Vec<usize> = (0..groups.len())
            .filter(|i| statuses[*i] == GroupStatus::Running)
            .collect();

        if running.is_empty() {
            // Resumed after an error pause: continue behind the last errored group.
            let after_error = statuses
                .iter()
                .rposition(|s| *s == GroupStatus::Error)
                .map_or(0, |i| i + 1);
            let next = next_scheduled(&statuses, after_error)
                .or_else(|| next_scheduled(&statuses, 0));
            if let Some(next) = next {
                statuses[next] = GroupStatus::Running;
                evaluation.activated.push(groups[next].id);
                evaluation.events.push(activated_event(&groups[next]));
            }
        }

        for index in running {
            let group = &groups[index];
            let counts = self.aggregator.group_status(group)?;
            let conditions = group.effective_conditions(rollout);
            let decision = decide(&counts, conditions);
            debug!(
                rollout = rollout.id,
                group = group.id,
                finished_pct = counts.finished_percent(),
                error_pct = counts.error_percent(),
                ?decision,
                "group evaluated"
            );

            match decision {
                GroupDecision::Hold => {}
                GroupDecision::Error => {
                    statuses[index] = GroupStatus::Error;
                    evaluation.errored_groups += 1;
                    evaluation.events.push(RolloutEvent::GroupErrored {
                        rollout_id: rollout.id,
                        group_id: group.id,
                        counts,
                    });
                    match conditions.error_action {
                        ErrorAction::Pause => {
                            next_rollout_status = RolloutStatus::Paused;
                            evaluation.events.push(RolloutEvent::RolloutPaused {
                                rollout_id: rollout.id,
                                reason: PauseReason::GroupError { group_id: group.id },
                            });
                        }
                    }
                    break;
                }
                GroupDecision::Finish => {
                    statuses[index] = GroupStatus::Finished;
                    evaluation.finished_groups += 1;
                    evaluation.events.push(RolloutEvent::GroupFinished {
                        rollout_id: rollout.id,
                        group_id: group.id,
                        counts,
                    });
                    match conditions.success_action {
                        SuccessAction::NextGroup => {
                            if let Some(next) = next_scheduled(&statuses, index + 1) {
                                statuses[next] = GroupStatus::Running;
                                evaluation.activated.push(groups[next].id);
                                evaluation.events.push(activated_event(&groups[next]));
                            }
                        }
                    }
                }
            }
        }

        let open = statuses
            .iter()
            .any(|s| matches!(s, GroupStatus::Scheduled | GroupStatus::Running));
        if next_rollout_status == RolloutStatus::Running && !open {
            next_rollout_status = RolloutStatus::Finished;
            evaluation.events.push(RolloutEvent::RolloutFinished {
                rollout_id: rollout.id,
                counts: self.aggregator.rollout_status(rollout)?,
            });
        }

        let changed: Vec<RolloutGroup> = groups
            .iter()
            .zip(&statuses)
            .filter(|(group, status)| group.status != **status)
            .map(|(group, status)| RolloutGroup {
                status: *status,
                updated_at: now,
                ..group.clone()
            })
            .collect();
        if changed.is_empty() && next_rollout_status == rollout.status {
            return Ok(Evaluation::default());
        }

        // The rollout is always part of the commit so that its version
        // serializes concurrent evaluations.
        let mut next = rollout.clone();
        if next.status != next_rollout_status {
            next.status = next_rollout_status;
            next.updated_at = now;
        }
        evaluation.transition = Transition {
            rollout: Some(next),
            groups: changed,
            ..Transition::default()
        };
        Ok(evaluation)
    }
}

fn next_scheduled(statuses: &[GroupStatus], from: usize) -> Option<usize> {
    (from..statuses.len()).find(|i| statuses[*i] == GroupStatus::Scheduled)
}

fn activated_event(group: &RolloutGroup) -> RolloutEvent {
    RolloutEvent::GroupActivated {
        rollout_id: group.rollout_id,
        group_id: group.id,
        ordinal: group.ordinal,
    }
}
