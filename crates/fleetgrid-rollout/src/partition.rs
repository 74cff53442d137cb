//! Group partitioner: places a rollout's target population into its groups.
//!
//! Group sizes are fixed up front by [`group_sizes`]. Membership is then
//! written in bounded batches, each one a single store transaction that
//! also advances the rollout's partition cursor under a version check. A
//! rollout stays CREATING until the cursor reaches its total, then becomes
//! READY.

use std::sync::Arc;

use fleet_core::TargetFilter;
use fleetgrid_state::{
    GroupId, PageRequest, Rollout, RolloutGroup, RolloutStatus, StateStore, Transition,
};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventSink, RolloutEvent};
use crate::selector::TargetSelector;

/// Sizes of `groups` groups over `total` targets.
///
/// Every size is `floor(total / groups)` or one more; the larger groups
/// are the trailing ones.
pub fn group_sizes(total: u64, groups: u32) -> Vec<u64> {
    if groups == 0 {
        return Vec::new();
    }
    let n = groups as u64;
    let base = total / n;
    let remainder = total % n;
    (0..n)
        .map(|i| base + u64::from(i >= n - remainder))
        .collect()
}

/// Group owning the target at `position` of the ordered population.
fn group_at(groups: &[RolloutGroup], position: u64) -> Option<GroupId> {
    let mut end = 0;
    groups.iter().find_map(|group| {
        end += group.target_count;
        (position < end).then_some(group.id)
    })
}

enum BatchError {
    /// Selector or store hiccup; the batch may be retried.
    Transient(String),
    /// Another writer advanced the rollout first.
    Conflict(String),
    /// The population no longer fits the planned groups.
    Fatal(String),
}

pub struct GroupPartitioner {
    store: StateStore,
    selector: Arc<dyn TargetSelector>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    batch_size: usize,
    max_attempts: u32,
}

impl GroupPartitioner {
    pub fn new(
        store: StateStore,
        selector: Arc<dyn TargetSelector>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            selector,
            clock,
            events,
            batch_size: 500,
            max_attempts: 3,
        }
    }

    pub fn with_limits(mut self, batch_size: usize, max_attempts: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Write membership batches until the rollout is READY.
    ///
    /// A transient batch failure is recorded against the rollout and the
    /// rollout is returned still CREATING, to be resumed by a later call.
    /// Exhausting the attempts, or finding fewer targets than planned,
    /// ends the rollout in ERROR_CREATING.
    pub fn run(&self, mut rollout: Rollout) -> RolloutResult<Rollout> {
        if rollout.status != RolloutStatus::Creating {
            return Ok(rollout);
        }
        let filter = TargetFilter::parse(&rollout.target_filter)?;
        let groups = self.store.list_groups(rollout.id)?;

        while rollout.status == RolloutStatus::Creating {
            match self.write_batch(&rollout, &filter, &groups) {
                Ok(next) => rollout = next,
                Err(BatchError::Conflict(reason)) => {
                    return Err(RolloutError::ConcurrentModification(reason));
                }
                Err(BatchError::Fatal(reason)) => return Err(self.fail(rollout, reason)),
                Err(BatchError::Transient(reason)) => return self.record_attempt(rollout, reason),
            }
        }

        info!(
            rollout = rollout.id,
            targets = rollout.total_targets,
            groups = groups.len(),
            "rollout ready"
        );
        self.events.emit(RolloutEvent::RolloutReady {
            rollout_id: rollout.id,
            total_targets: rollout.total_targets,
        });
        Ok(rollout)
    }

    fn write_batch(
        &self,
        rollout: &Rollout,
        filter: &TargetFilter,
        groups: &[RolloutGroup],
    ) -> Result<Rollout, BatchError> {
        let offset = rollout.partitioned_targets;
        let wanted = (rollout.total_targets - offset).min(self.batch_size as u64) as usize;
        let ids = self
            .selector
            .resolve(filter, PageRequest::new(offset, wanted))
            .map_err(|e| BatchError::Transient(e.to_string()))?;
        if ids.len() < wanted {
            return Err(BatchError::Fatal(format!(
                "population shrank: expected {} targets, found {}",
                rollout.total_targets,
                offset + ids.len() as u64
            )));
        }

        let mut members = Vec::with_capacity(ids.len());
        for (i, target_id) in ids.into_iter().enumerate() {
            let position = offset + i as u64;
            let group_id = group_at(groups, position).ok_or_else(|| {
                BatchError::Fatal(format!("no group planned for position {position}"))
            })?;
            members.push((group_id, target_id));
        }

        let now = self.clock.now_millis();
        self.store
            .add_group_members(rollout.id, rollout.version, &members, now)
            .map_err(|e| {
                if e.is_conflict() {
                    BatchError::Conflict(e.to_string())
                } else {
                    BatchError::Transient(e.to_string())
                }
            })
            .inspect(|next| {
                debug!(
                    rollout = rollout.id,
                    placed = next.partitioned_targets,
                    total = next.total_targets,
                    "partition batch written"
                );
            })
    }

    fn record_attempt(&self, mut rollout: Rollout, reason: String) -> RolloutResult<Rollout> {
        rollout.partition_attempts += 1;
        if rollout.partition_attempts >= self.max_attempts {
            return Err(self.fail(
                rollout,
                format!("giving up after {} attempts: {reason}", self.max_attempts),
            ));
        }
        warn!(
            rollout = rollout.id,
            attempt = rollout.partition_attempts,
            max_attempts = self.max_attempts,
            %reason,
            "partition batch failed, will retry"
        );
        rollout.updated_at = self.clock.now_millis();
        let committed = self
            .store
            .commit_transition(Transition::rollout(rollout))
            .map_err(RolloutError::from_store)?;
        committed
            .rollout
            .ok_or_else(|| RolloutError::ConcurrentModification("rollout not committed".into()))
    }

    /// Move the rollout to ERROR_CREATING. Groups written so far are kept.
    pub(crate) fn fail(&self, mut rollout: Rollout, reason: String) -> RolloutError {
        let rollout_id = rollout.id;
        error!(rollout = rollout_id, %reason, "rollout creation failed");
        rollout.status = RolloutStatus::ErrorCreating;
        rollout.updated_at = self.clock.now_millis();
        if let Err(e) = self.store.commit_transition(Transition::rollout(rollout)) {
            error!(rollout = rollout_id, error = %e, "failed to record creation failure");
        }
        self.events.emit(RolloutEvent::CreationFailed {
            rollout_id,
            reason: reason.clone(),
        });
        RolloutError::PartitionFailure {
            rollout: rollout_id,
            reason,
        }
    }
}
