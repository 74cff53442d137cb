//! Rollout engine: lifecycle operations and the scheduler tick.
//!
//! The engine owns the rollout state machine:
//!
//! ```text
//! CREATING ──► READY ──► RUNNING ⇄ PAUSED
//!    │                      │
//!    ▼                      ▼
//! ERROR_CREATING         FINISHED
//! ```
//!
//! Every transition is committed through the store's optimistic version
//! check, so overlapping ticks or a tick racing an operator command apply
//! each change at most once. A tick that loses such a race skips the
//! rollout and re-evaluates it from current state on the next tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::{FilterError, FleetConfig, TargetFilter, like_matches};
use fleetgrid_state::{
    Action, ActionBatch, ActionId, ActionStatus, ActionStatusEntry, ActionType,
    DistributionRef, GroupConditions, GroupId, GroupStatus, NewGroup, NewRollout, Page,
    PageRequest, Rollout, RolloutGroup, RolloutId, RolloutStatus, StateError, StateStore,
    Target, Transition, UpdateType,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregate::{StatusAggregator, TotalTargetCountStatus};
use crate::cancellation::{Assignment, CancellationCoordinator, Planned};
use crate::clock::{Clock, SystemClock};
use crate::error::{RolloutError, RolloutResult};
use crate::evaluator::GroupProgressionEvaluator;
use crate::events::{EventSink, PauseReason, RolloutEvent, TracingSink};
use crate::feedback::DeviceFeedback;
use crate::partition::{GroupPartitioner, group_sizes};
use crate::selector::{AssignmentRecorder, TargetSelector};

/// Upper bound on the number of groups of one rollout.
pub const MAX_GROUPS: u32 = 500;

/// Batch sizes and retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub partition_batch_size: usize,
    pub partition_max_attempts: u32,
    pub activation_batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            partition_batch_size: 500,
            partition_max_attempts: 3,
            activation_batch_size: 500,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            partition_batch_size: config.partition.batch_size,
            partition_max_attempts: config.partition.max_attempts,
            activation_batch_size: config.scheduler.activation_batch_size,
        }
    }
}

/// Everything needed to create a rollout apart from its group layout.
#[derive(Debug, Clone)]
pub struct CreateRollout {
    pub name: String,
    pub description: String,
    pub target_filter: String,
    pub distribution: DistributionRef,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    /// Per-group condition overrides keyed by 1-based ordinal.
    pub group_conditions: BTreeMap<u32, GroupConditions>,
}

impl CreateRollout {
    pub fn new(name: &str, target_filter: &str, distribution: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            target_filter: target_filter.to_string(),
            distribution: distribution.to_string(),
            action_type: ActionType::Forced,
            update_type: UpdateType::Combined,
            group_conditions: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
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

    pub fn with_group_conditions(mut self, ordinal: u32, conditions: GroupConditions) -> Self {
        self.group_conditions.insert(ordinal, conditions);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutDetails {
    pub rollout: Rollout,
    pub status: TotalTargetCountStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupDetails {
    pub group: RolloutGroup,
    pub status: TotalTargetCountStatus,
}

/// What one call to [`RolloutEngine::evaluate_running`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    /// CREATING rollouts that reached READY.
    pub partitioned: usize,
    pub activated_groups: usize,
    pub finished_groups: usize,
    pub errored_groups: usize,
    pub finished_rollouts: usize,
    pub paused_rollouts: usize,
    /// Parked assignments released.
    pub promoted: usize,
    /// Rollouts skipped after losing a version race.
    pub conflicts: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct RolloutEngine {
    store: StateStore,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    selector: Arc<dyn TargetSelector>,
    recorder: Arc<dyn AssignmentRecorder>,
    settings: EngineSettings,
}

impl RolloutEngine {
    /// Engine backed by `store` for selection and assignment bookkeeping.
    pub fn new(store: StateStore) -> Self {
        Self {
            selector: Arc::new(store.clone()),
            recorder: Arc::new(store.clone()),
            store,
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingSink),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn TargetSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn AssignmentRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn aggregator(&self) -> StatusAggregator {
        StatusAggregator::new(self.store.clone())
    }

    pub fn coordinator(&self) -> CancellationCoordinator {
        CancellationCoordinator::new(self.store.clone(), self.clock.clone(), self.recorder.clone())
    }

    pub fn feedback(&self) -> DeviceFeedback {
        DeviceFeedback::new(
            self.store.clone(),
            self.clock.clone(),
            self.coordinator(),
            self.recorder.clone(),
        )
    }

    pub fn partitioner(&self) -> GroupPartitioner {
        GroupPartitioner::new(
            self.store.clone(),
            self.selector.clone(),
            self.clock.clone(),
            self.events.clone(),
        )
        .with_limits(
            self.settings.partition_batch_size,
            self.settings.partition_max_attempts,
        )
    }

    fn evaluator(&self) -> GroupProgressionEvaluator {
        GroupProgressionEvaluator::new(self.aggregator())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Create a rollout over the targets matching its filter.
    ///
    /// Returns the rollout READY, or still CREATING if a partition batch
    /// failed transiently (the scheduler tick resumes it).
    pub fn create(
        &self,
        request: CreateRollout,
        group_count: u32,
        conditions: GroupConditions,
    ) -> RolloutResult<Rollout> {
        validate(&request, group_count, &conditions)?;
        let filter = TargetFilter::parse(&request.target_filter).map_err(|e| match e {
            FilterError::Empty => RolloutError::EmptyTargetFilter(request.target_filter.clone()),
            other => RolloutError::Filter(other),
        })?;
        let total = self.selector.count(&filter)?;
        if total == 0 {
            return Err(RolloutError::EmptyTargetFilter(request.target_filter));
        }

        let now = self.clock.now_millis();
        let name = request.name.clone();
        let rollout = self
            .store
            .insert_rollout(NewRollout {
                name: request.name,
                description: request.description,
                target_filter: request.target_filter,
                distribution: request.distribution,
                action_type: request.action_type,
                update_type: request.update_type,
                conditions,
                total_targets: total,
                created_at: now,
            })
            .map_err(|e| match e {
                StateError::Duplicate(_) => {
                    RolloutError::Validation(format!("rollout name `{name}` is already in use"))
                }
                other => RolloutError::State(other),
            })?;
        info!(
            rollout = rollout.id,
            name = %rollout.name,
            targets = total,
            groups = group_count,
            "rollout created"
        );

        let new_groups: Vec<NewGroup> = group_sizes(total, group_count)
            .into_iter()
            .zip(1..)
            .map(|(target_count, ordinal)| NewGroup {
                ordinal,
                target_count,
                conditions: request.group_conditions.get(&ordinal).cloned(),
            })
            .collect();
        let partitioner = self.partitioner();
        let (rollout, groups) =
            match self
                .store
                .create_groups(rollout.id, rollout.version, &new_groups, now)
            {
                Ok(created) => created,
                Err(e) => return Err(partitioner.fail(rollout, format!("creating groups: {e}"))),
            };

        let total_groups = groups.len() as u32;
        for (created_groups, group) in (1..).zip(&groups) {
            self.events.emit(RolloutEvent::GroupCreated {
                rollout_id: rollout.id,
                group_id: group.id,
                total_groups,
                created_groups,
            });
        }
        partitioner.run(rollout)
    }

    /// Start a READY rollout: group 1 becomes RUNNING and gets its actions.
    pub fn start(&self, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        let rollout = self.rollout(rollout_id)?;
        match rollout.status {
            RolloutStatus::Ready => {}
            RolloutStatus::Creating => return Err(RolloutError::CreationInProgress(rollout_id)),
            from => {
                return Err(RolloutError::InvalidStateTransition {
                    rollout: rollout_id,
                    from,
                    to: RolloutStatus::Running,
                });
            }
        }
        let groups = self.store.list_groups(rollout_id)?;
        let Some(first) = groups.first() else {
            return Err(RolloutError::Validation(format!(
                "rollout {rollout_id} has no groups"
            )));
        };

        let now = self.clock.now_millis();
        let running = Rollout {
            status: RolloutStatus::Running,
            updated_at: now,
            ..rollout
        };
        let active = RolloutGroup {
            status: GroupStatus::Running,
            updated_at: now,
            ..first.clone()
        };
        let committed = self
            .store
            .commit_transition(
                Transition::rollout(running)
                    .with_group(active)
                    .marking_started(),
            )
            .map_err(RolloutError::from_store)?;
        let (Some(rollout), Some(group)) = (committed.rollout, committed.groups.into_iter().next())
        else {
            return Err(RolloutError::ConcurrentModification(format!(
                "start of rollout {rollout_id} not committed"
            )));
        };

        info!(rollout = rollout.id, name = %rollout.name, "rollout started");
        self.events.emit(RolloutEvent::RolloutStarted {
            rollout_id: rollout.id,
        });
        self.events.emit(RolloutEvent::GroupActivated {
            rollout_id: rollout.id,
            group_id: group.id,
            ordinal: group.ordinal,
        });
        if let Err(e) =
            self.materialize_group(&rollout, &group, self.settings.activation_batch_size)
        {
            warn!(
                rollout = rollout.id,
                group = group.id,
                error = %e,
                "first group partly materialized, next tick continues"
            );
        }
        Ok(rollout)
    }

    /// Stop progression. Already issued actions are left alone.
    pub fn pause(&self, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        let rollout = self.set_status(rollout_id, RolloutStatus::Running, RolloutStatus::Paused)?;
        info!(rollout = rollout_id, "rollout paused");
        self.events.emit(RolloutEvent::RolloutPaused {
            rollout_id,
            reason: PauseReason::Operator,
        });
        Ok(rollout)
    }

    pub fn resume(&self, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        let rollout = self.set_status(rollout_id, RolloutStatus::Paused, RolloutStatus::Running)?;
        info!(rollout = rollout_id, "rollout resumed");
        self.events
            .emit(RolloutEvent::RolloutResumed { rollout_id });
        Ok(rollout)
    }

    fn set_status(
        &self,
        rollout_id: RolloutId,
        from: RolloutStatus,
        to: RolloutStatus,
    ) -> RolloutResult<Rollout> {
        let mut rollout = self.rollout(rollout_id)?;
        if rollout.status != from {
            return Err(RolloutError::InvalidStateTransition {
                rollout: rollout_id,
                from: rollout.status,
                to,
            });
        }
        rollout.status = to;
        rollout.updated_at = self.clock.now_millis();
        self.store
            .commit_transition(Transition::rollout(rollout))
            .map_err(RolloutError::from_store)?
            .rollout
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))
    }

    // ── Scheduler tick ─────────────────────────────────────────────

    /// Evaluate every RUNNING rollout and resume every CREATING one.
    ///
    /// `batch_size` bounds the number of actions created per commit when a
    /// group is activated. Per-rollout failures are logged and counted,
    /// never propagated, so one bad rollout cannot stall the others.
    pub fn evaluate_running(&self, batch_size: usize) -> RolloutResult<TickReport> {
        let mut report = TickReport::default();
        match self.coordinator().promote_released() {
            Ok(promoted) => report.promoted = promoted,
            Err(e) => {
                report.failures += 1;
                error!(error = %e, "releasing parked assignments failed");
            }
        }

        for rollout in self.store.list_rollouts()? {
            let rollout_id = rollout.id;
            let result = match rollout.status {
                RolloutStatus::Creating => self.resume_creation(rollout, &mut report),
                RolloutStatus::Running => self.evaluate_rollout(rollout, batch_size, &mut report),
                _ => continue,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    report.conflicts += 1;
                    debug!(rollout = rollout_id, error = %e, "stale evaluation skipped");
                }
                Err(e) => {
                    report.failures += 1;
                    error!(rollout = rollout_id, error = %e, "rollout evaluation failed");
                }
            }
        }

        if report != TickReport::default() {
            debug!(?report, "tick complete");
        }
        Ok(report)
    }

    fn resume_creation(&self, rollout: Rollout, report: &mut TickReport) -> RolloutResult<()> {
        let rollout = self.partitioner().run(rollout)?;
        if rollout.status == RolloutStatus::Ready {
            report.partitioned += 1;
        }
        Ok(())
    }

    fn evaluate_rollout(
        &self,
        rollout: Rollout,
        batch_size: usize,
        report: &mut TickReport,
    ) -> RolloutResult<()> {
        report.evaluated += 1;
        for group in self.store.list_groups(rollout.id)? {
            if group.status == GroupStatus::Running && !group.actions_materialized {
                self.materialize_group(&rollout, &group, batch_size)?;
            }
        }

        let groups = self.store.list_groups(rollout.id)?;
        let evaluation = self
            .evaluator()
            .evaluate(&rollout, &groups, self.clock.now_millis())?;
        if evaluation.is_hold() {
            return Ok(());
        }
        let committed = self
            .store
            .commit_transition(evaluation.transition)
            .map_err(RolloutError::from_store)?;
        for event in evaluation.events {
            self.events.emit(event);
        }
        report.finished_groups += evaluation.finished_groups;
        report.errored_groups += evaluation.errored_groups;
        report.activated_groups += evaluation.activated.len();

        let Some(rollout) = committed.rollout else {
            return Ok(());
        };
        match rollout.status {
            RolloutStatus::Finished => {
                report.finished_rollouts += 1;
                info!(rollout = rollout.id, name = %rollout.name, "rollout finished");
            }
            RolloutStatus::Paused => {
                report.paused_rollouts += 1;
                warn!(rollout = rollout.id, name = %rollout.name, "rollout paused by group error");
            }
            _ => {}
        }
        for group in committed
            .groups
            .iter()
            .filter(|g| evaluation.activated.contains(&g.id))
        {
            info!(rollout = rollout.id, group = group.id, ordinal = group.ordinal, "group activated");
            self.materialize_group(&rollout, group, batch_size)?;
        }
        Ok(())
    }

    /// Create actions for the unassigned members of a running group.
    ///
    /// Each chunk of at most `batch_size` members is one commit. Members
    /// whose target still has an active action elsewhere go through the
    /// cancellation coordinator and may end up parked. Members taken over
    /// after the rollout started, or already on its distribution, get no
    /// action.
    fn materialize_group(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        batch_size: usize,
    ) -> RolloutResult<usize> {
        let coordinator = self.coordinator();
        let batch_size = batch_size.max(1);
        let mut created = 0;
        let mut skipped = 0;
        let mut superseded = 0;
        loop {
            let members = self.store.unassigned_members(group.id, batch_size)?;
            if members.is_empty() {
                break;
            }
            let now = self.clock.now_millis();
            let mut batch = ActionBatch::default();
            for target_id in members {
                let assignment = Assignment {
                    target_id,
                    distribution: rollout.distribution.clone(),
                    action_type: rollout.action_type,
                    update_type: rollout.update_type,
                    rollout_id: Some(rollout.id),
                    group_id: Some(group.id),
                    force: false,
                };
                match coordinator.plan_member(&mut batch, assignment, rollout.start_watermark, now)? {
                    Planned::Skip => skipped += 1,
                    Planned::Yield { .. } => superseded += 1,
                    _ => {}
                }
            }
            let parked = batch.park.len();
            let commit = self
                .store
                .commit_actions(batch)
                .map_err(RolloutError::from_store)?;
            coordinator.settle(&commit);
            created += commit.created.len();
            debug!(
                rollout = rollout.id,
                group = group.id,
                created = commit.created.len(),
                parked,
                "activation chunk committed"
            );
        }

        let mut current = self
            .store
            .get_group(group.id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout group {}", group.id)))?;
        if !current.actions_materialized {
            current.actions_materialized = true;
            current.updated_at = self.clock.now_millis();
            let flagged = self.store.commit_transition(Transition {
                groups: vec![current],
                ..Transition::default()
            });
            match flagged {
                Ok(_) => info!(
                    rollout = rollout.id,
                    group = group.id,
                    created,
                    skipped,
                    superseded,
                    "group actions materialized"
                ),
                Err(e) if e.is_conflict() => debug!(group = group.id, "materialized flag already moved"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn rollout(&self, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        self.store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))
    }

    pub fn find_rollout_by_name(&self, name: &str) -> RolloutResult<Option<Rollout>> {
        Ok(self.store.find_rollout_by_name(name)?)
    }

    /// Rollouts whose name matches a `%`-wildcard pattern, in creation order.
    pub fn list_rollouts(
        &self,
        name_like: Option<&str>,
        page: PageRequest,
    ) -> RolloutResult<Page<Rollout>> {
        let matching: Vec<Rollout> = self
            .store
            .list_rollouts()?
            .into_iter()
            .filter(|r| name_like.is_none_or(|pattern| like_matches(pattern, &r.name)))
            .collect();
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit)
            .collect();
        Ok(Page { items, total })
    }

    pub fn count_rollouts(&self, name_like: Option<&str>) -> RolloutResult<u64> {
        Ok(self.list_rollouts(name_like, PageRequest::first(0))?.total)
    }

    pub fn rollout_details(&self, rollout_id: RolloutId) -> RolloutResult<RolloutDetails> {
        let rollout = self.rollout(rollout_id)?;
        let status = self.aggregator().rollout_status(&rollout)?;
        Ok(RolloutDetails { rollout, status })
    }

    pub fn list_rollout_details(
        &self,
        name_like: Option<&str>,
        page: PageRequest,
    ) -> RolloutResult<Page<RolloutDetails>> {
        let rollouts = self.list_rollouts(name_like, page)?;
        let aggregator = self.aggregator();
        let items = rollouts
            .items
            .into_iter()
            .map(|rollout| {
                let status = aggregator.rollout_status(&rollout)?;
                Ok(RolloutDetails { rollout, status })
            })
            .collect::<RolloutResult<Vec<_>>>()?;
        Ok(Page {
            items,
            total: rollouts.total,
        })
    }

    /// Groups of a rollout in execution order.
    pub fn groups(&self, rollout_id: RolloutId) -> RolloutResult<Vec<RolloutGroup>> {
        self.rollout(rollout_id)?;
        Ok(self.store.list_groups(rollout_id)?)
    }

    pub fn group(&self, group_id: GroupId) -> RolloutResult<RolloutGroup> {
        self.store
            .get_group(group_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout group {group_id}")))
    }

    pub fn group_details(&self, group_id: GroupId) -> RolloutResult<GroupDetails> {
        let group = self.group(group_id)?;
        let status = self.aggregator().group_status(&group)?;
        Ok(GroupDetails { group, status })
    }

    /// Targets of a group, optionally narrowed by a filter.
    pub fn group_targets(
        &self,
        group_id: GroupId,
        filter: Option<&TargetFilter>,
        page: PageRequest,
    ) -> RolloutResult<Page<Target>> {
        let group = self.group(group_id)?;
        let members = self
            .store
            .list_group_members(group.id, PageRequest::first(usize::MAX))?;
        let mut matching = Vec::new();
        for member in members.items {
            if let Some(target) = self.store.get_target(&member.target_id)?
                && filter.is_none_or(|f| f.matches(&target))
            {
                matching.push(target);
            }
        }
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit)
            .collect();
        Ok(Page { items, total })
    }

    pub fn finished_percent(&self, group_id: GroupId) -> RolloutResult<u8> {
        Ok(self.group_details(group_id)?.status.finished_percent())
    }

    /// Actions created by a rollout, optionally restricted to one status.
    pub fn rollout_actions(
        &self,
        rollout_id: RolloutId,
        status: Option<ActionStatus>,
        page: PageRequest,
    ) -> RolloutResult<Page<Action>> {
        let rollout = self.rollout(rollout_id)?;
        Ok(self
            .store
            .list_group_actions(&rollout.group_ids, status, page)?)
    }

    /// Status history of an action in insertion order.
    pub fn action_history(&self, action_id: ActionId) -> RolloutResult<Vec<ActionStatusEntry>> {
        if self.store.get_action(action_id)?.is_none() {
            return Err(RolloutError::NotFound(format!("action {action_id}")));
        }
        Ok(self.store.action_history(action_id)?)
    }
}

fn validate(
    request: &CreateRollout,
    group_count: u32,
    conditions: &GroupConditions,
) -> RolloutResult<()> {
    if request.name.trim().is_empty() {
        return Err(RolloutError::Validation("rollout name must not be empty".into()));
    }
    if request.distribution.trim().is_empty() {
        return Err(RolloutError::Validation(
            "rollout distribution must not be empty".into(),
        ));
    }
    if !(1..=MAX_GROUPS).contains(&group_count) {
        return Err(RolloutError::Validation(format!(
            "group count must be within 1..={MAX_GROUPS}, got {group_count}"
        )));
    }
    check_thresholds("default conditions", conditions)?;
    for (ordinal, overrides) in &request.group_conditions {
        if *ordinal == 0 || *ordinal > group_count {
            return Err(RolloutError::Validation(format!(
                "conditions given for group {ordinal}, but the rollout has {group_count} groups"
            )));
        }
        check_thresholds(&format!("group {ordinal} conditions"), overrides)?;
    }
    Ok(())
}

fn check_thresholds(scope: &str, conditions: &GroupConditions) -> RolloutResult<()> {
    if conditions.success_threshold > 100 || conditions.error_threshold > 100 {
        return Err(RolloutError::Validation(format!(
            "{scope}: thresholds must be within 0..=100"
        )));
    }
    Ok(())
}
