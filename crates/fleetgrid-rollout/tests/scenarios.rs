//! End-to-end rollout scenarios against an in-memory store.
//!
//! Each test drives the engine the way the daemon does: lifecycle calls,
//! device reports through the feedback API, and explicit scheduler ticks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_core::TargetFilter;
use fleetgrid_rollout::*;
use fleetgrid_state::*;

fn fleet(count: usize) -> RolloutEngine {
    let store = StateStore::open_in_memory().unwrap();
    for i in 0..count {
        let region = if i % 2 == 0 { "eu" } else { "us" };
        let mut target = Target::new(&format!("dev-{i:03}"), 1_000);
        target.attributes.insert("region".into(), region.into());
        store.put_target(&target).unwrap();
    }
    RolloutEngine::new(store).with_clock(Arc::new(ManualClock::new(10_000)))
}

fn create_started(engine: &RolloutEngine, name: &str, groups: u32, success: u8, error: u8) -> Rollout {
    let rollout = engine
        .create(
            CreateRollout::new(name, "id==dev-*", "ds-2.0"),
            groups,
            GroupConditions::thresholds(success, error),
        )
        .unwrap();
    assert_eq!(rollout.status, RolloutStatus::Ready);
    engine.start(rollout.id).unwrap()
}

fn group_actions(engine: &RolloutEngine, group: &RolloutGroup) -> Vec<Action> {
    engine
        .store()
        .list_group_actions(&[group.id], None, PageRequest::first(1_000))
        .unwrap()
        .items
}

fn close(engine: &RolloutEngine, action: &Action, result: ExecutionResult) {
    engine
        .feedback()
        .report_execution(action.id, DeviceExecution::Closed(result), vec![])
        .unwrap();
}

fn group_statuses(engine: &RolloutEngine, rollout_id: RolloutId) -> Vec<GroupStatus> {
    engine
        .groups(rollout_id)
        .unwrap()
        .iter()
        .map(|g| g.status)
        .collect()
}

#[test]
fn start_activates_only_the_first_group() {
    let engine = fleet(10);
    let rollout = create_started(&engine, "start", 5, 50, 80);
    let groups = engine.groups(rollout.id).unwrap();

    let first = group_actions(&engine, &groups[0]);
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|a| a.status == ActionStatus::Scheduled));
    for group in &groups[1..] {
        assert_eq!(group.status, GroupStatus::Scheduled);
        assert!(group_actions(&engine, group).is_empty());
    }

    let details = engine.rollout_details(rollout.id).unwrap();
    assert_eq!(details.status.count(TargetCountCategory::Scheduled), 2);
    assert_eq!(details.status.count(TargetCountCategory::NotStarted), 8);
}

#[test]
fn scenario_a_success_threshold_advances_to_next_group() {
    let engine = fleet(10);
    let rollout = create_started(&engine, "scenario-a", 5, 50, 80);
    let groups = engine.groups(rollout.id).unwrap();

    let first = group_actions(&engine, &groups[0]);
    close(&engine, &first[0], ExecutionResult::Success);
    assert_eq!(engine.finished_percent(groups[0].id).unwrap(), 50);

    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.finished_groups, 1);
    assert_eq!(report.activated_groups, 1);
    assert_eq!(
        group_statuses(&engine, rollout.id),
        vec![
            GroupStatus::Finished,
            GroupStatus::Running,
            GroupStatus::Scheduled,
            GroupStatus::Scheduled,
            GroupStatus::Scheduled
        ]
    );
    assert_eq!(group_actions(&engine, &groups[1]).len(), 2);

    let status = engine.rollout_details(rollout.id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::Finished), 1);
    assert_eq!(status.count(TargetCountCategory::Scheduled), 3);
    assert_eq!(status.count(TargetCountCategory::NotStarted), 6);
}

#[test]
fn scenario_b_error_threshold_pauses_the_rollout() {
    let engine = fleet(10);
    let rollout = create_started(&engine, "scenario-b", 2, 50, 20);
    let groups = engine.groups(rollout.id).unwrap();

    let first = group_actions(&engine, &groups[0]);
    assert_eq!(first.len(), 5);
    close(&engine, &first[0], ExecutionResult::Failure);
    close(&engine, &first[1], ExecutionResult::Failure);

    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.errored_groups, 1);
    assert_eq!(report.paused_rollouts, 1);
    assert_eq!(engine.rollout(rollout.id).unwrap().status, RolloutStatus::Paused);
    assert_eq!(
        group_statuses(&engine, rollout.id),
        vec![GroupStatus::Error, GroupStatus::Scheduled]
    );
    assert!(group_actions(&engine, &groups[1]).is_empty());

    // Paused rollouts are left alone by the tick.
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.evaluated, 0);
    assert!(group_actions(&engine, &groups[1]).is_empty());
}

#[test]
fn scenario_c_resume_continues_after_the_errored_group() {
    let engine = fleet(10);
    let rollout = create_started(&engine, "scenario-c", 2, 50, 20);
    let groups = engine.groups(rollout.id).unwrap();
    let first = group_actions(&engine, &groups[0]);
    close(&engine, &first[0], ExecutionResult::Failure);
    close(&engine, &first[1], ExecutionResult::Failure);
    engine.evaluate_running(100).unwrap();

    let resumed = engine.resume(rollout.id).unwrap();
    assert_eq!(resumed.status, RolloutStatus::Running);

    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.activated_groups, 1);
    assert_eq!(
        group_statuses(&engine, rollout.id),
        vec![GroupStatus::Error, GroupStatus::Running]
    );
    let second = group_actions(&engine, &groups[1]);
    assert_eq!(second.len(), 5);

    for action in &second[..3] {
        close(&engine, action, ExecutionResult::Success);
    }
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.finished_groups, 1);
    assert_eq!(report.finished_rollouts, 1);
    assert_eq!(engine.rollout(rollout.id).unwrap().status, RolloutStatus::Finished);
}

#[test]
fn scenario_d_direct_assignment_cancels_the_rollout_action() {
    let engine = fleet(4);
    let rollout = create_started(&engine, "scenario-d", 1, 100, 100);
    let group = engine.groups(rollout.id).unwrap().remove(0);
    let actions = group_actions(&engine, &group);
    let victim = actions
        .iter()
        .find(|a| a.target_id == "dev-000")
        .unwrap()
        .clone();
    engine
        .feedback()
        .register_retrieved(victim.id, "Target retrieved update action")
        .unwrap();

    let outcome = engine
        .coordinator()
        .supersede(Assignment::direct("dev-000", "ds-hotfix"))
        .unwrap();
    assert_eq!(outcome, SupersedeOutcome::Pending { canceling: victim.id });
    assert_eq!(
        engine.store().get_action(victim.id).unwrap().unwrap().status,
        ActionStatus::Canceling
    );
    let status = engine.group_details(group.id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::Running), 1);
    assert_eq!(status.count(TargetCountCategory::Scheduled), 3);

    let report = engine
        .feedback()
        .report_cancel_execution(
            victim.id,
            DeviceExecution::Closed(ExecutionResult::Success),
            vec![],
        )
        .unwrap();
    assert_eq!(report.action.status, ActionStatus::Canceled);
    let hotfix = report.promoted.unwrap();
    assert_eq!(hotfix.distribution, "ds-hotfix");
    assert_eq!(hotfix.rollout_id, None);

    let status = engine.group_details(group.id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::Cancelled), 1);
    assert_eq!(status.count(TargetCountCategory::Running), 0);

    let target = engine.store().get_target("dev-000").unwrap().unwrap();
    assert_eq!(target.assigned_distribution.as_deref(), Some("ds-hotfix"));
}

#[test]
fn scenario_e_all_groups_finished_finishes_the_rollout() {
    let engine = fleet(4);
    let rollout = create_started(&engine, "scenario-e", 2, 100, 100);
    let groups = engine.groups(rollout.id).unwrap();

    for action in group_actions(&engine, &groups[0]) {
        close(&engine, &action, ExecutionResult::Success);
    }
    engine.evaluate_running(100).unwrap();
    for action in group_actions(&engine, &groups[1]) {
        close(&engine, &action, ExecutionResult::Success);
    }
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.finished_rollouts, 1);

    let finished = engine.rollout_details(rollout.id).unwrap();
    assert_eq!(finished.rollout.status, RolloutStatus::Finished);
    assert_eq!(finished.status.finished_percent(), 100);

    // Further ticks change nothing.
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report, TickReport::default());
    let again = engine.rollout_details(rollout.id).unwrap();
    assert_eq!(again.rollout.version, finished.rollout.version);
    assert_eq!(again.status, finished.status);
    assert!(matches!(
        engine.pause(rollout.id),
        Err(RolloutError::InvalidStateTransition { .. })
    ));
}

#[test]
fn newer_rollout_keeps_targets_an_older_rollout_reaches_later() {
    let engine = fleet(15);
    let older = create_started(&engine, "older", 3, 60, 100);
    let older_groups = engine.groups(older.id).unwrap();
    for action in group_actions(&engine, &older_groups[0]) {
        close(&engine, &action, ExecutionResult::Success);
    }
    engine.evaluate_running(100).unwrap();

    let second = group_actions(&engine, &older_groups[1]);
    assert_eq!(second.len(), 5);
    for action in &second[..3] {
        close(&engine, action, ExecutionResult::Success);
    }
    for action in &second[3..] {
        engine
            .feedback()
            .register_retrieved(action.id, "Target retrieved update action")
            .unwrap();
    }

    let newer = engine
        .create(
            CreateRollout::new("newer", "id==dev-*", "ds-3.0"),
            1,
            GroupConditions::thresholds(100, 100),
        )
        .unwrap();
    let newer = engine.start(newer.id).unwrap();
    let newer_group = engine.groups(newer.id).unwrap().remove(0);
    let status = engine.rollout_details(newer.id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::Scheduled), 13);
    assert_eq!(status.count(TargetCountCategory::NotStarted), 2);
    for action in &second[3..] {
        assert_eq!(
            engine.store().get_action(action.id).unwrap().unwrap().status,
            ActionStatus::Canceling
        );
    }

    // The older rollout reaches its third group after the newer one started.
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.activated_groups, 1);
    assert_eq!(
        group_statuses(&engine, older.id),
        vec![GroupStatus::Finished, GroupStatus::Finished, GroupStatus::Running]
    );
    assert!(group_actions(&engine, &older_groups[2]).is_empty());
    let third = engine.group_details(older_groups[2].id).unwrap();
    assert!(third.group.actions_materialized);
    assert_eq!(third.status.count(TargetCountCategory::Cancelled), 5);

    let status = engine.rollout_details(newer.id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::Scheduled), 13);
    assert_eq!(status.count(TargetCountCategory::Cancelled), 0);

    // Confirmed cancellations release the parked assignments into the
    // newer rollout's group.
    for action in &second[3..] {
        let report = engine
            .feedback()
            .report_cancel_execution(
                action.id,
                DeviceExecution::Closed(ExecutionResult::Success),
                vec![],
            )
            .unwrap();
        let promoted = report.promoted.unwrap();
        assert_eq!(promoted.rollout_id, Some(newer.id));
        assert_eq!(promoted.group_id, Some(newer_group.id));
    }
    let newer_actions = group_actions(&engine, &newer_group);
    assert_eq!(newer_actions.len(), 15);
    for action in &newer_actions {
        close(&engine, action, ExecutionResult::Success);
    }
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.finished_rollouts, 1);
    let finished = engine.rollout_details(newer.id).unwrap();
    assert_eq!(finished.rollout.status, RolloutStatus::Finished);
    assert_eq!(finished.status.finished_percent(), 100);

    let older_status = engine.rollout_details(older.id).unwrap().status;
    assert_eq!(older_status.count(TargetCountCategory::Finished), 8);
    assert_eq!(older_status.count(TargetCountCategory::Cancelled), 7);
    assert_eq!(older_status.count(TargetCountCategory::NotStarted), 0);
}

#[test]
fn direct_assignment_wins_over_a_group_not_yet_activated() {
    let engine = fleet(4);
    let rollout = create_started(&engine, "hotfix-race", 2, 100, 100);
    let groups = engine.groups(rollout.id).unwrap();
    let members: Vec<_> = engine
        .group_targets(groups[1].id, None, PageRequest::first(10))
        .unwrap()
        .items
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(members, vec!["dev-002", "dev-003"]);

    let SupersedeOutcome::Assigned(installed) = engine
        .coordinator()
        .supersede(Assignment::direct("dev-002", "ds-hotfix"))
        .unwrap()
    else {
        panic!("expected immediate assignment");
    };
    close(&engine, &installed, ExecutionResult::Success);
    let SupersedeOutcome::Assigned(waiting) = engine
        .coordinator()
        .supersede(Assignment::direct("dev-003", "ds-hotfix"))
        .unwrap()
    else {
        panic!("expected immediate assignment");
    };

    for action in group_actions(&engine, &groups[0]) {
        close(&engine, &action, ExecutionResult::Success);
    }
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.activated_groups, 1);
    assert_eq!(report.failures, 0);

    assert!(group_actions(&engine, &groups[1]).is_empty());
    let status = engine.group_details(groups[1].id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::Cancelled), 2);
    assert_eq!(status.count(TargetCountCategory::NotStarted), 0);

    let active = engine.store().active_action("dev-003").unwrap().unwrap();
    assert_eq!(active.id, waiting.id);
    assert_eq!(active.status, ActionStatus::Scheduled);
    let target = engine.store().get_target("dev-002").unwrap().unwrap();
    assert_eq!(target.installed_distribution.as_deref(), Some("ds-hotfix"));
    assert!(engine.store().active_action("dev-002").unwrap().is_none());
}

#[test]
fn second_rollout_skips_targets_already_on_the_distribution() {
    let engine = fleet(15);
    let first = create_started(&engine, "first", 3, 50, 100);
    for group in engine.groups(first.id).unwrap() {
        let actions = group_actions(&engine, &group);
        assert_eq!(actions.len(), 5);
        for action in &actions[..3] {
            close(&engine, action, ExecutionResult::Success);
        }
        for action in &actions[3..] {
            close(&engine, action, ExecutionResult::Failure);
        }
        engine.evaluate_running(100).unwrap();
    }
    let first = engine.rollout_details(first.id).unwrap();
    assert_eq!(first.rollout.status, RolloutStatus::Finished);
    assert_eq!(first.status.count(TargetCountCategory::Finished), 9);
    assert_eq!(first.status.count(TargetCountCategory::Error), 6);

    let second = create_started(&engine, "second", 1, 100, 100);
    let group = engine.groups(second.id).unwrap().remove(0);
    let actions = group_actions(&engine, &group);
    assert_eq!(actions.len(), 6);
    for action in &actions {
        let target = engine.store().get_target(&action.target_id).unwrap().unwrap();
        assert_eq!(target.update_status, TargetUpdateStatus::Pending);
        assert_eq!(target.installed_distribution, None);
    }

    engine.evaluate_running(100).unwrap();
    let status = engine.rollout_details(second.id).unwrap().status;
    assert_eq!(status.count(TargetCountCategory::NotStarted), 9);
    assert_eq!(status.count(TargetCountCategory::Scheduled), 6);
    assert_eq!(group_actions(&engine, &group).len(), 6);
}

#[test]
fn start_succeeds_while_a_tick_materializes_the_same_group() {
    let engine = fleet(40).with_settings(EngineSettings {
        activation_batch_size: 2,
        ..EngineSettings::default()
    });
    let rollout = engine
        .create(
            CreateRollout::new("racing-start", "id==dev-*", "ds-2.0"),
            1,
            GroupConditions::thresholds(100, 100),
        )
        .unwrap();

    let stop = std::sync::atomic::AtomicBool::new(false);
    let started = std::thread::scope(|scope| {
        let ticker = scope.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                engine.evaluate_running(1).unwrap();
            }
        });
        let started = engine.start(rollout.id);
        stop.store(true, Ordering::SeqCst);
        ticker.join().unwrap();
        started
    });
    assert_eq!(started.unwrap().status, RolloutStatus::Running);

    engine.evaluate_running(100).unwrap();
    let group = engine.groups(rollout.id).unwrap().remove(0);
    assert!(group.actions_materialized);
    assert_eq!(group_actions(&engine, &group).len(), 40);
}

#[test]
fn repeated_ticks_keep_percentages_stable() {
    let engine = fleet(10);
    let rollout = create_started(&engine, "stable", 2, 80, 80);
    let groups = engine.groups(rollout.id).unwrap();
    let first = group_actions(&engine, &groups[0]);
    close(&engine, &first[0], ExecutionResult::Success);

    let before = engine.group_details(groups[0].id).unwrap();
    for _ in 0..3 {
        let report = engine.evaluate_running(100).unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.finished_groups, 0);
    }
    let after = engine.group_details(groups[0].id).unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.group.version, after.group.version);
    assert_eq!(after.status.finished_percent(), 20);
}

#[test]
fn group_overrides_replace_rollout_defaults() {
    let engine = fleet(4);
    let rollout = engine
        .create(
            CreateRollout::new("overrides", "id==dev-*", "ds-2.0")
                .with_group_conditions(1, GroupConditions::thresholds(100, 100)),
            2,
            GroupConditions::thresholds(50, 80),
        )
        .unwrap();
    engine.start(rollout.id).unwrap();
    let groups = engine.groups(rollout.id).unwrap();
    let first = group_actions(&engine, &groups[0]);
    close(&engine, &first[0], ExecutionResult::Success);

    // 50% would satisfy the rollout default but not the group's 100%.
    engine.evaluate_running(100).unwrap();
    assert_eq!(
        group_statuses(&engine, rollout.id),
        vec![GroupStatus::Running, GroupStatus::Scheduled]
    );
}

#[test]
fn filter_narrows_the_population() {
    let engine = fleet(10);
    let rollout = engine
        .create(
            CreateRollout::new("eu-only", "attribute.region==eu", "ds-2.0"),
            2,
            GroupConditions::default(),
        )
        .unwrap();
    assert_eq!(rollout.total_targets, 5);
    let groups = engine.groups(rollout.id).unwrap();
    let filter = TargetFilter::parse("attribute.region==us").unwrap();
    for group in &groups {
        let us = engine
            .group_targets(group.id, Some(&filter), PageRequest::first(10))
            .unwrap();
        assert_eq!(us.total, 0);
    }
}

#[test]
fn concurrent_ticks_apply_each_transition_once() {
    let engine = fleet(20);
    let rollout = create_started(&engine, "race", 4, 50, 80);
    let groups = engine.groups(rollout.id).unwrap();
    let first = group_actions(&engine, &groups[0]);
    for action in &first[..3] {
        close(&engine, action, ExecutionResult::Success);
    }

    let reports: Vec<TickReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| engine.evaluate_running(2).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let finished: usize = reports.iter().map(|r| r.finished_groups).sum();
    assert_eq!(finished, 1);
    assert!(reports.iter().all(|r| r.failures == 0));
    assert_eq!(
        group_statuses(&engine, rollout.id),
        vec![
            GroupStatus::Finished,
            GroupStatus::Running,
            GroupStatus::Scheduled,
            GroupStatus::Scheduled
        ]
    );
    let second = group_actions(&engine, &groups[1]);
    assert_eq!(second.len(), 5);
    assert!(engine.group(groups[1].id).unwrap().actions_materialized);
}

#[test]
fn stale_transition_is_rejected() {
    let engine = fleet(2);
    let rollout = create_started(&engine, "stale", 1, 50, 80);
    let stale = engine.rollout(rollout.id).unwrap();
    engine.pause(rollout.id).unwrap();

    let err = engine
        .store()
        .commit_transition(Transition::rollout(Rollout {
            status: RolloutStatus::Finished,
            ..stale
        }))
        .unwrap_err();
    assert!(matches!(err, StateError::VersionConflict { .. }));
    assert_eq!(engine.rollout(rollout.id).unwrap().status, RolloutStatus::Paused);
}

/// Store-backed selector that fails the first `failures` resolve calls.
struct FlakySelector {
    store: StateStore,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakySelector {
    fn new(store: StateStore, failures: usize) -> Self {
        Self {
            store,
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl TargetSelector for FlakySelector {
    fn count(&self, filter: &TargetFilter) -> anyhow::Result<u64> {
        TargetSelector::count(&self.store, filter)
    }

    fn resolve(&self, filter: &TargetFilter, page: PageRequest) -> anyhow::Result<Vec<TargetId>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            anyhow::bail!("target directory unavailable");
        }
        self.store.resolve(filter, page)
    }
}

fn flaky_engine(targets: usize, failures: usize) -> RolloutEngine {
    let engine = fleet(targets);
    let selector = FlakySelector::new(engine.store().clone(), failures);
    engine.with_selector(Arc::new(selector))
}

#[test]
fn transient_partition_failure_resumes_on_tick() {
    let engine = flaky_engine(6, 1);
    let rollout = engine
        .create(
            CreateRollout::new("flaky", "id==dev-*", "ds-2.0"),
            3,
            GroupConditions::default(),
        )
        .unwrap();
    assert_eq!(rollout.status, RolloutStatus::Creating);
    assert_eq!(rollout.partition_attempts, 1);
    assert!(matches!(
        engine.start(rollout.id),
        Err(RolloutError::CreationInProgress(_))
    ));

    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.partitioned, 1);
    let ready = engine.rollout(rollout.id).unwrap();
    assert_eq!(ready.status, RolloutStatus::Ready);
    assert_eq!(ready.partitioned_targets, 6);
}

#[test]
fn exhausted_partition_attempts_end_in_error_creating() {
    let (sink, mut events) = ChannelSink::new();
    let engine = flaky_engine(6, usize::MAX).with_events(Arc::new(sink));
    let rollout = engine
        .create(
            CreateRollout::new("broken", "id==dev-*", "ds-2.0"),
            2,
            GroupConditions::default(),
        )
        .unwrap();
    assert_eq!(rollout.status, RolloutStatus::Creating);

    engine.evaluate_running(100).unwrap();
    let report = engine.evaluate_running(100).unwrap();
    assert_eq!(report.failures, 1);
    let failed = engine.rollout(rollout.id).unwrap();
    assert_eq!(failed.status, RolloutStatus::ErrorCreating);
    assert!(matches!(
        engine.start(rollout.id),
        Err(RolloutError::InvalidStateTransition { .. })
    ));

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, RolloutEvent::CreationFailed { .. });
    }
    assert!(saw_failure);

    // Nothing more happens to it.
    assert_eq!(engine.evaluate_running(100).unwrap(), TickReport::default());
}

/// Selector whose population shrinks between counting and resolving.
struct ShrinkingSelector(StateStore);

impl TargetSelector for ShrinkingSelector {
    fn count(&self, filter: &TargetFilter) -> anyhow::Result<u64> {
        Ok(TargetSelector::count(&self.0, filter)? + 2)
    }

    fn resolve(&self, filter: &TargetFilter, page: PageRequest) -> anyhow::Result<Vec<TargetId>> {
        self.0.resolve(filter, page)
    }
}

#[test]
fn shrinking_population_fails_creation() {
    let engine = fleet(4);
    let engine = engine
        .clone()
        .with_selector(Arc::new(ShrinkingSelector(engine.store().clone())));
    let err = engine
        .create(
            CreateRollout::new("shrink", "id==dev-*", "ds-2.0"),
            2,
            GroupConditions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, RolloutError::PartitionFailure { .. }));
    let rollout = engine.find_rollout_by_name("shrink").unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::ErrorCreating);
}

#[test]
fn persisted_rollout_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.redb");
    let rollout_id = {
        let store = StateStore::open(&path).unwrap();
        for i in 0..4 {
            store.put_target(&Target::new(&format!("dev-{i}"), 0)).unwrap();
        }
        let engine = RolloutEngine::new(store);
        create_started(&engine, "durable", 2, 50, 80).id
    };

    let engine = RolloutEngine::new(StateStore::open(&path).unwrap());
    let details = engine.rollout_details(rollout_id).unwrap();
    assert_eq!(details.rollout.status, RolloutStatus::Running);
    assert_eq!(details.status.count(TargetCountCategory::Scheduled), 2);
}
