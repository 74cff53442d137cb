//! StateStore: redb-backed state persistence for fleetgrid.
//!
//! Provides typed operations over targets, rollouts, rollout groups,
//! membership slots, actions and the append-only status history. All
//! multi-record changes (an action batch, a rollout/group transition, a
//! partition batch) run inside a single write transaction, so a failure
//! never leaves a half-applied change behind. The store supports both
//! on-disk and in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fleet_core::TargetFilter;
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Exclusive upper bound of all `{owner}:...` keys.
fn owner_end(owner: u64) -> String {
    format!("{owner:020};")
}

fn check_version(entity: String, expected: u64, found: u64) -> StateResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(StateError::VersionConflict {
            entity,
            expected,
            found,
        })
    }
}

/// Reserve `count` consecutive ids from a sequence. Returns the first one.
fn reserve_ids(txn: &WriteTransaction, sequence: &str, count: u64) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let last = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    table
        .insert(sequence, last + count)
        .map_err(map_err!(Write))?;
    Ok(last + 1)
}

/// A set of changes to actions applied in one write transaction.
///
/// Steps run in field order: status updates, slot marks, consumed pending
/// assignments, parked assignments, then new actions. Any failed check
/// aborts the batch.
#[derive(Debug, Clone, Default)]
pub struct ActionBatch {
    pub updates: Vec<(ActionId, StatusUpdate)>,
    /// Membership slots closed without an action (skipped or superseded).
    pub marks: Vec<(GroupId, TargetId, MemberSlot)>,
    pub consume_pending: Vec<TargetId>,
    pub park: Vec<PendingAssignment>,
    pub creates: Vec<NewAction>,
}

impl ActionBatch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
            && self.marks.is_empty()
            && self.consume_pending.is_empty()
            && self.park.is_empty()
            && self.creates.is_empty()
    }
}

/// Result of a committed [`ActionBatch`].
#[derive(Debug, Clone, Default)]
pub struct ActionCommit {
    /// Action state after each applied update, with the entry it appended.
    pub updated: Vec<(Action, ActionStatusEntry)>,
    pub created: Vec<Action>,
}

/// Rollout and group records to write under an optimistic version check.
///
/// Each record carries the version it was read at. The commit fails with
/// [`StateError::VersionConflict`] if any stored version moved since.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub rollout: Option<Rollout>,
    pub groups: Vec<RolloutGroup>,
    /// Stamp the rollout's start watermark from the action id sequence.
    pub mark_started: bool,
}

impl Transition {
    pub fn rollout(rollout: Rollout) -> Self {
        Self {
            rollout: Some(rollout),
            ..Self::default()
        }
    }

    pub fn marking_started(mut self) -> Self {
        self.mark_started = true;
        self
    }

    pub fn with_group(mut self, group: RolloutGroup) -> Self {
        self.groups.push(group);
        self
    }
}

/// Open action-related tables inside one write transaction.
struct ActionWriter<'txn> {
    actions: JsonTable<'txn>,
    history: JsonTable<'txn>,
    index: Table<'txn, &'static str, &'static str>,
    active: Table<'txn, &'static str, u64>,
    latest: Table<'txn, &'static str, u64>,
    pending: JsonTable<'txn>,
    members: JsonTable<'txn>,
}

impl<'txn> ActionWriter<'txn> {
    fn open(txn: &'txn WriteTransaction) -> StateResult<Self> {
        Ok(Self {
            actions: txn.open_table(ACTIONS).map_err(map_err!(Table))?,
            history: txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?,
            index: txn.open_table(GROUP_ACTIONS).map_err(map_err!(Table))?,
            active: txn.open_table(ACTIVE_ACTIONS).map_err(map_err!(Table))?,
            latest: txn.open_table(LATEST_ACTIONS).map_err(map_err!(Table))?,
            pending: txn.open_table(PENDING_ASSIGNMENTS).map_err(map_err!(Table))?,
            members: txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?,
        })
    }

    fn load(&self, id: ActionId) -> StateResult<Option<Action>> {
        get_json(&self.actions, &id_key(id))
    }

    fn append(
        &mut self,
        mut action: Action,
        update: StatusUpdate,
    ) -> StateResult<(Action, ActionStatusEntry)> {
        if action.status.is_terminal() {
            return Err(StateError::ActionClosed(action.id));
        }
        let entry = ActionStatusEntry {
            action_id: action.id,
            seq: action.status_count,
            status: update.status,
            occurred_at: update.occurred_at,
            messages: update.messages,
        };
        put_json(&mut self.history, &status_key(action.id, entry.seq), &entry)?;

        action.status = entry.status;
        action.status_count += 1;
        action.updated_at = action.updated_at.max(entry.occurred_at);
        put_json(&mut self.actions, &id_key(action.id), &action)?;

        if let Some(group_id) = action.group_id {
            self.index
                .insert(
                    group_action_key(group_id, action.id).as_str(),
                    entry.status.as_str(),
                )
                .map_err(map_err!(Write))?;
        }
        if entry.status.is_terminal() {
            self.active
                .remove(action.target_id.as_str())
                .map_err(map_err!(Write))?;
        }
        Ok((action, entry))
    }

    /// Move a membership slot to `next`, refusing to overwrite an assigned one.
    fn claim_slot(&mut self, group_id: GroupId, target_id: &str, next: MemberSlot) -> StateResult<()> {
        let key = member_key(group_id, target_id);
        match get_json::<MemberSlot, _>(&self.members, &key)? {
            Some(slot) if slot.is_open() => {}
            Some(_) => return Err(StateError::SlotTaken(key)),
            None => return Err(StateError::NotFound(format!("group member {key}"))),
        }
        put_json(&mut self.members, &key, &next)
    }

    /// Close a slot that a parked assignment was holding.
    fn release_parked_slot(&mut self, group_id: GroupId, target_id: &str) -> StateResult<()> {
        let key = member_key(group_id, target_id);
        if get_json::<MemberSlot, _>(&self.members, &key)? == Some(MemberSlot::Pending) {
            put_json(&mut self.members, &key, &MemberSlot::Superseded)?;
        }
        Ok(())
    }

    fn create(&mut self, id: ActionId, new: NewAction) -> StateResult<Action> {
        let existing = self
            .active
            .get(new.target_id.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        if existing.is_some() {
            return Err(StateError::ActiveActionExists(new.target_id));
        }
        if let Some(group_id) = new.group_id {
            self.claim_slot(group_id, &new.target_id, MemberSlot::Assigned(id))?;
        }

        let action = Action {
            id,
            target_id: new.target_id,
            rollout_id: new.rollout_id,
            group_id: new.group_id,
            distribution: new.distribution,
            status: ActionStatus::Scheduled,
            action_type: new.action_type,
            update_type: new.update_type,
            status_count: 1,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        let entry = ActionStatusEntry {
            action_id: id,
            seq: 0,
            status: ActionStatus::Scheduled,
            occurred_at: new.created_at,
            messages: vec![new.message],
        };
        put_json(&mut self.actions, &id_key(id), &action)?;
        put_json(&mut self.history, &status_key(id, 0), &entry)?;
        if let Some(group_id) = action.group_id {
            self.index
                .insert(
                    group_action_key(group_id, id).as_str(),
                    ActionStatus::Scheduled.as_str(),
                )
                .map_err(map_err!(Write))?;
        }
        self.active
            .insert(action.target_id.as_str(), id)
            .map_err(map_err!(Write))?;
        self.latest
            .insert(action.target_id.as_str(), id)
            .map_err(map_err!(Write))?;
        Ok(action)
    }

    /// Park an assignment. One it replaces loses its group slot for good.
    fn park(&mut self, mut assignment: PendingAssignment, ticket: u64) -> StateResult<()> {
        let previous: Option<PendingAssignment> = get_json(&self.pending, &assignment.target_id)?;
        if let Some(previous) = previous
            && let Some(group_id) = previous.group_id
            && previous.group_id != assignment.group_id
        {
            self.release_parked_slot(group_id, &previous.target_id)?;
        }
        if let Some(group_id) = assignment.group_id {
            self.claim_slot(group_id, &assignment.target_id, MemberSlot::Pending)?;
        }
        assignment.ticket = ticket;
        put_json(&mut self.pending, &assignment.target_id, &assignment)
    }

    fn consume(&mut self, target_id: &str) -> StateResult<()> {
        let removed = self
            .pending
            .remove(target_id)
            .map_err(map_err!(Write))?
            .is_some();
        if removed {
            Ok(())
        } else {
            Err(StateError::NotFound(format!(
                "pending assignment for {target_id}"
            )))
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(TARGETS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_NAMES).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(GROUP_ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE_ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(LATEST_ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(PENDING_ASSIGNMENTS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert or update a target.
    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            put_json(&mut table, &target.id, target)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a target by controller id.
    pub fn get_target(&self, target_id: &str) -> StateResult<Option<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        get_json(&table, target_id)
    }

    /// List all targets in id order.
    pub fn list_targets(&self) -> StateResult<Vec<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    pub fn count_targets(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    /// Apply `change` to a stored target. Returns the updated target, if any.
    pub fn update_target<F>(&self, target_id: &str, change: F) -> StateResult<Option<Target>>
    where
        F: FnOnce(&mut Target),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            match get_json::<Target, _>(&table, target_id)? {
                Some(mut target) => {
                    change(&mut target);
                    put_json(&mut table, target_id, &target)?;
                    Some(target)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Ids of targets matching `filter`, in id order, for one page.
    pub fn resolve_targets(
        &self,
        filter: &TargetFilter,
        page: PageRequest,
    ) -> StateResult<Vec<TargetId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let mut skipped = 0u64;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let target: Target = decode(value.value())?;
            if !filter.matches(&target) {
                continue;
            }
            if skipped < page.offset {
                skipped += 1;
                continue;
            }
            results.push(target.id);
            if results.len() >= page.limit {
                break;
            }
        }
        Ok(results)
    }

    /// Number of targets matching `filter`.
    pub fn count_matching_targets(&self, filter: &TargetFilter) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let target: Target = decode(value.value())?;
            if filter.matches(&target) {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Persist a new rollout in CREATING. Names are unique.
    pub fn insert_rollout(&self, new: NewRollout) -> StateResult<Rollout> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rollout = {
            let mut names = txn.open_table(ROLLOUT_NAMES).map_err(map_err!(Table))?;
            if names
                .get(new.name.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Duplicate(format!("rollout name {}", new.name)));
            }
            let id = reserve_ids(&txn, "rollout", 1)?;
            names
                .insert(new.name.as_str(), id)
                .map_err(map_err!(Write))?;

            let rollout = Rollout {
                id,
                name: new.name,
                description: new.description,
                target_filter: new.target_filter,
                distribution: new.distribution,
                action_type: new.action_type,
                update_type: new.update_type,
                conditions: new.conditions,
                group_ids: Vec::new(),
                status: RolloutStatus::Creating,
                total_targets: new.total_targets,
                partitioned_targets: 0,
                partition_attempts: 0,
                start_watermark: None,
                version: 0,
                created_at: new.created_at,
                updated_at: new.created_at,
            };
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            put_json(&mut rollouts, &id_key(id), &rollout)?;
            rollout
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = rollout.id, name = %rollout.name, "rollout stored");
        Ok(rollout)
    }

    pub fn get_rollout(&self, rollout_id: RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        get_json(&table, &id_key(rollout_id))
    }

    pub fn find_rollout_by_name(&self, name: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(ROLLOUT_NAMES).map_err(map_err!(Table))?;
        let id = names
            .get(name)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        match id {
            Some(id) => {
                let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
                get_json(&table, &id_key(id))
            }
            None => Ok(None),
        }
    }

    /// List all rollouts in creation order.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Rollout groups ─────────────────────────────────────────────

    /// Create the groups of a CREATING rollout and link them in order.
    pub fn create_groups(
        &self,
        rollout_id: RolloutId,
        expected_version: u64,
        groups: &[NewGroup],
        now: u64,
    ) -> StateResult<(Rollout, Vec<RolloutGroup>)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created = {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_json(&rollouts, &id_key(rollout_id))?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            check_version(format!("rollout {rollout_id}"), expected_version, rollout.version)?;
            if !rollout.group_ids.is_empty() {
                return Err(StateError::Duplicate(format!(
                    "groups of rollout {rollout_id}"
                )));
            }

            let first_id = reserve_ids(&txn, "group", groups.len() as u64)?;
            let mut table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            let mut created = Vec::with_capacity(groups.len());
            for (offset, new) in groups.iter().enumerate() {
                let group = RolloutGroup {
                    id: first_id + offset as u64,
                    rollout_id,
                    ordinal: new.ordinal,
                    name: format!("group-{}", new.ordinal),
                    status: GroupStatus::Scheduled,
                    target_count: new.target_count,
                    conditions: new.conditions.clone(),
                    actions_materialized: false,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };
                put_json(&mut table, &id_key(group.id), &group)?;
                created.push(group);
            }

            rollout.group_ids = created.iter().map(|g| g.id).collect();
            rollout.version += 1;
            rollout.updated_at = now;
            put_json(&mut rollouts, &id_key(rollout_id), &rollout)?;
            (rollout, created)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = rollout_id, groups = created.1.len(), "rollout groups created");
        Ok(created)
    }

    pub fn get_group(&self, group_id: GroupId) -> StateResult<Option<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        get_json(&table, &id_key(group_id))
    }

    /// Groups of a rollout in execution order.
    pub fn list_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let Some(rollout) = get_json::<Rollout, _>(&rollouts, &id_key(rollout_id))? else {
            return Err(StateError::NotFound(format!("rollout {rollout_id}")));
        };
        let table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
        let mut groups = Vec::with_capacity(rollout.group_ids.len());
        for group_id in &rollout.group_ids {
            let group = get_json(&table, &id_key(*group_id))?
                .ok_or_else(|| StateError::NotFound(format!("rollout group {group_id}")))?;
            groups.push(group);
        }
        Ok(groups)
    }

    /// Write membership slots for one partition batch and advance the
    /// rollout's partition cursor. The rollout becomes READY once every
    /// target is placed.
    pub fn add_group_members(
        &self,
        rollout_id: RolloutId,
        expected_version: u64,
        members: &[(GroupId, TargetId)],
        now: u64,
    ) -> StateResult<Rollout> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rollout = {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_json(&rollouts, &id_key(rollout_id))?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            check_version(format!("rollout {rollout_id}"), expected_version, rollout.version)?;

            let mut table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
            for (group_id, target_id) in members {
                if !rollout.group_ids.contains(group_id) {
                    return Err(StateError::NotFound(format!(
                        "group {group_id} in rollout {rollout_id}"
                    )));
                }
                let key = member_key(*group_id, target_id);
                if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::SlotTaken(key));
                }
                put_json(&mut table, &key, &MemberSlot::Unassigned)?;
            }

            rollout.partitioned_targets += members.len() as u64;
            if rollout.partitioned_targets >= rollout.total_targets {
                rollout.status = RolloutStatus::Ready;
            }
            rollout.version += 1;
            rollout.updated_at = now;
            put_json(&mut rollouts, &id_key(rollout_id), &rollout)?;
            rollout
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            rollout = rollout_id,
            placed = rollout.partitioned_targets,
            total = rollout.total_targets,
            "partition batch committed"
        );
        Ok(rollout)
    }

    /// Members of a group in target id order.
    pub fn list_group_members(
        &self,
        group_id: GroupId,
        page: PageRequest,
    ) -> StateResult<Page<GroupMember>> {
        let start = owner_prefix(group_id);
        let end = owner_end(group_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        let mut total = 0u64;
        let mut items = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            total += 1;
            if total <= page.offset || items.len() >= page.limit {
                continue;
            }
            items.push(GroupMember {
                group_id,
                target_id: key.value()[start.len()..].to_string(),
                slot: decode(value.value())?,
            });
        }
        Ok(Page { items, total })
    }

    /// Up to `limit` members of a group that have neither an action nor a
    /// pending assignment.
    pub fn unassigned_members(&self, group_id: GroupId, limit: usize) -> StateResult<Vec<TargetId>> {
        let start = owner_prefix(group_id);
        let end = owner_end(group_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if decode::<MemberSlot>(value.value())? == MemberSlot::Unassigned {
                results.push(key.value()[start.len()..].to_string());
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Write rollout/group records if none of them changed since read.
    ///
    /// Returns the records as stored, with versions bumped by one.
    pub fn commit_transition(&self, transition: Transition) -> StateResult<Transition> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let committed = {
            let mut committed = Transition::default();
            if let Some(mut rollout) = transition.rollout {
                if transition.mark_started {
                    let sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
                    let last = sequences
                        .get("action")
                        .map_err(map_err!(Read))?
                        .map(|guard| guard.value())
                        .unwrap_or(0);
                    rollout.start_watermark = Some(last);
                }
                let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
                let key = id_key(rollout.id);
                let stored: Rollout = get_json(&table, &key)?
                    .ok_or_else(|| StateError::NotFound(format!("rollout {}", rollout.id)))?;
                check_version(format!("rollout {}", rollout.id), rollout.version, stored.version)?;
                rollout.version += 1;
                put_json(&mut table, &key, &rollout)?;
                committed.rollout = Some(rollout);
            }
            let mut table = txn.open_table(ROLLOUT_GROUPS).map_err(map_err!(Table))?;
            for mut group in transition.groups {
                let key = id_key(group.id);
                let stored: RolloutGroup = get_json(&table, &key)?
                    .ok_or_else(|| StateError::NotFound(format!("rollout group {}", group.id)))?;
                check_version(format!("rollout group {}", group.id), group.version, stored.version)?;
                group.version += 1;
                put_json(&mut table, &key, &group)?;
                committed.groups.push(group);
            }
            committed
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(committed)
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Apply an [`ActionBatch`] atomically.
    ///
    /// Fails without writing anything if an updated action is already
    /// closed, a created action would give its target a second active
    /// action, or a membership slot is already assigned.
    pub fn commit_actions(&self, batch: ActionBatch) -> StateResult<ActionCommit> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut commit = ActionCommit::default();
        {
            // Parked assignments draw tickets from the action sequence so
            // they order against actions.
            let reserved = (batch.creates.len() + batch.park.len()) as u64;
            let first_id = reserve_ids(&txn, "action", reserved)?;
            let first_ticket = first_id + batch.creates.len() as u64;
            let mut writer = ActionWriter::open(&txn)?;
            for (action_id, update) in batch.updates {
                let action = writer
                    .load(action_id)?
                    .ok_or_else(|| StateError::NotFound(format!("action {action_id}")))?;
                commit.updated.push(writer.append(action, update)?);
            }
            for (group_id, target_id, slot) in batch.marks {
                writer.claim_slot(group_id, &target_id, slot)?;
            }
            for target_id in &batch.consume_pending {
                writer.consume(target_id)?;
            }
            for (offset, assignment) in batch.park.into_iter().enumerate() {
                writer.park(assignment, first_ticket + offset as u64)?;
            }
            for (offset, new) in batch.creates.into_iter().enumerate() {
                commit
                    .created
                    .push(writer.create(first_id + offset as u64, new)?);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            updated = commit.updated.len(),
            created = commit.created.len(),
            "action batch committed"
        );
        Ok(commit)
    }

    /// Append one status entry to an action, decided from its current state.
    ///
    /// `decide` runs inside the write transaction, so the decision and the
    /// append cannot interleave with another writer. Returns `Ok(None)` for
    /// an unknown action id.
    pub fn update_action_status<E, F>(
        &self,
        action_id: ActionId,
        decide: F,
    ) -> Result<Option<(Action, ActionStatusEntry)>, E>
    where
        E: From<StateError>,
        F: FnOnce(&Action) -> Result<StatusUpdate, E>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let applied = {
            let mut writer = ActionWriter::open(&txn)?;
            match writer.load(action_id)? {
                Some(action) => {
                    let update = decide(&action)?;
                    Some(writer.append(action, update)?)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(applied)
    }

    pub fn get_action(&self, action_id: ActionId) -> StateResult<Option<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        get_json(&table, &id_key(action_id))
    }

    /// The target's single non-terminal action, if any.
    pub fn active_action(&self, target_id: &str) -> StateResult<Option<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_ACTIONS).map_err(map_err!(Table))?;
        let id = active
            .get(target_id)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        match id {
            Some(id) => {
                let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
                get_json(&table, &id_key(id))
            }
            None => Ok(None),
        }
    }

    /// Id of the target's most recently created action, terminal or not.
    pub fn latest_action_id(&self, target_id: &str) -> StateResult<Option<ActionId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let latest = txn.open_table(LATEST_ACTIONS).map_err(map_err!(Table))?;
        let id = latest
            .get(target_id)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        if id.is_some() {
            return Ok(id);
        }
        let active = txn.open_table(ACTIVE_ACTIONS).map_err(map_err!(Table))?;
        Ok(active
            .get(target_id)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value()))
    }

    /// All actions ever created for a target, oldest first.
    pub fn list_target_actions(&self, target_id: &str) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let action: Action = decode(value.value())?;
            if action.target_id == target_id {
                results.push(action);
            }
        }
        Ok(results)
    }

    /// Status history of an action in insertion order.
    pub fn action_history(&self, action_id: ActionId) -> StateResult<Vec<ActionStatusEntry>> {
        let start = owner_prefix(action_id);
        let end = owner_end(action_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTION_STATUS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Actions of the given groups, optionally restricted to one status.
    pub fn list_group_actions(
        &self,
        group_ids: &[GroupId],
        status: Option<ActionStatus>,
        page: PageRequest,
    ) -> StateResult<Page<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(GROUP_ACTIONS).map_err(map_err!(Table))?;
        let actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let mut total = 0u64;
        let mut items = Vec::new();
        for group_id in group_ids {
            let start = owner_prefix(*group_id);
            let end = owner_end(*group_id);
            for entry in index
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if status.is_some_and(|s| s.as_str() != value.value()) {
                    continue;
                }
                total += 1;
                if total <= page.offset || items.len() >= page.limit {
                    continue;
                }
                let action_key = &key.value()[start.len()..];
                let action = get_json(&actions, action_key)?
                    .ok_or_else(|| StateError::NotFound(format!("action {action_key}")))?;
                items.push(action);
            }
        }
        Ok(Page { items, total })
    }

    /// Count actions per status across the given groups in one read
    /// transaction over the status index.
    pub fn count_actions_by_status(
        &self,
        group_ids: &[GroupId],
    ) -> StateResult<BTreeMap<ActionStatus, u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(GROUP_ACTIONS).map_err(map_err!(Table))?;
        let mut counts = BTreeMap::new();
        for group_id in group_ids {
            let start = owner_prefix(*group_id);
            let end = owner_end(*group_id);
            for entry in index
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let status = ActionStatus::parse(value.value()).ok_or_else(|| {
                    StateError::Deserialize(format!("unknown action status {}", value.value()))
                })?;
                *counts.entry(status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Members of the given groups that a newer assignment took over.
    pub fn count_superseded_members(&self, group_ids: &[GroupId]) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        let mut count = 0;
        for group_id in group_ids {
            let start = owner_prefix(*group_id);
            let end = owner_end(*group_id);
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (_, value) = entry.map_err(map_err!(Read))?;
                if decode::<MemberSlot>(value.value())? == MemberSlot::Superseded {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    // ── Pending assignments ────────────────────────────────────────

    pub fn pending_assignment(&self, target_id: &str) -> StateResult<Option<PendingAssignment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING_ASSIGNMENTS).map_err(map_err!(Table))?;
        get_json(&table, target_id)
    }

    pub fn list_pending_assignments(&self) -> StateResult<Vec<PendingAssignment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING_ASSIGNMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }
}
