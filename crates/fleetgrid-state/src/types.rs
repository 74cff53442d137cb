//! Domain types for the fleetgrid state store.
//!
//! These types represent the persisted state of targets, rollouts, rollout
//! groups, actions and their status history. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use fleet_core::{FilterField, Filterable};
use serde::{Deserialize, Serialize};

/// Controller id of a managed device.
pub type TargetId = String;

/// Reference to a distribution bundle (software package/version).
pub type DistributionRef = String;

pub type RolloutId = u64;
pub type GroupId = u64;
pub type ActionId = u64;

// ── Target ────────────────────────────────────────────────────────

/// A managed device capable of receiving software updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub assigned_distribution: Option<DistributionRef>,
    pub installed_distribution: Option<DistributionRef>,
    pub update_status: TargetUpdateStatus,
    /// Unix timestamp (millis) when the target was registered.
    pub created_at: u64,
}

impl Target {
    pub fn new(id: &str, created_at: u64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            attributes: BTreeMap::new(),
            assigned_distribution: None,
            installed_distribution: None,
            update_status: TargetUpdateStatus::Registered,
            created_at,
        }
    }
}

/// Update state of a target as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetUpdateStatus {
    Unknown,
    Registered,
    Pending,
    InSync,
    Error,
}

impl TargetUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Registered => "registered",
            Self::Pending => "pending",
            Self::InSync => "in_sync",
            Self::Error => "error",
        }
    }
}

impl Filterable for Target {
    fn field_value(&self, field: &FilterField) -> Option<&str> {
        match field {
            FilterField::Id => Some(&self.id),
            FilterField::Name => Some(&self.name),
            FilterField::Attribute(key) => self.attributes.get(key).map(String::as_str),
            FilterField::AssignedDistribution => self.assigned_distribution.as_deref(),
            FilterField::InstalledDistribution => self.installed_distribution.as_deref(),
            FilterField::UpdateStatus => Some(self.update_status.as_str()),
        }
    }
}

// ── Conditions ────────────────────────────────────────────────────

/// What happens to the rollout when a group crosses its error threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErrorAction {
    /// Pause the owning rollout until an operator resumes it.
    #[default]
    Pause,
}

/// What happens when a group crosses its success threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SuccessAction {
    /// Activate the next scheduled group.
    #[default]
    NextGroup,
}

/// Thresholds (in percent of the group's targets) and follow-up actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConditions {
    pub success_threshold: u8,
    pub success_action: SuccessAction,
    pub error_threshold: u8,
    pub error_action: ErrorAction,
}

impl GroupConditions {
    pub fn thresholds(success_threshold: u8, error_threshold: u8) -> Self {
        Self {
            success_threshold,
            success_action: SuccessAction::NextGroup,
            error_threshold,
            error_action: ErrorAction::Pause,
        }
    }
}

impl Default for GroupConditions {
    fn default() -> Self {
        Self::thresholds(100, 50)
    }
}

// ── Rollout ───────────────────────────────────────────────────────

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Running,
    Paused,
    Finished,
    ErrorCreating,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::ErrorCreating)
    }
}

/// How devices should handle the actions a rollout creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionType {
    Soft,
    #[default]
    Forced,
    /// Soft until `force_at` (unix millis), forced afterwards.
    TimeForced { force_at: u64 },
}

/// Whether download and installation are triggered together or separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    #[default]
    Combined,
    Separated,
}

/// A phased deployment of one distribution across a filtered population.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub name: String,
    pub description: String,
    pub target_filter: String,
    pub distribution: DistributionRef,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    /// Default conditions for groups without an override.
    pub conditions: GroupConditions,
    /// Group ids in execution order.
    pub group_ids: Vec<GroupId>,
    pub status: RolloutStatus,
    pub total_targets: u64,
    /// Number of targets already written into group membership.
    pub partitioned_targets: u64,
    /// Failed partition batches so far.
    pub partition_attempts: u32,
    /// Last action id issued when the rollout started. Actions and parked
    /// assignments numbered above it are newer than the rollout.
    #[serde(default)]
    pub start_watermark: Option<ActionId>,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Fields supplied when a rollout is first persisted.
#[derive(Debug, Clone)]
pub struct NewRollout {
    pub name: String,
    pub description: String,
    pub target_filter: String,
    pub distribution: DistributionRef,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    pub conditions: GroupConditions,
    pub total_targets: u64,
    pub created_at: u64,
}

// ── Rollout group ─────────────────────────────────────────────────

/// Lifecycle status of a rollout group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Scheduled,
    Running,
    Finished,
    Error,
}

/// An ordered, fixed-membership subset of a rollout's targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    /// 1-based execution position.
    pub ordinal: u32,
    pub name: String,
    pub status: GroupStatus,
    pub target_count: u64,
    /// Overrides the rollout's default conditions when present.
    pub conditions: Option<GroupConditions>,
    /// Every member carries an action or a pending assignment.
    pub actions_materialized: bool,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RolloutGroup {
    /// Conditions in effect for this group.
    pub fn effective_conditions<'a>(&'a self, rollout: &'a Rollout) -> &'a GroupConditions {
        self.conditions.as_ref().unwrap_or(&rollout.conditions)
    }
}

/// Fields for a group created during partitioning.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub ordinal: u32,
    pub target_count: u64,
    pub conditions: Option<GroupConditions>,
}

/// Materialization state of one target inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "action", rename_all = "snake_case")]
pub enum MemberSlot {
    Unassigned,
    /// Waiting for the target's previous action to finish cancelling.
    Pending,
    Assigned(ActionId),
    /// The target already runs the rollout's distribution.
    Skipped,
    /// A newer assignment took the target over before this group did.
    Superseded,
}

impl MemberSlot {
    /// Whether an action or a parked assignment may still take this slot.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Unassigned | Self::Pending)
    }
}

/// A target's membership in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub slot: MemberSlot,
}

// ── Action ────────────────────────────────────────────────────────

/// Status of an action. Also used for status history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Scheduled,
    Running,
    Download,
    Downloaded,
    Retrieved,
    /// Installation start confirmed for a separated update.
    Start,
    Canceling,
    Canceled,
    Finished,
    Error,
    Warning,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 11] = [
        Self::Scheduled,
        Self::Running,
        Self::Download,
        Self::Downloaded,
        Self::Retrieved,
        Self::Start,
        Self::Canceling,
        Self::Canceled,
        Self::Finished,
        Self::Error,
        Self::Warning,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Canceled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Download => "download",
            Self::Downloaded => "downloaded",
            Self::Retrieved => "retrieved",
            Self::Start => "start",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work item "target T should move to distribution D".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub target_id: TargetId,
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    pub distribution: DistributionRef,
    pub status: ActionStatus,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    /// Number of status entries appended so far.
    pub status_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Action {
    /// Whether the device must apply the action without user consent at `now`.
    pub fn is_forced(&self, now: u64) -> bool {
        match self.action_type {
            ActionType::Forced => true,
            ActionType::Soft => false,
            ActionType::TimeForced { force_at } => now >= force_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_canceling_or_canceled(&self) -> bool {
        matches!(self.status, ActionStatus::Canceling | ActionStatus::Canceled)
    }
}

/// Fields for an action about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub target_id: TargetId,
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    pub distribution: DistributionRef,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    pub created_at: u64,
    /// Message for the initial SCHEDULED history entry.
    pub message: String,
}

/// One append-only entry of an action's status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatusEntry {
    pub action_id: ActionId,
    /// Position in the action's history, starting at 0.
    pub seq: u32,
    pub status: ActionStatus,
    pub occurred_at: u64,
    pub messages: Vec<String>,
}

/// A status change to append to an action's history.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: ActionStatus,
    pub occurred_at: u64,
    pub messages: Vec<String>,
}

impl StatusUpdate {
    pub fn new(status: ActionStatus, occurred_at: u64, message: impl Into<String>) -> Self {
        Self {
            status,
            occurred_at,
            messages: vec![message.into()],
        }
    }
}

/// An assignment parked until the target's previous action terminates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAssignment {
    pub target_id: TargetId,
    pub distribution: DistributionRef,
    pub action_type: ActionType,
    pub update_type: UpdateType,
    pub rollout_id: Option<RolloutId>,
    pub group_id: Option<GroupId>,
    /// The action being cancelled on behalf of this assignment.
    pub superseded_action: ActionId,
    pub requested_at: u64,
    /// Position in the action id sequence, stamped by the store when parked.
    #[serde(default)]
    pub ticket: u64,
}

impl PendingAssignment {
    pub fn into_new_action(self, created_at: u64) -> NewAction {
        NewAction {
            message: format!("assignment released after action {} closed", self.superseded_action),
            target_id: self.target_id,
            rollout_id: self.rollout_id,
            group_id: self.group_id,
            distribution: self.distribution,
            action_type: self.action_type,
            update_type: self.update_type,
            created_at,
        }
    }
}

// ── Paging ────────────────────────────────────────────────────────

/// Offset-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: u64, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// A page of results with the total number of matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

// ── Keys ──────────────────────────────────────────────────────────

/// Zero-padded id so lexical key order equals numeric order.
pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

/// `{group}:{target}` membership key.
pub fn member_key(group_id: GroupId, target_id: &str) -> String {
    format!("{group_id:020}:{target_id}")
}

/// `{group}:{action}` key of the group status index.
pub fn group_action_key(group_id: GroupId, action_id: ActionId) -> String {
    format!("{group_id:020}:{action_id:020}")
}

/// `{action}:{seq}` key of the status history table.
pub fn status_key(action_id: ActionId, seq: u32) -> String {
    format!("{action_id:020}:{seq:010}")
}

/// Prefix of all composite keys owned by `id`.
pub fn owner_prefix(id: u64) -> String {
    format!("{id:020}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = ActionStatus::ALL
            .into_iter()
            .filter(ActionStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![ActionStatus::Canceled, ActionStatus::Finished, ActionStatus::Error]
        );
    }

    #[test]
    fn status_names_parse_back() {
        for status in ActionStatus::ALL {
            assert_eq!(ActionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ActionStatus::parse("bogus"), None);
    }

    #[test]
    fn time_forced_switches_at_deadline() {
        let action = Action {
            id: 1,
            target_id: "t".to_string(),
            rollout_id: None,
            group_id: None,
            distribution: "ds".to_string(),
            status: ActionStatus::Scheduled,
            action_type: ActionType::TimeForced { force_at: 5_000 },
            update_type: UpdateType::Combined,
            status_count: 1,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!action.is_forced(4_999));
        assert!(action.is_forced(5_000));
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(id_key(9) < id_key(10));
        assert!(group_action_key(2, 100) < group_action_key(10, 1));
        assert!(member_key(3, "a").starts_with(&owner_prefix(3)));
    }

    #[test]
    fn member_slot_serializes_with_tag() {
        let json = serde_json::to_string(&MemberSlot::Assigned(7)).unwrap();
        assert_eq!(json, r#"{"state":"assigned","action":7}"#);
        let back: MemberSlot = serde_json::from_str(r#"{"state":"unassigned"}"#).unwrap();
        assert_eq!(back, MemberSlot::Unassigned);
        assert_eq!(
            serde_json::to_string(&MemberSlot::Superseded).unwrap(),
            r#"{"state":"superseded"}"#
        );
        assert!(MemberSlot::Pending.is_open());
        assert!(!MemberSlot::Skipped.is_open());
    }

    #[test]
    fn target_filterable_fields() {
        let mut target = Target::new("dev-1", 0);
        target.attributes.insert("hw".to_string(), "rev2".to_string());
        assert_eq!(target.field_value(&FilterField::Id), Some("dev-1"));
        assert_eq!(
            target.field_value(&FilterField::Attribute("hw".to_string())),
            Some("rev2")
        );
        assert_eq!(target.field_value(&FilterField::UpdateStatus), Some("registered"));
    }
}
