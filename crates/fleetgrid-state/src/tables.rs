//! redb table definitions for the fleetgrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Numeric ids are zero-padded to 20 digits so that composite keys
//! `{owner_id}:{child}` sort numerically and support prefix range scans.

use redb::TableDefinition;

/// Targets keyed by controller id.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Rollouts keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Rollout id keyed by rollout name. Enforces unique names.
pub const ROLLOUT_NAMES: TableDefinition<&str, u64> = TableDefinition::new("rollout_names");

/// Rollout groups keyed by `{group_id}`.
pub const ROLLOUT_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_groups");

/// Membership slots keyed by `{group_id}:{target_id}`.
pub const GROUP_MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_members");

/// Actions keyed by `{action_id}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// Current status name keyed by `{group_id}:{action_id}`. Count index for aggregation.
pub const GROUP_ACTIONS: TableDefinition<&str, &str> = TableDefinition::new("group_actions");

/// Append-only status history keyed by `{action_id}:{seq}`.
pub const ACTION_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("action_status");

/// Id of the single non-terminal action, keyed by target id.
pub const ACTIVE_ACTIONS: TableDefinition<&str, u64> = TableDefinition::new("active_actions");

/// Id of the most recently created action, keyed by target id.
pub const LATEST_ACTIONS: TableDefinition<&str, u64> = TableDefinition::new("latest_actions");

/// Parked assignments keyed by target id.
pub const PENDING_ASSIGNMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_assignments");

/// Id sequences keyed by entity name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
