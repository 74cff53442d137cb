//! fleetgrid-state: embedded state store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for targets, rollouts, rollout groups, actions and their status
//! history.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{group_id}:{target_id}`, `{action_id}:{seq}`) enable
//! prefix range scans for related records. Invariants that span records
//! (one active action per target, optimistic versions on rollouts and
//! groups) are checked inside the write transaction that changes them.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ActionBatch, ActionCommit, StateStore, Transition};
pub use types::*;
