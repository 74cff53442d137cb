//! Outbound progress notifications.
//!
//! The engine emits a [`RolloutEvent`] after each committed lifecycle change.
//! Delivery is fire-and-forget: a sink must never block or fail the engine.

use fleetgrid_state::{GroupId, RolloutId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::aggregate::TotalTargetCountStatus;

/// Why a rollout was paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum PauseReason {
    Operator,
    GroupError { group_id: GroupId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    GroupCreated {
        rollout_id: RolloutId,
        group_id: GroupId,
        total_groups: u32,
        created_groups: u32,
    },
    RolloutReady {
        rollout_id: RolloutId,
        total_targets: u64,
    },
    CreationFailed {
        rollout_id: RolloutId,
        reason: String,
    },
    RolloutStarted {
        rollout_id: RolloutId,
    },
    GroupActivated {
        rollout_id: RolloutId,
        group_id: GroupId,
        ordinal: u32,
    },
    GroupFinished {
        rollout_id: RolloutId,
        group_id: GroupId,
        counts: TotalTargetCountStatus,
    },
    GroupErrored {
        rollout_id: RolloutId,
        group_id: GroupId,
        counts: TotalTargetCountStatus,
    },
    RolloutPaused {
        rollout_id: RolloutId,
        reason: PauseReason,
    },
    RolloutResumed {
        rollout_id: RolloutId,
    },
    RolloutFinished {
        rollout_id: RolloutId,
        counts: TotalTargetCountStatus,
    },
}

impl RolloutEvent {
    pub fn rollout_id(&self) -> RolloutId {
        match self {
            Self::GroupCreated { rollout_id, .. }
            | Self::RolloutReady { rollout_id, .. }
            | Self::CreationFailed { rollout_id, .. }
            | Self::RolloutStarted { rollout_id }
            | Self::GroupActivated { rollout_id, .. }
            | Self::GroupFinished { rollout_id, .. }
            | Self::GroupErrored { rollout_id, .. }
            | Self::RolloutPaused { rollout_id, .. }
            | Self::RolloutResumed { rollout_id }
            | Self::RolloutFinished { rollout_id, .. } => *rollout_id,
        }
    }
}

/// Receives rollout events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RolloutEvent);
}

/// Logs every event as structured JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: RolloutEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(rollout = event.rollout_id(), event = %json, "rollout event"),
            Err(e) => debug!(error = %e, "failed to encode rollout event"),
        }
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RolloutEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RolloutEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RolloutEvent) {
        if self.tx.send(event).is_err() {
            debug!("rollout event dropped, receiver closed");
        }
    }
}
