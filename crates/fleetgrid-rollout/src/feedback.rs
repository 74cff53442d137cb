//! Device feedback: status reports coming back from targets.
//!
//! Each report appends one history entry and overwrites the action's
//! current status (last write wins). Reports against a closed action are
//! rejected with [`FeedbackError::Gone`]. When a report closes an action,
//! the target's assignment bookkeeping is updated and any assignment
//! parked behind the action is promoted.

use std::sync::Arc;

use fleetgrid_state::{
    Action, ActionId, ActionStatus, ActionStatusEntry, StateStore, StatusUpdate, UpdateType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancellation::{CancellationCoordinator, SERVER_MESSAGE_PREFIX};
use crate::clock::Clock;
use crate::error::{FeedbackError, FeedbackResult};
use crate::selector::AssignmentRecorder;

/// Result a device attaches to a CLOSED execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Success,
    Failure,
    None,
}

/// Execution state as reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "execution", content = "result")]
pub enum DeviceExecution {
    Closed(ExecutionResult),
    Proceeding,
    Scheduled,
    Resumed,
    Canceled,
    Rejected,
    Downloaded,
    Download,
}

impl DeviceExecution {
    fn label(&self) -> &'static str {
        match self {
            Self::Closed(_) => "CLOSED",
            Self::Proceeding => "PROCEEDING",
            Self::Scheduled => "SCHEDULED",
            Self::Resumed => "RESUMED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Downloaded => "DOWNLOADED",
            Self::Download => "DOWNLOAD",
        }
    }
}

/// The entry a report produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub action: Action,
    pub entry: ActionStatusEntry,
    /// Parked assignment created because this report closed the action.
    pub promoted: Option<Action>,
}

#[derive(Clone)]
pub struct DeviceFeedback {
    store: StateStore,
    clock: Arc<dyn Clock>,
    coordinator: CancellationCoordinator,
    recorder: Arc<dyn AssignmentRecorder>,
}

impl DeviceFeedback {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        coordinator: CancellationCoordinator,
        recorder: Arc<dyn AssignmentRecorder>,
    ) -> Self {
        Self {
            store,
            clock,
            coordinator,
            recorder,
        }
    }

    /// Record a status reported by the device at `occurred_at`.
    pub fn report_status(
        &self,
        action_id: ActionId,
        status: ActionStatus,
        occurred_at: u64,
        messages: Vec<String>,
    ) -> FeedbackResult<StatusReport> {
        self.append(action_id, |action| {
            let effective = effective_status(action, status);
            let mut messages = messages;
            if effective != status {
                messages.push(format!(
                    "{SERVER_MESSAGE_PREFIX}reported {status} recorded as {effective}"
                ));
            }
            Ok(StatusUpdate {
                status: effective,
                occurred_at,
                messages,
            })
        })
    }

    /// The device fetched the action.
    pub fn register_retrieved(
        &self,
        action_id: ActionId,
        message: &str,
    ) -> FeedbackResult<StatusReport> {
        self.report_status(
            action_id,
            ActionStatus::Retrieved,
            self.clock.now_millis(),
            vec![format!("{SERVER_MESSAGE_PREFIX}{message}")],
        )
    }

    /// The device started downloading an artifact.
    pub fn register_download(
        &self,
        action_id: ActionId,
        message: &str,
    ) -> FeedbackResult<StatusReport> {
        self.report_status(
            action_id,
            ActionStatus::Download,
            self.clock.now_millis(),
            vec![format!("{SERVER_MESSAGE_PREFIX}{message}")],
        )
    }

    /// Let a downloaded SEPARATED update proceed to installation.
    pub fn confirm_start(&self, action_id: ActionId) -> FeedbackResult<StatusReport> {
        let now = self.clock.now_millis();
        self.append(action_id, |action| {
            if action.update_type != UpdateType::Separated {
                return Err(FeedbackError::NotApplicable(format!(
                    "action {action_id} is not a separated update"
                )));
            }
            if action.status != ActionStatus::Downloaded {
                return Err(FeedbackError::NotApplicable(format!(
                    "action {action_id} is {}, installation can start only after download",
                    action.status
                )));
            }
            Ok(StatusUpdate::new(
                ActionStatus::Start,
                now,
                format!("{SERVER_MESSAGE_PREFIX}installation start confirmed"),
            ))
        })
    }

    /// Translate a device execution report on an update action.
    pub fn report_execution(
        &self,
        action_id: ActionId,
        execution: DeviceExecution,
        details: Vec<String>,
    ) -> FeedbackResult<StatusReport> {
        let (status, note) = match execution {
            DeviceExecution::Canceled => (ActionStatus::Canceled, "Target confirmed cancelation."),
            DeviceExecution::Rejected => (ActionStatus::Warning, "Target REJECTED update."),
            DeviceExecution::Closed(ExecutionResult::Failure) => {
                (ActionStatus::Error, "Target reported CLOSED with ERROR!")
            }
            DeviceExecution::Closed(_) => (ActionStatus::Finished, "Target reported CLOSED with OK!"),
            DeviceExecution::Downloaded => (ActionStatus::Downloaded, "Target reported DOWNLOADED"),
            DeviceExecution::Download => (ActionStatus::Download, "Target reported DOWNLOAD"),
            DeviceExecution::Proceeding | DeviceExecution::Scheduled | DeviceExecution::Resumed => {
                (ActionStatus::Running, "")
            }
        };
        let mut messages = vec![if note.is_empty() {
            format!("{SERVER_MESSAGE_PREFIX}Target reported {}", execution.label())
        } else {
            format!("{SERVER_MESSAGE_PREFIX}{note}")
        }];
        messages.extend(details);
        self.report_status(action_id, status, self.clock.now_millis(), messages)
    }

    /// Translate a device's answer to a cancellation request.
    ///
    /// Only valid while the action is CANCELING.
    pub fn report_cancel_execution(
        &self,
        action_id: ActionId,
        execution: DeviceExecution,
        details: Vec<String>,
    ) -> FeedbackResult<StatusReport> {
        let now = self.clock.now_millis();
        self.append(action_id, |action| {
            if action.status != ActionStatus::Canceling {
                return Err(FeedbackError::NotApplicable(format!(
                    "action {action_id} has no cancellation in progress"
                )));
            }
            let (status, note) = match execution {
                DeviceExecution::Canceled => {
                    (ActionStatus::Warning, "Target reported cancelation as CANCELED.")
                }
                DeviceExecution::Rejected => {
                    (ActionStatus::Warning, "Target rejected the cancelation request.")
                }
                DeviceExecution::Closed(ExecutionResult::Failure) => {
                    (ActionStatus::Error, "Target was not able to complete cancelation.")
                }
                DeviceExecution::Closed(_) => (ActionStatus::Canceled, "Cancelation confirmed."),
                _ => (ActionStatus::Running, "Target is working on the cancelation."),
            };
            let mut messages = vec![format!("{SERVER_MESSAGE_PREFIX}{note}")];
            messages.extend(details);
            Ok(StatusUpdate {
                status,
                occurred_at: now,
                messages,
            })
        })
    }

    fn append<F>(&self, action_id: ActionId, decide: F) -> FeedbackResult<StatusReport>
    where
        F: FnOnce(&Action) -> FeedbackResult<StatusUpdate>,
    {
        let applied = self.store.update_action_status(action_id, |action: &Action| {
            if action.status.is_terminal() {
                return Err(FeedbackError::Gone {
                    action: action.id,
                    status: action.status,
                });
            }
            decide(action)
        });
        let (action, entry) = match applied {
            Ok(Some(applied)) => applied,
            Ok(None) => return Err(FeedbackError::NotFound(action_id)),
            Err(e) => {
                warn!(action = action_id, error = %e, "status report rejected");
                return Err(e);
            }
        };
        debug!(
            action = action.id,
            target_id = %action.target_id,
            status = %entry.status,
            seq = entry.seq,
            "status recorded"
        );

        let mut promoted = None;
        if entry.status.is_terminal() {
            info!(
                action = action.id,
                target_id = %action.target_id,
                status = %entry.status,
                "action closed"
            );
            if let Err(e) = self.recorder.closed(&action) {
                warn!(action = action.id, error = %e, "assignment recorder failed on close");
            }
            match self.coordinator.promote(&action.target_id) {
                Ok(action) => promoted = action,
                Err(e) => {
                    warn!(target_id = %action.target_id, error = %e, "promoting parked assignment failed")
                }
            }
        }
        Ok(StatusReport {
            action,
            entry,
            promoted,
        })
    }
}

/// Status actually recorded for a device report.
fn effective_status(action: &Action, reported: ActionStatus) -> ActionStatus {
    match (action.status, reported) {
        (ActionStatus::Start, ActionStatus::Downloaded)
            if action.update_type == UpdateType::Separated =>
        {
            ActionStatus::Start
        }
        (ActionStatus::Canceling, reported)
            if !reported.is_terminal() && reported != ActionStatus::Warning =>
        {
            ActionStatus::Canceling
        }
        _ => reported,
    }
}
