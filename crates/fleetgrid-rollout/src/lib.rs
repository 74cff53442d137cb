//! fleetgrid-rollout: staged software rollouts over a target fleet.
//!
//! A rollout splits the targets matching a filter into ordered groups and
//! moves through them one at a time:
//!
//! - [`partition`] sizes the groups and writes membership in batches.
//! - [`engine`] owns create/start/pause/resume and the scheduler tick.
//! - [`evaluator`] decides group progression from success/error thresholds.
//! - [`aggregate`] computes per-category target counts.
//! - [`cancellation`] hands a target over when a newer assignment arrives.
//! - [`feedback`] records status reports from devices.
//! - [`scheduler`] drives the tick on a tokio interval.

pub mod aggregate;
pub mod cancellation;
pub mod clock;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod feedback;
pub mod partition;
pub mod scheduler;
pub mod selector;

pub use aggregate::{AggregateScope, StatusAggregator, TargetCountCategory, TotalTargetCountStatus};
pub use cancellation::{Assignment, CancellationCoordinator, SupersedeOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    CreateRollout, EngineSettings, GroupDetails, RolloutDetails, RolloutEngine, TickReport,
};
pub use error::{FeedbackError, FeedbackResult, RolloutError, RolloutResult};
pub use evaluator::{GroupDecision, GroupProgressionEvaluator};
pub use events::{ChannelSink, EventSink, PauseReason, RolloutEvent, TracingSink};
pub use feedback::{DeviceExecution, DeviceFeedback, ExecutionResult, StatusReport};
pub use partition::{GroupPartitioner, group_sizes};
pub use scheduler::RolloutScheduler;
pub use selector::{AssignmentRecorder, TargetSelector};
