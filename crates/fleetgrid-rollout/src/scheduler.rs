//! Periodic driver for [`RolloutEngine::evaluate_running`].

use std::time::Duration;

use fleet_core::FleetConfig;
use tracing::info;

use crate::engine::{RolloutEngine, TickReport};

pub struct RolloutScheduler {
    engine: RolloutEngine,
    interval: Duration,
    batch_size: usize,
}

impl RolloutScheduler {
    pub fn new(engine: RolloutEngine, interval: Duration) -> Self {
        let batch_size = engine.settings().activation_batch_size;
        Self {
            engine,
            interval,
            batch_size,
        }
    }

    pub fn from_config(engine: RolloutEngine, config: &FleetConfig) -> Self {
        Self::new(
            engine,
            Duration::from_secs(config.scheduler.tick_interval_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one evaluation pass on the blocking pool.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        let engine = self.engine.clone();
        let batch_size = self.batch_size;
        let report =
            tokio::task::spawn_blocking(move || engine.evaluate_running(batch_size)).await??;
        Ok(report)
    }

    /// Run the tick loop until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "rollout scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.tick().await {
                        Ok(report) if report.failures > 0 => {
                            tracing::warn!(failures = report.failures, "rollout tick had failures");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "rollout tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }
}
