use crate::error::RebindError;
use crate::snapshot::config::SnapshotConfig;
use crate::snapshot::rebind::{RebindEngine, SaveSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};


/// Runs periodic saves through the rebind engine
pub struct SnapshotManager {
    engine: Arc<RebindEngine>,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(engine: Arc<RebindEngine>, config: SnapshotConfig) -> Self {
        Self { engine, config }
    }

    /// Run background snapshot loop
    ///
    /// Periodically saves and cleans up old snapshots.
    /// Runs until the task is cancelled.
    pub async fn run_snapshot_loop(&self) {
        if !self.config.enabled {
            info!("Snapshot manager disabled, exiting loop");
            return;
        }

        info!(
            interval_minutes = self.config.interval_minutes,
            directory = %self.config.directory.display(),
            keep_count = self.config.keep_count,
            "Starting snapshot manager"
        );

        let period = Duration::from_secs(self.config.interval_minutes.max(1) * 60);
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately; nothing worth saving yet
        timer.tick().await;

        loop {
            timer.tick().await;

            match self.create_and_save_snapshot() {
                Ok(_) => {}
                Err(RebindError::Busy(state)) => {
                    info!(state = %state, "Rebind engine busy, skipping snapshot");
                }
                Err(e) => error!(error = %e, "Failed to create snapshot"),
            }
        }
    }

    /// Save once, then apply retention
    pub fn create_and_save_snapshot(&self) -> Result<SaveSummary, RebindError> {
        let summary = self.engine.save()?;

        info!(
            entities = summary.entities,
            path = %summary.path.display(),
            "Snapshot saved"
        );

        self.engine.store().cleanup(self.config.keep_count)?;
        Ok(summary)
    }
}
