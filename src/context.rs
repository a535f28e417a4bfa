//! Management context - owns one graph, its bus and its rebind engine.
//!
//! Everything that used to be process-global lives here, with an explicit
//! `init` and `teardown`.

use crate::config::MantleConfig;
use crate::error::RebindError;
use crate::registry::TypeRegistry;
use crate::snapshot::{RebindEngine, RebindReport, SaveSummary, SnapshotManager, SnapshotStore};
use crate::state::EntityGraph;
use crate::subscription::EventBus;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound on waiting for queued deliveries during teardown
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ManagementContext {
    config: MantleConfig,
    bus: Arc<EventBus>,
    graph: Arc<EntityGraph>,
    rebind: Arc<RebindEngine>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl ManagementContext {
    /// Build the bus, graph and rebind engine.
    ///
    /// Must be called from within a tokio runtime; delivery tasks are
    /// spawned on it.
    pub fn init(config: MantleConfig, registry: TypeRegistry) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().context("Management context requires a tokio runtime")?;

        let bus = Arc::new(EventBus::new(runtime, config.bus.clone()));
        let graph = Arc::new(EntityGraph::new(bus.clone(), Arc::new(registry)));
        let store = SnapshotStore::new(config.snapshot.directory.clone());
        let rebind = Arc::new(RebindEngine::new(graph.clone(), store));

        info!(
            snapshot_dir = %config.snapshot.directory.display(),
            entity_types = graph.registry().entity_type_count(),
            "Management context initialized"
        );

        Ok(Arc::new(Self {
            config,
            bus,
            graph,
            rebind,
            snapshot_task: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &MantleConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<EntityGraph> {
        &self.graph
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn rebind(&self) -> &Arc<RebindEngine> {
        &self.rebind
    }

    /// Rebuild from the newest valid snapshot; `None` on cold start
    pub fn rebind_latest(&self) -> Result<Option<RebindReport>, RebindError> {
        let report = self.rebind.load_latest()?;
        match &report {
            Some(report) => {
                for dangling in &report.dangling {
                    warn!(
                        from = %dangling.from,
                        to = %dangling.to,
                        relation = ?dangling.relation,
                        "Dangling reference dropped"
                    );
                }
                for entry in &report.unrebindable {
                    warn!(entity_id = %entry.id, reason = %entry.reason, "Entity not rebound");
                }
            }
            None => info!("No valid snapshot found, cold start"),
        }
        Ok(report)
    }

    /// Save one snapshot now and apply retention
    pub fn save_now(&self) -> Result<SaveSummary, RebindError> {
        SnapshotManager::new(self.rebind.clone(), self.config.snapshot.clone())
            .create_and_save_snapshot()
    }

    /// Spawn the periodic snapshot loop. A second call is a no-op.
    pub fn start_snapshots(&self) {
        let mut task = self
            .snapshot_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let manager = SnapshotManager::new(self.rebind.clone(), self.config.snapshot.clone());
        *task = Some(tokio::spawn(async move {
            manager.run_snapshot_loop().await;
        }));
    }

    /// Stop snapshots, let deliveries settle, save once more if
    /// configured, then close the bus. Idempotent.
    pub async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Management context shutting down");

        let task = self
            .snapshot_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        if tokio::time::timeout(QUIESCE_TIMEOUT, self.bus.quiesce())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = QUIESCE_TIMEOUT.as_secs(),
                "Event bus did not quiesce, continuing shutdown"
            );
        }

        let saved = if self.config.rebind.save_on_shutdown {
            match self.save_now() {
                Ok(summary) => {
                    info!(entities = summary.entities, "Final snapshot saved");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Final snapshot failed");
                    Err(e).context("Failed to save final snapshot")
                }
            }
        } else {
            Ok(())
        };

        self.bus.shutdown();
        info!("Management context stopped");
        saved
    }
}
