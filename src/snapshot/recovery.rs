use crate::error::RebindError;
use crate::snapshot::store::{LoadedSnapshot, SnapshotStore};
use tracing::{error, info, warn};

/// Load the most recent valid snapshot from the store
///
/// Returns None if no snapshots exist or none has a valid manifest.
/// Tries snapshots from newest to oldest until one loads successfully.
/// Corrupt snapshots are skipped; an I/O failure stops the search.
pub fn load_latest_snapshot(store: &SnapshotStore) -> Result<Option<LoadedSnapshot>, RebindError> {
    if !store.root().exists() {
        info!(
            directory = %store.root().display(),
            "Snapshot directory does not exist, starting without snapshot"
        );
        return Ok(None);
    }

    let mut snapshots = store.list_snapshots()?;
    if snapshots.is_empty() {
        info!("No snapshots found, cold start");
        return Ok(None);
    }

    // Newest first
    snapshots.reverse();

    info!(
        count = snapshots.len(),
        directory = %store.root().display(),
        "Found {} snapshot(s), attempting to load newest",
        snapshots.len()
    );

    for path in snapshots {
        match store.load(&path) {
            Ok(snapshot) => {
                info!(
                    path = %path.display(),
                    entities = snapshot.entity_count(),
                    created_at = %snapshot.manifest.created_at,
                    "Loaded snapshot successfully"
                );
                return Ok(Some(snapshot));
            }
            Err(RebindError::SnapshotCorrupt(reason)) => {
                warn!(
                    path = %path.display(),
                    error = %reason,
                    "Invalid snapshot, trying next oldest"
                );
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read snapshot");
                return Err(e);
            }
        }
    }

    error!("No snapshot has a valid manifest, cold start");
    Ok(None)
}
