use crate::entity::EntityId;
use crate::error::RebindError;
use crate::snapshot::{EntityMemento, Manifest, SnapshotSet, SCHEMA_VERSION};
use anyhow::{bail, Context};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const MANIFEST_FILE: &str = "manifest.json";
const MEMENTO_DIR: &str = "mementos";

/// A snapshot read back from disk.
///
/// Each memento is read independently; an unreadable one carries the reason
/// instead of failing the whole load.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub manifest: Manifest,
    pub mementos: Vec<(EntityId, Result<EntityMemento, String>)>,
}

impl LoadedSnapshot {
    pub fn entity_count(&self) -> usize {
        self.manifest.entity_ids.len()
    }
}

/// Snapshot directories under one root
///
/// Layout:
/// ```text
/// <root>/snapshot-20260212T153045.123Z/
///     manifest.json
///     mementos/<entity id>.json.gz
/// ```
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a snapshot atomically.
    ///
    /// Everything is staged in a hidden `.tmp` directory, the manifest last
    /// (temp file, fsync, rename), and the directory is renamed into place.
    /// On failure the staging directory is removed.
    pub fn write(&self, set: &SnapshotSet) -> Result<PathBuf, RebindError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| RebindError::io("Failed to create snapshot directory", e))?;

        let final_path = self.next_snapshot_path();
        let name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("snapshot")
            .to_string();
        let staging = self.root.join(format!(".{}.tmp", name));

        match self.write_staged(&staging, set) {
            Ok(()) => {}
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!(
                        path = %staging.display(),
                        error = %cleanup,
                        "Failed to remove staging directory"
                    );
                }
                return Err(RebindError::io("Failed to write snapshot", e));
            }
        }

        if let Err(e) = fs::rename(&staging, &final_path) {
            let _ = fs::remove_dir_all(&staging);
            return Err(RebindError::io("Failed to publish snapshot directory", e));
        }

        info!(
            path = %final_path.display(),
            entities = set.entity_count(),
            "Snapshot written"
        );
        Ok(final_path)
    }

    fn write_staged(&self, staging: &Path, set: &SnapshotSet) -> std::io::Result<()> {
        let memento_dir = staging.join(MEMENTO_DIR);
        fs::create_dir_all(&memento_dir)?;

        for memento in &set.mementos {
            let json = serde_json::to_vec(memento)?;
            let file = File::create(memento_dir.join(memento_file_name(memento.id)))?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&json)?;
            let file = encoder.finish()?;
            file.sync_all()?;
        }

        // Manifest last
        let json = serde_json::to_vec_pretty(&set.manifest)?;
        let tmp_path = staging.join(format!("{}.tmp", MANIFEST_FILE));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, staging.join(MANIFEST_FILE))?;

        Ok(())
    }

    /// Read and validate the manifest of one snapshot directory
    pub fn read_manifest(&self, snapshot: &Path) -> Result<Manifest, RebindError> {
        let path = snapshot.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RebindError::SnapshotCorrupt(format!(
                    "{} has no manifest",
                    snapshot.display()
                )));
            }
            Err(e) => return Err(RebindError::io("Failed to read manifest", e)),
        };

        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            RebindError::SnapshotCorrupt(format!("unreadable manifest {}: {}", path.display(), e))
        })?;

        if manifest.schema_version != SCHEMA_VERSION {
            return Err(RebindError::SnapshotCorrupt(format!(
                "manifest schema version {} (expected {})",
                manifest.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Read one memento; its id must match the file it came from
    pub fn read_memento(&self, snapshot: &Path, id: EntityId) -> anyhow::Result<EntityMemento> {
        let path = snapshot.join(MEMENTO_DIR).join(memento_file_name(id));
        let file = File::open(&path)
            .with_context(|| format!("Failed to open memento {}", path.display()))?;

        let mut json = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut json)
            .context("Failed to decompress memento")?;
        let memento: EntityMemento =
            serde_json::from_str(&json).context("Failed to deserialize memento JSON")?;

        if memento.id != id {
            bail!("memento file for {} contains entity {}", id, memento.id);
        }
        Ok(memento)
    }

    /// Read a whole snapshot. Only the manifest must be valid.
    pub fn load(&self, snapshot: &Path) -> Result<LoadedSnapshot, RebindError> {
        let manifest = self.read_manifest(snapshot)?;

        let mementos = manifest
            .entity_ids
            .iter()
            .map(|id| {
                let outcome = self.read_memento(snapshot, *id).map_err(|e| {
                    warn!(entity_id = %id, error = %e, "Unreadable memento");
                    format!("{:#}", e)
                });
                (*id, outcome)
            })
            .collect();

        debug!(
            path = %snapshot.display(),
            entities = manifest.entity_ids.len(),
            "Snapshot read"
        );

        Ok(LoadedSnapshot {
            path: snapshot.to_path_buf(),
            manifest,
            mementos,
        })
    }

    /// Published snapshot directories, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>, RebindError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.root)
            .map_err(|e| RebindError::io("Failed to read snapshot directory", e))?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RebindError::io("Failed to read directory entry", e))?;
            let path = entry.path();

            // Staging directories start with '.' and never match
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with("snapshot-") {
                        snapshots.push(path);
                    }
                }
            }
        }

        // Timestamped names sort chronologically
        snapshots.sort();
        Ok(snapshots)
    }

    /// Delete old snapshots, keeping only the most recent `keep_count`
    pub fn cleanup(&self, keep_count: usize) -> Result<usize, RebindError> {
        let snapshots = self.list_snapshots()?;
        if snapshots.len() <= keep_count {
            return Ok(0);
        }

        let delete_count = snapshots.len() - keep_count;
        let mut deleted = 0;
        for path in &snapshots[..delete_count] {
            if let Err(e) = fs::remove_dir_all(path) {
                error!(error = %e, path = %path.display(), "Failed to delete old snapshot");
            } else {
                info!(path = %path.display(), "Deleted old snapshot");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn next_snapshot_path(&self) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut suffix = 0;
        let mut path = self.root.join(snapshot_dir_name(&timestamp, suffix));
        while path.exists() {
            suffix += 1;
            path = self.root.join(snapshot_dir_name(&timestamp, suffix));
        }
        path
    }
}

/// Format: snapshot-{timestamp}, e.g. snapshot-20260212T153045.123Z.
/// Saves within the same millisecond get a zero-padded suffix so names
/// still sort in write order.
pub(crate) fn snapshot_dir_name(timestamp: &str, suffix: u32) -> String {
    if suffix == 0 {
        format!("snapshot-{}", timestamp)
    } else {
        format!("snapshot-{}-{:04}", timestamp, suffix)
    }
}

fn memento_file_name(id: EntityId) -> String {
    format!("{}.json.gz", id)
}
