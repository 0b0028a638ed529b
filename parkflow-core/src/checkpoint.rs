//! Checkpoint/recovery: persists the pairing of (state snapshot, last fully
//! processed batch) as one JSON document. A commit writes to a scratch file,
//! fsyncs, and renames over the previous checkpoint, so a reader either sees
//! the complete new checkpoint or the complete old one, never a mix.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::Error;
use crate::state::StateEntry;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const SCRATCH_FILE: &str = "checkpoint.json.tmp";

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    batch_id: u64,
    entries: Vec<(String, StateEntry)>,
}

/// Single-writer by construction: only the forwarder commits.
pub(crate) struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub(crate) async fn new(dir: impl Into<PathBuf>) -> crate::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Checkpoint(format!("Creating {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    /// Atomically persist the snapshot tagged with the id of the last fully
    /// processed batch.
    pub(crate) async fn commit(
        &self,
        batch_id: u64,
        entries: Vec<(String, StateEntry)>,
    ) -> crate::Result<()> {
        let data = CheckpointData { batch_id, entries };
        let buf = serde_json::to_vec(&data)
            .map_err(|e| Error::Checkpoint(format!("Serializing checkpoint: {e}")))?;

        let scratch = self.dir.join(SCRATCH_FILE);
        let mut file = fs::File::create(&scratch)
            .await
            .map_err(|e| Error::Checkpoint(format!("Creating {}: {}", scratch.display(), e)))?;
        file.write_all(&buf)
            .await
            .map_err(|e| Error::Checkpoint(format!("Writing {}: {}", scratch.display(), e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Checkpoint(format!("Syncing {}: {}", scratch.display(), e)))?;

        fs::rename(&scratch, self.dir.join(CHECKPOINT_FILE))
            .await
            .map_err(|e| Error::Checkpoint(format!("Publishing checkpoint: {e}")))?;
        Ok(())
    }

    /// Read back the last committed checkpoint, if any. Called once while the
    /// pipeline is restoring.
    pub(crate) async fn restore(&self) -> crate::Result<Option<(u64, Vec<(String, StateEntry)>)>> {
        let path = self.dir.join(CHECKPOINT_FILE);
        let buf = match fs::read(&path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Checkpoint(format!(
                    "Reading {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let data: CheckpointData = serde_json::from_slice(&buf)
            .map_err(|e| Error::Checkpoint(format!("Decoding checkpoint: {e}")))?;

        info!(
            batch_id = data.batch_id,
            entries = data.entries.len(),
            "Restored checkpoint"
        );
        Ok(Some((data.batch_id, data.entries)))
    }
}
