//! JSON snapshots of the in-memory backend, written atomically.

use super::{InMemoryBackend, StoredRow};
use crate::core::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub format_version: u16,
    pub created_at: DateTime<Utc>,
    pub rows: Vec<StoredRow>,
}

impl InMemoryBackend {
    /// Writes every row to `path` through a temporary file renamed in place.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = BackendSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at: Utc::now(),
            rows: self.dump().await,
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let path = path.as_ref().to_path_buf();

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|err| EngineError::unexpected(format!("snapshot writer join: {}", err)))?
    }

    /// Opens a backend from a snapshot; a missing file yields an empty backend.
    pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let backend = Self::new();
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            return Ok(backend);
        }

        let bytes = tokio::fs::read(path).await?;
        let snapshot: BackendSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(EngineError::unexpected(format!(
                "unsupported snapshot format {} in {}",
                snapshot.format_version,
                path.display()
            )));
        }
        backend.restore(snapshot.rows).await;
        Ok(backend)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| EngineError::from(err.error))?;
    Ok(())
}
