// ============================================================================
// Object storage for file bytes
// ============================================================================
//
// Used only after commit (phase3) or by GC steps, never inside a versioned
// transaction. Deletions are idempotent: removing a missing file succeeds.
// ============================================================================

use crate::core::{EngineError, Id, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, owner: i64, file: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, owner: i64, file: &str) -> Result<Option<Vec<u8>>>;

    async fn delete_files(&self, owner: i64, files: &[String]) -> Result<()>;

    /// Removes every file stored under `owner`.
    async fn delete_all(&self, owner: i64) -> Result<()>;
}

fn check_file_name(file: &str) -> Result<()> {
    if file.is_empty() || file.contains(['/', '\\']) || file == "." || file == ".." {
        return Err(EngineError::functional(
            crate::core::codes::BAD_ARGUMENTS,
            format!("invalid file name '{}'", file),
        ));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryObjectStorage {
    files: Mutex<BTreeMap<(i64, String), Vec<u8>>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_count(&self, owner: i64) -> usize {
        self.files
            .lock()
            .map(|files| files.keys().filter(|(o, _)| *o == owner).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, owner: i64, file: &str, bytes: Vec<u8>) -> Result<()> {
        check_file_name(file)?;
        self.files.lock()?.insert((owner, file.to_string()), bytes);
        Ok(())
    }

    async fn get(&self, owner: i64, file: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock()?.get(&(owner, file.to_string())).cloned())
    }

    async fn delete_files(&self, owner: i64, files: &[String]) -> Result<()> {
        let mut store = self.files.lock()?;
        for file in files {
            store.remove(&(owner, file.clone()));
        }
        Ok(())
    }

    async fn delete_all(&self, owner: i64) -> Result<()> {
        self.files.lock()?.retain(|(o, _), _| *o != owner);
        Ok(())
    }
}

/// Files laid out as `root/<ns>/<owner>/<file>`.
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn owner_dir(&self, owner: i64) -> PathBuf {
        self.root
            .join(Id::ns(owner).to_string())
            .join(owner.to_string())
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, owner: i64, file: &str, bytes: Vec<u8>) -> Result<()> {
        check_file_name(file)?;
        let dir = self.owner_dir(owner);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(file), bytes).await?;
        Ok(())
    }

    async fn get(&self, owner: i64, file: &str) -> Result<Option<Vec<u8>>> {
        check_file_name(file)?;
        match tokio::fs::read(self.owner_dir(owner).join(file)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_files(&self, owner: i64, files: &[String]) -> Result<()> {
        let dir = self.owner_dir(owner);
        for file in files {
            check_file_name(file)?;
            match tokio::fs::remove_file(dir.join(file)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn delete_all(&self, owner: i64) -> Result<()> {
        match tokio::fs::remove_dir_all(self.owner_dir(owner)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
