//! File-backed registry shared between processes
//!
//! One file per circuit id inside a directory (ideally on tmpfs such as
//! `/dev/shm`). Every write goes to a private temporary file first:
//! - `set` renames it over the key (atomic replace)
//! - `insert_if_absent` hard-links it to the key, which fails atomically if
//!   the key already exists

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tova_core::{CircuitId, Result, TovaError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::CircuitRegistry;

const TMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    /// Open (creating if needed) the registry rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!("Circuit registry at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TovaError::Registry(format!("invalid circuit id: {:?}", id)));
        }
        Ok(self.dir.join(id))
    }

    async fn write_temp(&self, created: f64) -> Result<PathBuf> {
        let tmp = self.dir.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        fs::write(&tmp, created.to_string()).await?;
        Ok(tmp)
    }

    async fn read_value(path: &Path) -> Result<Option<f64>> {
        match fs::read_to_string(path).await {
            Ok(raw) => raw.trim().parse::<f64>().map(Some).map_err(|e| {
                TovaError::Registry(format!("corrupt entry {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CircuitRegistry for FileRegistry {
    async fn get(&self, id: &str) -> Result<Option<f64>> {
        Self::read_value(&self.key_path(id)?).await
    }

    async fn set(&self, id: &str, created: f64) -> Result<()> {
        let target = self.key_path(id)?;
        let tmp = self.write_temp(created).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn insert_if_absent(&self, id: &str, created: f64) -> Result<bool> {
        let target = self.key_path(id)?;
        let tmp = self.write_temp(created).await?;
        let linked = fs::hard_link(&tmp, &target).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            warn!("Failed to remove registry temp file {}: {}", tmp.display(), e);
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.key_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn entries(&self) -> Result<Vec<(CircuitId, f64)>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match Self::read_value(&entry.path()).await {
                Ok(Some(created)) => entries.push((name, created)),
                // Deleted between listing and reading
                Ok(None) => {}
                Err(TovaError::Registry(msg)) => {
                    warn!("Dropping unreadable registry entry: {}", msg);
                    if let Err(e) = fs::remove_file(entry.path()).await {
                        warn!("Failed to remove {}: {}", entry.path().display(), e);
                    }
                }
                Err(e) => warn!("Skipping registry entry {}: {}", name, e),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(temp_dir.path().join("circuits"))
            .await
            .unwrap();

        assert_eq!(registry.get("12").await.unwrap(), None);
        registry.set("12", 1700000000.5).await.unwrap();
        assert_eq!(registry.get("12").await.unwrap(), Some(1700000000.5));

        registry.delete("12").await.unwrap();
        assert_eq!(registry.get("12").await.unwrap(), None);
        // Deleting twice is fine
        registry.delete("12").await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_if_absent_never_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(temp_dir.path()).await.unwrap();

        assert!(registry.insert_if_absent("7", 10.0).await.unwrap());
        assert!(!registry.insert_if_absent("7", 99.0).await.unwrap());
        assert_eq!(registry.get("7").await.unwrap(), Some(10.0));

        let entries = registry.entries().await.unwrap();
        assert_eq!(entries, vec![("7".to_string(), 10.0)]);
    }

    #[tokio::test]
    async fn test_two_handles_share_state() {
        let temp_dir = TempDir::new().unwrap();
        let manager = FileRegistry::open(temp_dir.path()).await.unwrap();
        let worker = FileRegistry::open(temp_dir.path()).await.unwrap();

        manager.set("1", 5.0).await.unwrap();
        assert!(!worker.insert_if_absent("1", 6.0).await.unwrap());
        assert!(worker.insert_if_absent("2", 6.0).await.unwrap());

        let ids: Vec<String> = manager
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(temp_dir.path()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.insert_if_absent("42", i as f64).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_does_not_hide_the_rest() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(temp_dir.path()).await.unwrap();
        registry.set("1", 5.0).await.unwrap();
        registry.set("3", 7.0).await.unwrap();
        std::fs::write(temp_dir.path().join("2"), "not-a-timestamp").unwrap();

        let entries = registry.entries().await.unwrap();
        assert_eq!(entries, vec![("1".to_string(), 5.0), ("3".to_string(), 7.0)]);
        // The bad key is gone, so a later insert can register the circuit again
        assert!(!temp_dir.path().join("2").exists());
        assert!(registry.insert_if_absent("2", 9.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FileRegistry::open(temp_dir.path()).await.unwrap();
        assert!(registry.set("../escape", 1.0).await.is_err());
        assert!(registry.get("").await.is_err());
    }
}
