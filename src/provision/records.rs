use crate::errors;
use crate::provision::types::{RecordId, TunnelRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: TunnelRecord) -> Result<()>;
    async fn list(&self) -> Result<Vec<TunnelRecord>>;
    async fn get(&self, id: RecordId) -> Result<Option<TunnelRecord>>;
    async fn delete(&self, id: RecordId) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    tunnels: Vec<TunnelRecord>,
}

fn default_version() -> u32 {
    1
}

/// Records kept in one YAML document, rewritten atomically on every change.
pub struct FileRecordStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RecordFile> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let file: RecordFile = serde_yaml::from_str(&contents).with_context(|| {
                    errors::records::corrupted(&self.path.display().to_string())
                })?;
                anyhow::ensure!(
                    file.version == 1,
                    errors::records::unsupported_version(file.version)
                );
                Ok(file)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RecordFile {
                version: default_version(),
                tunnels: Vec::new(),
            }),
            Err(e) => Err(e).with_context(|| {
                errors::records::failed_to_read(&self.path.display().to_string())
            }),
        }
    }

    // Atomic write with temp file
    async fn store(&self, file: &RecordFile) -> Result<()> {
        let yaml_content =
            serde_yaml::to_string(file).context(errors::records::FAILED_TO_SERIALIZE)?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).await.with_context(|| {
            errors::records::failed_to_create_dir(&parent.display().to_string())
        })?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, yaml_content.as_bytes())
            .await
            .with_context(|| errors::records::failed_to_write_temp(&tmp_path.display().to_string()))
            .map_err(|e| {
                if format!("{:#}", e).contains("No space left on device") {
                    anyhow::anyhow!(errors::disk::FULL)
                } else {
                    e
                }
            })?;

        #[cfg(unix)]
        {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&tmp_path)
                .await
                .context(errors::records::FAILED_TO_OPEN_TEMP)?;
            file.sync_all()
                .await
                .context(errors::records::FAILED_TO_FSYNC)?;
        }

        fs::rename(&tmp_path, &self.path).await.with_context(|| {
            errors::records::failed_to_rename(
                &tmp_path.display().to_string(),
                &self.path.display().to_string(),
            )
        })?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn save(&self, record: TunnelRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        let name = record.name.clone();
        match file.tunnels.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => file.tunnels.push(record),
        }
        self.store(&file).await.context(errors::records::SAVE_FAILED)?;
        tracing::info!("Saved tunnel record: {}", name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TunnelRecord>> {
        Ok(self.load().await?.tunnels)
    }

    async fn get(&self, id: RecordId) -> Result<Option<TunnelRecord>> {
        Ok(self.load().await?.tunnels.into_iter().find(|r| r.id == id))
    }

    async fn delete(&self, id: RecordId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        let before = file.tunnels.len();
        file.tunnels.retain(|r| r.id != id);
        if file.tunnels.len() == before {
            return Ok(false);
        }
        self.store(&file).await.context(errors::records::SAVE_FAILED)?;
        tracing::info!("Deleted tunnel record {}", id);
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<TunnelRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<TunnelRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!(errors::records::LOCK_POISONED))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: TunnelRecord) -> Result<()> {
        let mut records = self.lock()?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TunnelRecord>> {
        Ok(self.lock()?.clone())
    }

    async fn get(&self, id: RecordId) -> Result<Option<TunnelRecord>> {
        Ok(self.lock()?.iter().find(|r| r.id == id).cloned())
    }

    async fn delete(&self, id: RecordId) -> Result<bool> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::types::{BackendKind, TunnelConfig};

    fn sample(port: u16) -> TunnelRecord {
        TunnelRecord::from_config(
            TunnelConfig::new(BackendKind::Backhaul, port, "tcp").with_option("nodelay", true),
        )
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tunnels.yaml");

        let record = sample(443);
        let id = record.id;
        FileRecordStore::new(&path).save(record.clone()).await.unwrap();

        let reopened = FileRecordStore::new(&path);
        let loaded = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(reopened.list().await.unwrap().len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_save_replaces_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::new(dir.path().join("tunnels.yaml"));

        let mut record = sample(443);
        store.save(record.clone()).await.unwrap();
        record.listen_port = 8443;
        store.save(record.clone()).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].listen_port, 8443);
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::new(dir.path().join("tunnels.yaml"));
        let record = sample(443);
        store.save(record.clone()).await.unwrap();

        assert!(store.delete(record.id).await.unwrap());
        assert!(!store.delete(record.id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupted_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.yaml");
        std::fs::write(&path, "tunnels: [this is: not: valid").unwrap();

        let result = FileRecordStore::new(&path).list().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Corrupted"));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryRecordStore::new();
        let record = sample(80);
        store.save(record.clone()).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), Some(record.clone()));
        assert!(store.delete(record.id).await.unwrap());
        assert!(store.get(record.id).await.unwrap().is_none());
    }
}
