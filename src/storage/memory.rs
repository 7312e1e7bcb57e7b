use super::traits::{ArtifactInfo, ArtifactStore, CheckpointStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Artifact store held in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an artifact with an explicit modification time
    pub fn insert(&self, name: &str, content: impl Into<Vec<u8>>, last_modified: DateTime<Utc>) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.insert(name.to_string(), (content.into(), last_modified));
        }
    }

    /// Every stored key, sorted
    pub fn names(&self) -> Vec<String> {
        self.artifacts
            .lock()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .ok()
            .and_then(|a| a.get(name).map(|(content, _)| content.clone()))
    }

    fn guard(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>, StorageError>
    {
        self.artifacts
            .lock()
            .map_err(|_| StorageError::Database("artifact map poisoned".to_string()))
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactInfo>, StorageError> {
        let artifacts = self.guard()?;
        Ok(artifacts
            .iter()
            .filter(|(name, _)| {
                name.strip_prefix(prefix)
                    .map(|rest| !rest.contains('/'))
                    .unwrap_or(false)
            })
            .map(|(name, (_, modified))| ArtifactInfo {
                name: name.clone(),
                last_modified: *modified,
            })
            .collect())
    }

    async fn get_content(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.guard()?
            .get(name)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn put(&self, name: &str, content: &[u8]) -> Result<(), StorageError> {
        self.guard()?
            .insert(name.to_string(), (content.to_vec(), Utc::now()));
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.guard()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.guard()?.contains_key(name))
    }
}

/// Checkpoint store held in memory
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.values
            .lock()
            .map_err(|_| StorageError::Database("checkpoint map poisoned".to_string()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.guard()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.guard()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.guard()?.remove(key);
        Ok(())
    }
}
