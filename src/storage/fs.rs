use super::traits::{ArtifactInfo, ArtifactStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};

/// Artifact store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(name.trim_start_matches('/'));
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn not_found_or_io(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(e)
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactInfo>, StorageError> {
        // "send/" lists the directory send, "send/2024" lists files in send starting with 2024
        let (dir_key, file_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..idx + 1], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let dir = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_key.trim_end_matches('/'))?
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.starts_with(file_prefix) || file_name.starts_with('.') {
                continue;
            }
            artifacts.push(ArtifactInfo {
                name: format!("{}{}", dir_key, file_name),
                last_modified: DateTime::<Utc>::from(metadata.modified()?),
            });
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    async fn get_content(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| not_found_or_io(name, e))
    }

    async fn put(&self, name: &str, content: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        ensure_parent(&path).await?;

        // Write beside the target and rename so readers never see a partial file
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::InvalidKey(name.to_string()))?;
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(name, e))
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.path_for(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.path_for(from)?;
        let target = self.path_for(to)?;
        ensure_parent(&target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| not_found_or_io(from, e))
    }
}
