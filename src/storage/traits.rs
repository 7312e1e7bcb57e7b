use crate::render::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact key '{0}'")]
    InvalidKey(String),

    #[error("corrupt stored value for '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("state database is locked by running process {pid}")]
    Locked { pid: u32 },

    #[error("service request failed: {0}")]
    Remote(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Listing entry of an artifact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

/// Key-addressed blob store holding batch files and their outputs.
/// Keys are `/`-separated paths such as `send/batch.csv`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Artifacts directly under `prefix`, sorted by name
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactInfo>, StorageError>;

    async fn get_content(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or replace the artifact `name`
    async fn put(&self, name: &str, content: &[u8]) -> Result<(), StorageError>;

    async fn remove(&self, name: &str) -> Result<(), StorageError>;

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        match self.get_content(name).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move an artifact to a new key
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let content = self.get_content(from).await?;
        self.put(to, &content).await?;
        self.remove(from).await
    }
}

/// Read access to message templates plus the minimal management the CLI needs
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StorageError>;

    async fn list_templates(&self) -> Result<Vec<Template>, StorageError>;

    async fn put_template(&self, template: &Template) -> Result<(), StorageError>;

    /// Returns whether a template was removed
    async fn remove_template(&self, id: &str) -> Result<bool, StorageError>;
}

/// Small string key-value state that survives restarts
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}
