use super::traits::{CheckpointStore, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Time of the last completed batch listing
pub const LAST_CHECK_KEY: &str = "lastCsvCheck";
/// Lease of the cycle currently holding the processing lock
pub const PROCESSING_KEY: &str = "processing";
/// Heartbeat of the lock holder
pub const KEEPALIVE_KEY: &str = "keepalive";
/// Batches that were listed but not yet fully processed
pub const DEFERRED_KEY: &str = "deferredBatches";

/// Holder of the processing lock as persisted under [`PROCESSING_KEY`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Typed access to the dispatcher's persisted state
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Absent means no listing has completed yet and every artifact is a candidate
    pub async fn last_check(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(raw) = self.store.get(LAST_CHECK_KEY).await? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| StorageError::Corrupt {
                key: LAST_CHECK_KEY.to_string(),
                message: e.to_string(),
            })
    }

    pub async fn set_last_check(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.store.set(LAST_CHECK_KEY, &at.to_rfc3339()).await
    }

    pub async fn deferred(&self) -> Result<BTreeSet<String>, StorageError> {
        match self.store.get(DEFERRED_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                key: DEFERRED_KEY.to_string(),
                message: e.to_string(),
            }),
            None => Ok(BTreeSet::new()),
        }
    }

    pub async fn set_deferred(&self, names: &BTreeSet<String>) -> Result<(), StorageError> {
        if names.is_empty() {
            return self.store.remove(DEFERRED_KEY).await;
        }
        let raw = serde_json::to_string(names).map_err(|e| StorageError::Corrupt {
            key: DEFERRED_KEY.to_string(),
            message: e.to_string(),
        })?;
        self.store.set(DEFERRED_KEY, &raw).await
    }

    /// Current lease, if any. A value that does not decode is reported as corrupt
    pub async fn lease(&self) -> Result<Option<Lease>, StorageError> {
        let Some(raw) = self.store.get(PROCESSING_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: PROCESSING_KEY.to_string(),
                message: e.to_string(),
            })
    }

    pub async fn set_lease(&self, lease: &Lease) -> Result<(), StorageError> {
        let raw = serde_json::to_string(lease).map_err(|e| StorageError::Corrupt {
            key: PROCESSING_KEY.to_string(),
            message: e.to_string(),
        })?;
        self.store.set(PROCESSING_KEY, &raw).await
    }

    pub async fn clear_lease(&self) -> Result<(), StorageError> {
        self.store.remove(PROCESSING_KEY).await?;
        self.store.remove(KEEPALIVE_KEY).await
    }

    pub async fn touch_keepalive(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.store.set(KEEPALIVE_KEY, &at.to_rfc3339()).await
    }
}
