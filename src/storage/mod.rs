pub mod checkpoint;
pub mod duckdb;
pub mod fs;
pub mod memory;
pub mod traits;

pub use checkpoint::{CheckpointManager, Lease};
pub use duckdb::DuckDbStore;
pub use fs::FsArtifactStore;
pub use memory::{MemoryArtifactStore, MemoryCheckpointStore};
pub use traits::{ArtifactInfo, ArtifactStore, CheckpointStore, StorageError, TemplateStore};
