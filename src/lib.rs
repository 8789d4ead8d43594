//! Content-addressed, generationally-versioned blob-store snapshot
//! repository core for sharded search indices. See `SPEC_FULL.md` at the
//! workspace root for the full system description; this crate implements
//! the storage-format and concurrency logic only -- it has no network,
//! cluster-membership, or index-engine code of its own. Hosts wire a
//! [`blob_store::BlobContainer`] and a [`metadata_store::MetadataStore`]
//! implementation and drive everything else through [`repository::Repository`].

pub mod backends;
pub mod blob_store;
pub mod clone;
pub mod codec;
pub mod config;
pub mod delete;
pub mod error;
pub mod finalize;
pub mod gc;
pub mod generation;
pub mod loader;
pub mod metadata_store;
pub mod naming;
pub mod rate_limiter;
pub mod repository;
pub mod repository_data;
pub mod restore;
pub mod shard_snapshot;
pub mod task_runner;

pub use blob_store::{BlobContainer, BlobReader, BlobWriter, ChildEntry, Purpose};
pub use clone::{clone_shard, CloneShardOutcome};
pub use config::{DynamicSettings, DynamicSettingsValues, RepositoryConfig};
pub use delete::{CleanupOperation, DeleteOutcome, DeletePipeline, DeleteSnapshotsRequest, IndexShardLayout};
pub use error::{RepositoryError, Result};
pub use finalize::{FinalizeOrchestrator, FinalizeSnapshotOutcome, FinalizeSnapshotRequest, IndexFinalizeEntry};
pub use generation::{ConsistencyMode, Generation, GenerationTracker};
pub use loader::RepositoryDataLoader;
pub use metadata_store::{MetadataStore, RepositoryMetadataState, UpdateFn};
pub use repository::{BlobContainerFactory, Repository, RepositoryPools, VerificationHandle};
pub use repository_data::{
    FileInfo, IndexId, RepositoryData, RepositoryShardId, ShardGeneration, ShardSnapshotEntry, ShardSnapshotSet,
    SnapshotDetails, SnapshotId, SnapshotManifest, SnapshotState,
};
pub use restore::{content_checksum, restore_shard, OngoingRestores, RestoreShardOutcome, RestoreShardRequest, RestoreTarget};
pub use shard_snapshot::{
    snapshot_shard, PhysicalFile, ShardSnapshotOutcome, ShardSnapshotRequest, ShardSnapshotStatus, ShardSource,
};
pub use task_runner::TaskRunner;
