//! The repository instance (SPEC_FULL.md §2 "Repository instance" lifecycle,
//! §5 concurrency/resource model, §6 verification protocol).
//!
//! This is the crate's public entry point: it wires the generation tracker,
//! loader/writer, and the finalize/delete/clone/restore/cleanup pipelines
//! into a single lifecycle-managed object, and enforces the cross-cutting
//! rules none of those pipelines should have to repeat themselves --
//! `readonly`, `NotStarted`, and the blob-store handle's lazy, once-only
//! construction.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use uuid::Uuid;

use crate::blob_store::{reader_from_bytes, BlobContainer, Purpose};
use crate::clone::{clone_shard, CloneShardOutcome};
use crate::codec;
use crate::config::{DynamicSettings, RepositoryConfig};
use crate::delete::{CleanupOperation, DeleteOutcome, DeletePipeline, DeleteSnapshotsRequest, IndexShardLayout};
use crate::error::{RepositoryError, Result};
use crate::finalize::{FinalizeOrchestrator, FinalizeSnapshotOutcome, FinalizeSnapshotRequest};
use crate::generation::{ConsistencyMode, Generation, GenerationTracker};
use crate::loader::RepositoryDataLoader;
use crate::metadata_store::MetadataStore;
use crate::naming;
use crate::rate_limiter::ThrottleCounters;
use crate::repository_data::{RepositoryShardId, ShardGeneration};
use crate::restore::{OngoingRestores, RestoreShardOutcome, RestoreShardRequest};
use crate::task_runner::TaskRunner;

/// Lazily builds the repository root container on first use (SPEC_FULL.md
/// §5, "The blob-store handle is a singleton per repository, lazily
/// constructed behind a mutex").
pub type BlobContainerFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn BlobContainer>> + Send + Sync>;

/// The three named worker pools of SPEC_FULL.md §5: `snapshot` (heavy
/// shard-level I/O and root-data writes), `snapshot_meta` (lightweight
/// metadata loads), and `generic` (fallback, used by the stale-blob
/// cleanup sweeps and the verification protocol). The host builds these
/// externally and hands them in already sized; the core never constructs
/// a thread pool itself.
#[derive(Clone)]
pub struct RepositoryPools {
    pub snapshot: TaskRunner,
    pub snapshot_meta: TaskRunner,
    pub generic: TaskRunner,
}

impl RepositoryPools {
    pub fn new(snapshot: TaskRunner, snapshot_meta: TaskRunner, generic: TaskRunner) -> Self {
        Self { snapshot, snapshot_meta, generic }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LifecycleState {
    Created = 0,
    Started = 1,
    Stopped = 2,
    Closed = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Created,
            1 => LifecycleState::Started,
            2 => LifecycleState::Stopped,
            _ => LifecycleState::Closed,
        }
    }
}

/// A started verification round (SPEC_FULL.md §6, "Verification
/// protocol"): a random seed naming a scratch directory that every data
/// node round-trips a write/read through before `end_verification` wipes
/// it.
#[derive(Debug, Clone, Copy)]
pub struct VerificationHandle {
    pub seed: u64,
}

pub struct Repository {
    name: String,
    config: RepositoryConfig,
    dynamic_settings: DynamicSettings,
    root_factory: BlobContainerFactory,
    root: Mutex<Option<Arc<dyn BlobContainer>>>,
    metadata: Arc<dyn MetadataStore>,
    tracker: Arc<GenerationTracker>,
    pools: RepositoryPools,
    ongoing_restores: Arc<OngoingRestores>,
    throttle_counters: Arc<ThrottleCounters>,
    closing: Arc<AtomicBool>,
    close_once: AtomicBool,
    state: AtomicU8,
}

impl Repository {
    /// Construct a repository in the `Created` state. `initial_mode` is
    /// typically [`ConsistencyMode::Strict`] for a read-write repository
    /// registered in a well-known generation, [`ConsistencyMode::BestEffort`]
    /// for a read-only mount or one whose generation is not yet known
    /// (SPEC_FULL.md §4.3).
    pub fn new(
        name: impl Into<String>,
        config: RepositoryConfig,
        dynamic_settings: DynamicSettings,
        root_factory: BlobContainerFactory,
        metadata: Arc<dyn MetadataStore>,
        pools: RepositoryPools,
        initial_mode: ConsistencyMode,
    ) -> Self {
        let name = name.into();
        let tracker = Arc::new(GenerationTracker::new(initial_mode, config.cache_repository_data));
        Self {
            name,
            config,
            dynamic_settings,
            root_factory,
            root: Mutex::new(None),
            metadata,
            tracker,
            pools,
            ongoing_restores: OngoingRestores::new(),
            throttle_counters: Arc::new(ThrottleCounters::default()),
            closing: Arc::new(AtomicBool::new(false)),
            close_once: AtomicBool::new(false),
            state: AtomicU8::new(LifecycleState::Created as u8),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn dynamic_settings(&self) -> &DynamicSettings {
        &self.dynamic_settings
    }

    pub fn throttle_counters(&self) -> &Arc<ThrottleCounters> {
        &self.throttle_counters
    }

    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn err_not_started(&self) -> RepositoryError {
        RepositoryError::NotStarted { repository: self.name.clone() }
    }

    fn err_readonly(&self) -> RepositoryError {
        RepositoryError::ReadOnly { repository: self.name.clone() }
    }

    fn err_blob_store(&self, source: anyhow::Error) -> RepositoryError {
        RepositoryError::BlobStore { repository: self.name.clone(), source }
    }

    /// Lazily construct (once) and return the repository's blob-store
    /// handle. The per-repository lock here guards only this handle and
    /// is never held across I/O (SPEC_FULL.md §5, "Shared-resource
    /// policy").
    fn root(&self) -> Result<Arc<dyn BlobContainer>> {
        if self.state() != LifecycleState::Started {
            return Err(self.err_not_started());
        }
        let mut guard = self.root.lock().unwrap();
        if let Some(root) = guard.as_ref() {
            return Ok(root.clone());
        }
        let built = (self.root_factory)().map_err(|e| self.err_blob_store(e))?;
        *guard = Some(built.clone());
        Ok(built)
    }

    fn reject_if_readonly(&self) -> Result<()> {
        if self.config.readonly {
            return Err(self.err_readonly());
        }
        Ok(())
    }

    /// Start the repository: moves `Created` -> `Started` and makes the
    /// first blob-store access (and hence the loader/pipelines) valid.
    /// Idempotent from `Started`.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Created | LifecycleState::Started => {
                self.state.store(LifecycleState::Started as u8, Ordering::SeqCst);
                Ok(())
            }
            LifecycleState::Stopped | LifecycleState::Closed => Err(self.err_not_started()),
        }
    }

    /// Stop the repository: moves `Started` -> `Stopped`. Further
    /// operations fail with `NotStarted` until a fresh `Repository` is
    /// constructed -- SPEC_FULL.md does not define a `restart`.
    pub async fn stop(&self) -> Result<()> {
        self.state.store(LifecycleState::Stopped as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Signal closing and block until no shard restore remains in flight,
    /// then release the blob-store handle exactly once (SPEC_FULL.md §5,
    /// "`awaitIdle` blocks close until no ongoing restores remain" and
    /// "`doClose` closes it exactly once").
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.ongoing_restores.await_idle().await;
        if self
            .close_once
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.root.lock().unwrap() = None;
        }
        self.state.store(LifecycleState::Closed as u8, Ordering::SeqCst);
    }

    /// Blocks until no shard restore is in flight, without initiating a
    /// close.
    pub async fn await_idle(&self) {
        self.ongoing_restores.await_idle().await;
    }

    fn loader_bound_to(&self, root: Arc<dyn BlobContainer>) -> RepositoryDataLoader {
        RepositoryDataLoader::new(
            self.name.clone(),
            root,
            self.metadata.clone(),
            self.tracker.clone(),
            self.config.compress,
            self.config.support_url_repo,
        )
    }

    /// Read-only access to the current `RepositoryData` (SPEC_FULL.md
    /// §4.4). Allowed even when `readonly` is set -- only mutating
    /// operations are rejected.
    pub async fn repository_data(&self) -> Result<Arc<crate::repository_data::RepositoryData>> {
        let root = self.root()?;
        self.loader_bound_to(root).load().await
    }

    /// Run the finalize-snapshot orchestrator (SPEC_FULL.md §4.6) end to
    /// end, including scheduling (but not awaiting) the post-commit
    /// cleanup sweep.
    pub async fn finalize_snapshot(&self, req: FinalizeSnapshotRequest) -> Result<FinalizeSnapshotOutcome> {
        self.reject_if_readonly()?;
        let root = self.root()?;
        let loader = Arc::new(self.loader_bound_to(root.clone()));
        let orchestrator = FinalizeOrchestrator::new(
            self.name.clone(),
            root,
            loader,
            self.pools.snapshot.clone(),
            self.pools.generic.clone(),
            self.config.compress,
            self.config.max_number_of_snapshots,
        );
        orchestrator.finalize(req).await
    }

    /// Run the delete-snapshots pipeline (SPEC_FULL.md §4.7).
    pub async fn delete_snapshots(&self, req: DeleteSnapshotsRequest, index_layouts: Vec<IndexShardLayout>) -> Result<DeleteOutcome> {
        self.reject_if_readonly()?;
        let root = self.root()?;
        let loader = Arc::new(self.loader_bound_to(root.clone()));
        let pipeline = DeletePipeline::new(
            self.name.clone(),
            root,
            loader,
            self.config.compress,
            self.pools.snapshot.clone(),
            self.pools.generic.clone(),
        );
        pipeline.delete(req, index_layouts).await
    }

    /// Run the cleanup (garbage-collection) operation (SPEC_FULL.md §4.8).
    pub async fn cleanup(&self, expected_safe_generation: Generation, index_layouts: Vec<IndexShardLayout>) -> Result<DeleteOutcome> {
        self.reject_if_readonly()?;
        let root = self.root()?;
        let loader = Arc::new(self.loader_bound_to(root.clone()));
        let op = CleanupOperation::new(self.name.clone(), root, loader, self.pools.generic.clone());
        op.run(expected_safe_generation, index_layouts).await
    }

    /// Clone a shard-snapshot within the repository (SPEC_FULL.md §4.9).
    pub async fn clone_shard(
        &self,
        index_id: &str,
        shard: RepositoryShardId,
        source_snapshot: Uuid,
        target_snapshot: Uuid,
        prior_generation: ShardGeneration,
    ) -> Result<CloneShardOutcome> {
        self.reject_if_readonly()?;
        let root = self.root()?;
        let shard_dir = root.child(naming::INDICES_DIR).child(index_id).child(&shard.shard.to_string());
        clone_shard(shard_dir, source_snapshot, target_snapshot, prior_generation, self.config.compress)
            .await
            .map_err(|e| {
                RepositoryError::IndexShardSnapshotFailed {
                    repository: self.name.clone(),
                    index: index_id.to_string(),
                    shard: shard.shard,
                    source: e,
                }
            })
    }

    /// Restore a shard-snapshot onto a host-supplied destination
    /// (SPEC_FULL.md §4.10). Allowed even when `readonly` is set: it
    /// writes to the caller's destination store, not to this repository's
    /// blobs.
    pub async fn restore_shard(&self, index_id: &str, shard: RepositoryShardId, snapshot_uuid: Uuid, target: Arc<dyn crate::restore::RestoreTarget>) -> Result<RestoreShardOutcome> {
        let root = self.root()?;
        let shard_dir = root.child(naming::INDICES_DIR).child(index_id).child(&shard.shard.to_string());
        let req = RestoreShardRequest::new(
            index_id.to_string(),
            shard,
            shard_dir,
            snapshot_uuid,
            target,
            self.ongoing_restores.clone(),
            self.pools.snapshot.clone(),
            self.dynamic_settings.clone(),
            self.throttle_counters.clone(),
            self.closing.clone(),
        );
        crate::restore::restore_shard(req).await.map_err(|e| RepositoryError::IndexShardRestoreFailed {
            repository: self.name.clone(),
            index: index_id.to_string(),
            shard: shard.shard,
            source: e,
        })
    }

    /// `start-verification` (SPEC_FULL.md §6): pick a random seed, write a
    /// scratch `master.dat` under `{base}/tests-{seed}/` containing the
    /// seed bytes. Every data node is expected to read that blob back and
    /// write its own `data-{nodeId}.dat` via [`Self::verify_node`].
    pub async fn start_verification(&self) -> Result<VerificationHandle> {
        let root = self.root()?;
        let seed: u64 = rand::thread_rng().gen();
        let dir = root.child(&naming::verification_dir(seed));
        let bytes = seed.to_be_bytes().to_vec();
        dir.write(Purpose::SnapshotMeta, naming::VERIFICATION_MASTER_NAME, bytes.len() as u64, reader_from_bytes(bytes), true)
            .await
            .map_err(|e| self.err_blob_store(e))?;
        Ok(VerificationHandle { seed })
    }

    /// One data node's half of the verification round: read back
    /// `master.dat`, confirm it carries the expected seed, and write this
    /// node's own probe blob.
    pub async fn verify_node(&self, handle: VerificationHandle, node_id: &str) -> Result<()> {
        let root = self.root()?;
        let dir = root.child(&naming::verification_dir(handle.seed));
        let mut reader = dir
            .read(Purpose::SnapshotMeta, naming::VERIFICATION_MASTER_NAME)
            .await
            .map_err(|source| RepositoryError::RepositoryVerification {
                repository: self.name.clone(),
                node: node_id.to_string(),
                source,
            })?;
        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut raw)
            .await
            .map_err(|e| RepositoryError::RepositoryVerification {
                repository: self.name.clone(),
                node: node_id.to_string(),
                source: e.into(),
            })?;
        if raw.len() != 8 || u64::from_be_bytes(raw[..8].try_into().unwrap()) != handle.seed {
            return Err(RepositoryError::RepositoryVerification {
                repository: self.name.clone(),
                node: node_id.to_string(),
                source: anyhow::anyhow!("verification master blob did not round-trip the expected seed"),
            });
        }

        let probe = format!("probe from {}", node_id).into_bytes();
        dir.write(
            Purpose::SnapshotMeta,
            &format!("data-{}.dat", node_id),
            probe.len() as u64,
            reader_from_bytes(probe),
            true,
        )
        .await
        .map_err(|source| RepositoryError::RepositoryVerification {
            repository: self.name.clone(),
            node: node_id.to_string(),
            source,
        })
    }

    /// `end-verification` (SPEC_FULL.md §6): recursively delete the
    /// `tests-{seed}/` scratch directory.
    pub async fn end_verification(&self, handle: VerificationHandle) -> Result<()> {
        let root = self.root()?;
        let dir = root.child(&naming::verification_dir(handle.seed));
        dir.delete(Purpose::SnapshotMeta).await.map_err(|e| self.err_blob_store(e))
    }

    /// Read a snapshot-info document (`snap-{uuid}.dat`), honoring a
    /// `cancelled` callback checked before the read and before decoding
    /// (SPEC_FULL.md §5, "Cancellation": "the get-snapshot-info operation
    /// honors a `cancelled` callback").
    pub async fn get_snapshot_info<T: serde::de::DeserializeOwned>(
        &self,
        snapshot_uuid: Uuid,
        is_cancelled: impl Fn() -> bool,
    ) -> Result<T> {
        if is_cancelled() {
            return Err(RepositoryError::TaskCancelled { repository: self.name.clone() });
        }
        let root = self.root()?;
        let name = naming::snapshot_info_name(snapshot_uuid);
        let mut reader = root.read(Purpose::SnapshotMeta, &name).await.map_err(|e| {
            RepositoryError::SnapshotMissing {
                repository: self.name.clone(),
                snapshot: snapshot_uuid.to_string(),
                blob: name.clone(),
            }
            .pipe_log_source(e)
        })?;
        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut raw)
            .await
            .map_err(|e| self.err_blob_store(e.into()))?;
        if is_cancelled() {
            return Err(RepositoryError::TaskCancelled { repository: self.name.clone() });
        }
        codec::decode(&raw).map_err(RepositoryError::Codec)
    }

    /// Backend-reported usage statistics, passed through verbatim
    /// (SPEC_FULL.md §6).
    pub async fn stats(&self) -> Result<std::collections::BTreeMap<String, u64>> {
        let root = self.root()?;
        root.stats().await.map_err(|e| self.err_blob_store(e))
    }
}

impl RepositoryError {
    /// Logs a discarded inner cause at debug level and returns `self`
    /// unchanged -- used where the public error variant (e.g.
    /// `SnapshotMissing`) doesn't carry a `source` field but the original
    /// I/O error is still worth a trace for diagnosis.
    fn pipe_log_source(self, source: anyhow::Error) -> Self {
        log::debug!("{}: {}", self, source);
        self
    }
}
