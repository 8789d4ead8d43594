//! Finalize-snapshot orchestrator (SPEC_FULL.md §4.6): composes the
//! per-shard outcomes from [`crate::shard_snapshot`] with the metadata
//! writes and the three-step generational update.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::blob_store::{reader_from_bytes, BlobContainer, Purpose};
use crate::codec;
use crate::error::RepositoryError;
use crate::gc;
use crate::generation::Generation;
use crate::loader::{RepositoryDataLoader, StateFilter};
use crate::naming;
use crate::repository_data::{RepositoryData, ShardGeneration, SnapshotDetails, SnapshotId};
use crate::task_runner::TaskRunner;

/// Per-index inputs to a finalize call: the shard-generations this
/// snapshot produced for the index, plus its metadata document (written
/// either under a per-snapshot name, legacy layout, or a content-hash
/// name with cross-snapshot dedup, modern layout).
pub struct IndexFinalizeEntry {
    pub index_id: String,
    pub metadata_content_hash: String,
    pub metadata: serde_json::Value,
    pub shard_generations: Vec<ShardGeneration>,
}

pub struct FinalizeSnapshotRequest {
    pub snapshot_id: SnapshotId,
    pub details: SnapshotDetails,
    /// Opaque per-snapshot info document, persisted at root `snap-{uuid}.dat`.
    pub snapshot_info: serde_json::Value,
    /// Opaque global-metadata document, persisted at root `meta-{uuid}.dat`.
    pub global_metadata: serde_json::Value,
    pub indices: Vec<IndexFinalizeEntry>,
    pub expected_safe_generation: Generation,
    pub modern_layout: bool,
    pub state_filter: StateFilter,
}

pub struct FinalizeSnapshotOutcome {
    pub repository_data: Arc<RepositoryData>,
}

pub struct FinalizeOrchestrator {
    repository_name: String,
    root: Arc<dyn BlobContainer>,
    loader: Arc<RepositoryDataLoader>,
    task_runner: TaskRunner,
    stale_blob_runner: TaskRunner,
    compress: bool,
    max_number_of_snapshots: Option<u64>,
}

impl FinalizeOrchestrator {
    pub fn new(
        repository_name: impl Into<String>,
        root: Arc<dyn BlobContainer>,
        loader: Arc<RepositoryDataLoader>,
        task_runner: TaskRunner,
        stale_blob_runner: TaskRunner,
        compress: bool,
        max_number_of_snapshots: Option<u64>,
    ) -> Self {
        Self {
            repository_name: repository_name.into(),
            root,
            loader,
            task_runner,
            stale_blob_runner,
            compress,
            max_number_of_snapshots,
        }
    }

    fn snapshot_exception(&self, snapshot: &str, source: anyhow::Error) -> RepositoryError {
        RepositoryError::SnapshotException {
            repository: self.repository_name.clone(),
            snapshot: snapshot.to_string(),
            source,
        }
    }

    /// Run the orchestrator end to end (SPEC_FULL.md §4.6 steps 1-4).
    /// Returns once the root write has committed; the post-commit cleanup
    /// of now-obsolete blobs is scheduled on the stale-blob runner and not
    /// awaited here, matching "`onDone` fires only after this cleanup task
    /// is scheduled, never blocking on its completion."
    pub async fn finalize(&self, req: FinalizeSnapshotRequest) -> Result<FinalizeSnapshotOutcome, RepositoryError> {
        let current = self.loader.load().await?;

        if let Some(max) = self.max_number_of_snapshots {
            if current.snapshot_count() as u64 + 1 > max {
                return Err(self.snapshot_exception(
                    &req.snapshot_id.name,
                    anyhow::anyhow!(
                        "finalize would exceed max_number_of_snapshots ({} already present, limit {})",
                        current.snapshot_count(),
                        max
                    ),
                ));
            }
        }

        self.write_metadata_blobs(&req, &current).await?;

        let mut shard_generations: BTreeMap<String, Vec<ShardGeneration>> = BTreeMap::new();
        let mut new_metadata_identifiers = BTreeMap::new();
        for index in &req.indices {
            shard_generations.insert(index.index_id.clone(), index.shard_generations.clone());
            if req.modern_layout {
                new_metadata_identifiers
                    .entry(index.metadata_content_hash.clone())
                    .or_insert_with(Uuid::new_v4);
            }
        }

        let target_generation = current.generation + 1;
        let new_data = current.with_snapshot_added(
            target_generation,
            req.snapshot_id.clone(),
            req.details.clone(),
            shard_generations,
            new_metadata_identifiers,
        );

        let committed = self
            .loader
            .write(new_data, req.expected_safe_generation, req.state_filter)
            .await?;

        let shard_layouts: Vec<(String, Vec<ShardGeneration>)> =
            req.indices.iter().map(|index| (index.index_id.clone(), index.shard_generations.clone())).collect();
        self.schedule_cleanup(committed.clone(), shard_layouts);

        Ok(FinalizeSnapshotOutcome { repository_data: committed })
    }

    /// Write the global-metadata, per-snapshot-info, and per-index-metadata
    /// blobs in parallel on the finalize task runner. Already-exists errors
    /// are swallowed: a concurrent master that lost the election may have
    /// legitimately written the identical blob already (SPEC_FULL.md §4.6
    /// step 2).
    async fn write_metadata_blobs(&self, req: &FinalizeSnapshotRequest, current: &RepositoryData) -> Result<(), RepositoryError> {
        let mut handles = Vec::new();

        let root = self.root.clone();
        let compress = self.compress;
        let global = req.global_metadata.clone();
        let snapshot_uuid = req.snapshot_id.uuid;
        handles.push(self.task_runner.spawn(async move {
            write_ignoring_exists(root.as_ref(), Purpose::SnapshotMeta, &naming::global_metadata_name(snapshot_uuid), &global, compress).await
        }));

        let root = self.root.clone();
        let info = req.snapshot_info.clone();
        handles.push(self.task_runner.spawn(async move {
            write_ignoring_exists(root.as_ref(), Purpose::SnapshotMeta, &naming::snapshot_info_name(snapshot_uuid), &info, compress).await
        }));

        for index in &req.indices {
            let root = self.root.clone();
            let index_dir = root.child(naming::INDICES_DIR).child(&index.index_id);
            let metadata = index.metadata.clone();
            let name = if req.modern_layout && !current.index_metadata_identifiers.contains_key(&index.metadata_content_hash) {
                Some(format!(
                    "{}{}{}",
                    naming::INDEX_METADATA_PREFIX,
                    index.metadata_content_hash,
                    naming::INDEX_METADATA_SUFFIX
                ))
            } else if req.modern_layout {
                None // already present under this hash; dedup, skip the write
            } else {
                Some(naming::global_metadata_name(snapshot_uuid))
            };
            if let Some(name) = name {
                handles.push(self.task_runner.spawn(async move {
                    write_ignoring_exists(index_dir.as_ref(), Purpose::SnapshotMeta, &name, &metadata, compress).await
                }));
            }
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| self.snapshot_exception(&req.snapshot_id.name, anyhow::anyhow!("metadata write task panicked: {}", e)))?
                .map_err(|e| self.snapshot_exception(&req.snapshot_id.name, e))?;
        }
        Ok(())
    }

    /// Schedule the post-commit cleanup SPEC_FULL.md §4.6 step 4 describes:
    /// obsolete root `index-{n}` blobs, plus, per shard this finalize
    /// touched, the now-superseded shard-index generations it left behind
    /// (capped at [`gc::MAX_SHARD_GENERATIONS_RECLAIMED_PER_SWEEP`] so a
    /// long-neglected shard directory can't turn one finalize into an
    /// unbounded delete storm). Scheduled, never awaited, here -- `onDone`
    /// fires as soon as the task is queued.
    fn schedule_cleanup(&self, data: Arc<RepositoryData>, shard_layouts: Vec<(String, Vec<ShardGeneration>)>) {
        let root = self.root.clone();
        let stale_blob_runner = self.stale_blob_runner.clone();
        let repository_name = self.repository_name.clone();
        self.stale_blob_runner.spawn(async move {
            let stale = match gc::stale_root_blobs(root.as_ref(), &data, data.generation).await {
                Ok(names) => names,
                Err(err) => {
                    log::warn!("[{}] failed to list stale root blobs during post-finalize cleanup: {}", repository_name, err);
                    Vec::new()
                }
            };
            if !stale.is_empty() {
                let root2 = root.clone();
                let repository_name2 = repository_name.clone();
                let stale_blob_runner2 = stale_blob_runner.clone();
                stale_blob_runner2
                    .run_eagerly_or_spawn(async move {
                        if let Err(err) = root2.delete_blobs_ignoring_if_not_exists(Purpose::SnapshotMeta, &stale).await {
                            log::warn!("[{}] post-finalize stale-root cleanup failed (will be reclaimed later): {}", repository_name2, err);
                        }
                    })
                    .await;
            }

            for (index_id, shard_generations) in &shard_layouts {
                for (shard_number, generation) in shard_generations.iter().enumerate() {
                    let current_name = match current_shard_index_name(*generation) {
                        Some(name) => name,
                        None => continue,
                    };
                    let shard_dir = root.child(naming::INDICES_DIR).child(index_id).child(&shard_number.to_string());
                    let listed = match shard_dir.list_by_prefix(Purpose::Snapshot, naming::SHARD_INDEX_PREFIX).await {
                        Ok(listed) => listed,
                        Err(err) => {
                            log::warn!(
                                "[{}] failed to list shard-index blobs for {}/{} during post-finalize cleanup: {}",
                                repository_name, index_id, shard_number, err
                            );
                            continue;
                        }
                    };
                    let mut obsolete: Vec<String> = listed.into_iter().map(|(name, _)| name).filter(|name| name != &current_name).collect();
                    obsolete.sort();
                    let obsolete = gc::cap_reclaim_list(obsolete);
                    if obsolete.is_empty() {
                        continue;
                    }
                    let shard_dir2 = shard_dir.clone();
                    let repository_name2 = repository_name.clone();
                    stale_blob_runner
                        .run_eagerly_or_spawn(async move {
                            if let Err(err) = shard_dir2.delete_blobs_ignoring_if_not_exists(Purpose::Snapshot, &obsolete).await {
                                log::warn!("[{}] post-finalize stale shard-index cleanup failed (will be reclaimed later): {}", repository_name2, err);
                            }
                        })
                        .await;
                }
            }
        });
    }
}

/// The blob name a shard-generation would currently be written under, or
/// `None` for the sentinel generations (`New`/`Deleted`) that never name a
/// blob and so have nothing to exclude from a reclaim sweep.
fn current_shard_index_name(generation: ShardGeneration) -> Option<String> {
    match generation {
        ShardGeneration::Numbered(n) => Some(naming::shard_index_name_numbered(n)),
        ShardGeneration::Uuid(id) => Some(naming::shard_index_name_uuid(id)),
        ShardGeneration::New | ShardGeneration::Deleted => None,
    }
}

async fn write_ignoring_exists(
    container: &dyn BlobContainer,
    purpose: Purpose,
    name: &str,
    body: &serde_json::Value,
    compress: bool,
) -> anyhow::Result<()> {
    if container.blob_exists(purpose, name).await? {
        return Ok(());
    }
    let encoded = codec::encode(body, compress)?;
    match container.write(purpose, name, encoded.len() as u64, reader_from_bytes(encoded), true).await {
        Ok(()) => Ok(()),
        Err(err) if container.blob_exists(purpose, name).await.unwrap_or(false) => {
            log::debug!("ignoring already-exists on concurrent metadata write of {}: {}", name, err);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBlobContainer;
    use crate::blob_store::BlobContainer as _;
    use crate::generation::{ConsistencyMode, GenerationTracker};
    use crate::loader::no_op_state_filter;
    use crate::metadata_store::{MetadataStore, RepositoryMetadataState, UpdateFn};
    use crate::repository_data::SnapshotState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct InMemoryMetadataStore {
        state: Mutex<RepositoryMetadataState>,
    }

    impl InMemoryMetadataStore {
        fn new() -> Arc<Self> {
            Arc::new(Self { state: Mutex::new(RepositoryMetadataState::uninitialized()) })
        }
    }

    #[async_trait]
    impl MetadataStore for InMemoryMetadataStore {
        async fn submit_update(&self, _source: &str, update: UpdateFn) -> anyhow::Result<RepositoryMetadataState> {
            let mut guard = self.state.lock().unwrap();
            let next = update(&guard)?;
            *guard = next.clone();
            Ok(next)
        }

        async fn current(&self) -> anyhow::Result<RepositoryMetadataState> {
            Ok(self.state.lock().unwrap().clone())
        }
    }

    fn details() -> SnapshotDetails {
        SnapshotDetails {
            state: SnapshotState::Success,
            start_time_millis: 0,
            end_time_millis: 1,
            version: "1".into(),
            indices: std::iter::once("idx".to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn first_finalize_produces_generation_zero_with_one_snapshot() {
        let root: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let metadata = InMemoryMetadataStore::new();
        let tracker = Arc::new(GenerationTracker::new(ConsistencyMode::Strict, true));
        let loader = Arc::new(RepositoryDataLoader::new("repo", root.clone(), metadata.clone(), tracker, true, false));

        let orchestrator = FinalizeOrchestrator::new("repo", root.clone(), loader.clone(), TaskRunner::new(4), TaskRunner::new(4), true, None);

        let snapshot_uuid = Uuid::new_v4();
        let req = FinalizeSnapshotRequest {
            snapshot_id: SnapshotId::new("snap-1", snapshot_uuid),
            details: details(),
            snapshot_info: serde_json::json!({"ok": true}),
            global_metadata: serde_json::json!({"g": 1}),
            indices: vec![IndexFinalizeEntry {
                index_id: "idx".to_string(),
                metadata_content_hash: "hash-1".to_string(),
                metadata: serde_json::json!({"m": 1}),
                shard_generations: vec![ShardGeneration::Uuid(Uuid::new_v4()), ShardGeneration::Uuid(Uuid::new_v4())],
            }],
            expected_safe_generation: Generation::Empty,
            modern_layout: true,
            state_filter: no_op_state_filter(),
        };

        let outcome = orchestrator.finalize(req).await.unwrap();
        assert_eq!(outcome.repository_data.generation, 0);
        assert_eq!(outcome.repository_data.snapshot_count(), 1);
        assert!(outcome.repository_data.contains_snapshot(snapshot_uuid));

        assert!(root.blob_exists(Purpose::SnapshotMeta, "index-0").await.unwrap());
        assert!(root.blob_exists(Purpose::SnapshotMeta, &naming::snapshot_info_name(snapshot_uuid)).await.unwrap());
        assert!(root.blob_exists(Purpose::SnapshotMeta, &naming::global_metadata_name(snapshot_uuid)).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_rejects_once_snapshot_count_exceeds_max() {
        let root: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let metadata = InMemoryMetadataStore::new();
        let tracker = Arc::new(GenerationTracker::new(ConsistencyMode::Strict, true));
        let loader = Arc::new(RepositoryDataLoader::new("repo", root.clone(), metadata.clone(), tracker, true, false));
        let orchestrator = FinalizeOrchestrator::new("repo", root.clone(), loader.clone(), TaskRunner::new(4), TaskRunner::new(4), true, Some(0));

        let req = FinalizeSnapshotRequest {
            snapshot_id: SnapshotId::new("snap-1", Uuid::new_v4()),
            details: details(),
            snapshot_info: serde_json::json!({}),
            global_metadata: serde_json::json!({}),
            indices: vec![],
            expected_safe_generation: Generation::Empty,
            modern_layout: true,
            state_filter: no_op_state_filter(),
        };
        let err = orchestrator.finalize(req).await.unwrap_err();
        assert!(matches!(err, RepositoryError::SnapshotException { .. }));
    }
}
