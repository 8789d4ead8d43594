//! Delete-snapshots pipeline (SPEC_FULL.md §4.7) and the cleanup
//! (garbage-collection) operation built on top of it (§4.8).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::blob_store::{BlobContainer, Purpose};
use crate::codec;
use crate::error::RepositoryError;
use crate::gc;
use crate::generation::Generation;
use crate::loader::{no_op_state_filter, RepositoryDataLoader};
use crate::naming;
use crate::repository_data::{RepositoryData, ShardGeneration};
use crate::task_runner::TaskRunner;

/// Everything the pipeline needs to address one shard directory, plus how
/// many shards the owning index has (used only to know which shard
/// numbers to visit).
pub struct IndexShardLayout {
    pub index_id: String,
    pub number_of_shards: u32,
}

pub struct DeleteSnapshotsRequest {
    pub snapshots_to_delete: BTreeSet<Uuid>,
    pub expected_safe_generation: Generation,
    /// Whether RepositoryData at the version being operated on tracks
    /// shard-generations (modern) or not (legacy).
    pub modern_layout: bool,
}

pub struct DeletePipeline {
    repository_name: String,
    root: Arc<dyn BlobContainer>,
    loader: Arc<RepositoryDataLoader>,
    compress: bool,
    shard_task_runner: TaskRunner,
    stale_blob_runner: TaskRunner,
}

pub struct DeleteOutcome {
    pub repository_data: Arc<RepositoryData>,
}

impl DeletePipeline {
    pub fn new(
        repository_name: impl Into<String>,
        root: Arc<dyn BlobContainer>,
        loader: Arc<RepositoryDataLoader>,
        compress: bool,
        shard_task_runner: TaskRunner,
        stale_blob_runner: TaskRunner,
    ) -> Self {
        Self {
            repository_name: repository_name.into(),
            root,
            loader,
            compress,
            shard_task_runner,
            stale_blob_runner,
        }
    }

    fn err(&self, source: anyhow::Error) -> RepositoryError {
        RepositoryError::BlobStore {
            repository: self.repository_name.clone(),
            source,
        }
    }

    /// Delete the named snapshots, rewriting shard-snapshot sets affected
    /// by the deletion and then the root `RepositoryData` (SPEC_FULL.md
    /// §4.7). `index_layouts` gives, for every index touched by the
    /// deletion, the shard count to visit -- the host is the one who
    /// knows an index's shard count (the core has no index-metadata
    /// reader of its own).
    pub async fn delete(
        &self,
        req: DeleteSnapshotsRequest,
        index_layouts: Vec<IndexShardLayout>,
    ) -> Result<DeleteOutcome, RepositoryError> {
        let current = self.loader.load().await?;

        if req.modern_layout {
            self.delete_modern(req, index_layouts, current).await
        } else {
            self.delete_legacy(req, index_layouts, current).await
        }
    }

    async fn delete_modern(
        &self,
        req: DeleteSnapshotsRequest,
        index_layouts: Vec<IndexShardLayout>,
        current: Arc<RepositoryData>,
    ) -> Result<DeleteOutcome, RepositoryError> {
        let mut updated_shard_generations: BTreeMap<(Uuid, String), Vec<ShardGeneration>> = BTreeMap::new();
        let mut shard_cleanup: Vec<(Arc<dyn BlobContainer>, Vec<String>)> = Vec::new();

        for layout in &index_layouts {
            let index_dir = self.root.child(naming::INDICES_DIR).child(&layout.index_id);
            let mut handles = Vec::new();

            for shard in 0..layout.number_of_shards {
                let shard_dir = index_dir.child(&shard.to_string());
                let snapshots_to_delete = req.snapshots_to_delete.clone();
                let repository_name = self.repository_name.clone();
                handles.push(self.shard_task_runner.spawn(async move {
                    rewrite_one_shard(shard_dir, snapshots_to_delete, repository_name).await
                }));
            }

            for (shard, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(Some(result))) => {
                        // RepositoryData keys shard-generations per
                        // (snapshot, index), not per shard directly -- fold
                        // the one physical rewrite into every snapshot of
                        // this index that survives the delete.
                        self.fold_shard_generation(&mut updated_shard_generations, &current, &layout.index_id, shard as u32, result.new_generation);
                        shard_cleanup.push((result.shard_dir, result.stale_blobs));
                    }
                    Ok(Ok(None)) => {
                        // Shard rewrite failed upstream and was already logged;
                        // proceed with nothing to clean up for this shard
                        // (SPEC_FULL.md §4.7, "Partial failure").
                    }
                    Ok(Err(err)) => {
                        log::warn!(
                            "[{}] shard rewrite for index {} failed during delete; leaked blobs will be reclaimed later: {}",
                            self.repository_name,
                            layout.index_id,
                            err
                        );
                    }
                    Err(join_err) => {
                        log::warn!("[{}] shard-delete task panicked: {}", self.repository_name, join_err);
                    }
                }
            }
        }

        let new_generation = current.generation + 1;
        let new_data = current.with_snapshots_removed(new_generation, &req.snapshots_to_delete, updated_shard_generations);

        let committed = self
            .loader
            .write(new_data, req.expected_safe_generation, no_op_state_filter())
            .await?;

        self.schedule_post_commit_cleanup(committed.clone(), shard_cleanup);

        Ok(DeleteOutcome { repository_data: committed })
    }

    /// Thread the surviving shard-generation for (index, shard) into every
    /// snapshot of that index that survives the delete -- RepositoryData
    /// indexes shard-generations by (snapshot-uuid, index-id), so a single
    /// physical shard file is referenced identically from each surviving
    /// snapshot's vector at that shard's position.
    fn fold_shard_generation(
        &self,
        updated: &mut BTreeMap<(Uuid, String), Vec<ShardGeneration>>,
        current: &RepositoryData,
        index_id: &str,
        shard: u32,
        new_generation: ShardGeneration,
    ) {
        if let Some(surviving) = current.indices.get(index_id) {
            for snapshot_uuid in surviving {
                let key = (*snapshot_uuid, index_id.to_string());
                let entry = updated.entry(key).or_insert_with(|| {
                    current
                        .shard_generations_for(*snapshot_uuid, index_id)
                        .map(|g| g.to_vec())
                        .unwrap_or_default()
                });
                while entry.len() <= shard as usize {
                    entry.push(ShardGeneration::New);
                }
                entry[shard as usize] = new_generation;
            }
        }
    }

    async fn delete_legacy(
        &self,
        req: DeleteSnapshotsRequest,
        index_layouts: Vec<IndexShardLayout>,
        current: Arc<RepositoryData>,
    ) -> Result<DeleteOutcome, RepositoryError> {
        let new_generation = current.generation + 1;
        let new_data = current.with_snapshots_removed(new_generation, &req.snapshots_to_delete, BTreeMap::new());

        let committed = self
            .loader
            .write(new_data, req.expected_safe_generation, no_op_state_filter())
            .await?;

        // Legacy mode: the root write commits first, then shard-level
        // garbage is enumerated by recomputing the highest numeric
        // generation and deleting everything below it plus dead manifests.
        for layout in &index_layouts {
            let index_dir = self.root.child(naming::INDICES_DIR).child(&layout.index_id);
            for shard in 0..layout.number_of_shards {
                let shard_dir = index_dir.child(&shard.to_string());
                let snapshots_to_delete = req.snapshots_to_delete.clone();
                let repository_name = self.repository_name.clone();
                self.stale_blob_runner.spawn(async move {
                    if let Err(err) = cleanup_legacy_shard(shard_dir, snapshots_to_delete).await {
                        log::warn!("[{}] legacy shard cleanup failed (will be retried on next delete/cleanup): {}", repository_name, err);
                    }
                });
            }
        }

        self.schedule_post_commit_cleanup(committed.clone(), Vec::new());

        Ok(DeleteOutcome { repository_data: committed })
    }

    fn schedule_post_commit_cleanup(&self, data: Arc<RepositoryData>, shard_cleanup: Vec<(Arc<dyn BlobContainer>, Vec<String>)>) {
        let root = self.root.clone();
        let repository_name = self.repository_name.clone();
        let stale_blob_runner = self.stale_blob_runner.clone();

        for (shard_dir, stale) in shard_cleanup {
            if stale.is_empty() {
                continue;
            }
            let repository_name = repository_name.clone();
            self.stale_blob_runner.spawn(async move {
                if let Err(err) = shard_dir.delete_blobs_ignoring_if_not_exists(Purpose::Snapshot, &stale).await {
                    log::warn!("[{}] stale shard-blob cleanup failed (will be reclaimed later): {}", repository_name, err);
                }
            });
        }

        self.stale_blob_runner.spawn(async move {
            let stale = match gc::stale_root_blobs(root.as_ref(), &data, data.generation).await {
                Ok(names) => names,
                Err(err) => {
                    log::warn!("[{}] failed to list stale root blobs during post-delete cleanup: {}", repository_name, err);
                    return;
                }
            };
            if stale.is_empty() {
                return;
            }
            if let Err(err) = root.delete_blobs_ignoring_if_not_exists(Purpose::SnapshotMeta, &stale).await {
                log::warn!("[{}] post-delete stale-root cleanup failed (will be reclaimed later): {}", repository_name, err);
            }
        });
    }
}

struct ShardRewriteResult {
    shard_dir: Arc<dyn BlobContainer>,
    new_generation: ShardGeneration,
    stale_blobs: Vec<String>,
}

/// Rewrite one shard directory's snapshot set with the deleted snapshots
/// filtered out. Returns `Ok(None)` if there was nothing to rewrite
/// (shard never had a snapshot of this index); the caller logs and moves
/// on for genuine I/O failures rather than aborting the whole delete.
async fn rewrite_one_shard(
    shard_dir: Arc<dyn BlobContainer>,
    snapshots_to_delete: BTreeSet<Uuid>,
    _repository_name: String,
) -> anyhow::Result<Option<ShardRewriteResult>> {
    let prior_generation = crate::shard_snapshot::discover_highest_legacy_generation(&shard_dir).await?;
    let prior_set = crate::shard_snapshot::discover_prior_set(&shard_dir, prior_generation).await?;
    if prior_set.is_empty() && !matches!(prior_generation, ShardGeneration::Uuid(_)) {
        return Ok(None);
    }

    let new_set = prior_set.with_entries_removed(&snapshots_to_delete);
    let surviving: BTreeSet<Uuid> = new_set.snapshots.iter().map(|e| e.snapshot_uuid).collect();

    if new_set.is_empty() {
        let children = shard_dir.list_children(Purpose::Snapshot).await?;
        let all: Vec<String> = children
            .into_iter()
            .filter(|(_, entry)| matches!(entry, crate::blob_store::ChildEntry::Blob { .. }))
            .map(|(name, _)| name)
            .collect();
        return Ok(Some(ShardRewriteResult {
            shard_dir,
            new_generation: ShardGeneration::Deleted,
            stale_blobs: all,
        }));
    }

    let encoded = codec::encode(&new_set, true)?;
    let new_uuid = Uuid::new_v4();
    let name = naming::shard_index_name_uuid(new_uuid);
    shard_dir
        .write_atomic(Purpose::Snapshot, &name, encoded.len() as u64, crate::blob_store::reader_from_bytes(encoded), true)
        .await?;

    let stale = gc::stale_shard_blobs(shard_dir.as_ref(), &new_set, ShardGeneration::Uuid(new_uuid), &surviving).await?;

    Ok(Some(ShardRewriteResult {
        shard_dir,
        new_generation: ShardGeneration::Uuid(new_uuid),
        stale_blobs: stale,
    }))
}

async fn cleanup_legacy_shard(shard_dir: Arc<dyn BlobContainer>, snapshots_to_delete: BTreeSet<Uuid>) -> anyhow::Result<()> {
    let prior_generation = crate::shard_snapshot::discover_highest_legacy_generation(&shard_dir).await?;
    let prior_set = crate::shard_snapshot::discover_prior_set(&shard_dir, prior_generation).await?;
    let new_set = prior_set.with_entries_removed(&snapshots_to_delete);
    let surviving: BTreeSet<Uuid> = new_set.snapshots.iter().map(|e| e.snapshot_uuid).collect();
    let stale = gc::stale_shard_blobs(shard_dir.as_ref(), &new_set, prior_generation, &surviving).await?;
    if !stale.is_empty() {
        shard_dir.delete_blobs_ignoring_if_not_exists(Purpose::Snapshot, &stale).await?;
    }
    Ok(())
}

/// Cleanup (garbage-collection) operation (SPEC_FULL.md §4.8): a
/// non-deleting-snapshot variant of the delete pipeline. Advances the
/// repository generation by one to fence concurrent writers, then runs
/// the same "delete stale root/shard" phases against the *current*
/// RepositoryData (nothing is removed from it).
pub struct CleanupOperation {
    repository_name: String,
    root: Arc<dyn BlobContainer>,
    loader: Arc<RepositoryDataLoader>,
    stale_blob_runner: TaskRunner,
}

impl CleanupOperation {
    pub fn new(repository_name: impl Into<String>, root: Arc<dyn BlobContainer>, loader: Arc<RepositoryDataLoader>, stale_blob_runner: TaskRunner) -> Self {
        Self {
            repository_name: repository_name.into(),
            root,
            loader,
            stale_blob_runner,
        }
    }

    pub async fn run(&self, expected_safe_generation: Generation, index_layouts: Vec<IndexShardLayout>) -> Result<DeleteOutcome, RepositoryError> {
        let current = self.loader.load().await?;
        let fence_generation = current.generation + 1;
        let mut fenced = (*current).clone();
        fenced.generation = fence_generation;

        let committed = self
            .loader
            .write(fenced, expected_safe_generation, no_op_state_filter())
            .await?;

        for layout in &index_layouts {
            let index_dir = self.root.child(naming::INDICES_DIR).child(&layout.index_id);
            for shard in 0..layout.number_of_shards {
                let shard_dir = index_dir.child(&shard.to_string());
                let committed = committed.clone();
                let index_id = layout.index_id.clone();
                let repository_name = self.repository_name.clone();
                self.stale_blob_runner.spawn(async move {
                    if let Err(err) = cleanup_shard_against(shard_dir, &committed, &index_id, shard).await {
                        log::warn!("[{}] cleanup sweep for index {} shard {} failed: {}", repository_name, index_id, shard, err);
                    }
                });
            }
        }

        let root = self.root.clone();
        let committed2 = committed.clone();
        let repository_name = self.repository_name.clone();
        self.stale_blob_runner.spawn(async move {
            match gc::stale_root_blobs(root.as_ref(), &committed2, committed2.generation).await {
                Ok(stale) if !stale.is_empty() => {
                    if let Err(err) = root.delete_blobs_ignoring_if_not_exists(Purpose::SnapshotMeta, &stale).await {
                        log::warn!("[{}] cleanup stale-root sweep failed: {}", repository_name, err);
                    }
                }
                Ok(_) => {}
                Err(err) => log::warn!("[{}] cleanup failed to list stale root blobs: {}", repository_name, err),
            }
        });

        Ok(DeleteOutcome { repository_data: committed })
    }
}

async fn cleanup_shard_against(shard_dir: Arc<dyn BlobContainer>, data: &RepositoryData, index_id: &str, shard: u32) -> anyhow::Result<()> {
    let prior_generation = crate::shard_snapshot::discover_highest_legacy_generation(&shard_dir).await?;
    let set = crate::shard_snapshot::discover_prior_set(&shard_dir, prior_generation).await?;

    let current_gen = data
        .indices
        .get(index_id)
        .and_then(|snapshots| snapshots.last())
        .and_then(|snapshot_uuid| data.shard_generations_for(*snapshot_uuid, index_id))
        .and_then(|gens| gens.get(shard as usize).copied())
        .unwrap_or(prior_generation);

    let surviving: BTreeSet<Uuid> = set.snapshots.iter().map(|e| e.snapshot_uuid).collect();
    let stale = gc::stale_shard_blobs(shard_dir.as_ref(), &set, current_gen, &surviving).await?;
    if !stale.is_empty() {
        shard_dir.delete_blobs_ignoring_if_not_exists(Purpose::Snapshot, &stale).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBlobContainer;
    use crate::config::DynamicSettings;
    use crate::generation::{ConsistencyMode, GenerationTracker};
    use crate::metadata_store::{MetadataStore, RepositoryMetadataState, UpdateFn};
    use crate::rate_limiter::ThrottleCounters;
    use crate::shard_snapshot::{snapshot_shard, PhysicalFile, ShardSnapshotRequest, ShardSnapshotStatus, ShardSource};
    use async_trait::async_trait;
    use std::collections::BTreeMap as Map;
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

    struct FixedSource {
        files: Vec<PhysicalFile>,
        contents: Mutex<Map<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ShardSource for FixedSource {
        async fn list_files(&self) -> anyhow::Result<Vec<PhysicalFile>> {
            Ok(self.files.clone())
        }

        async fn open(&self, physical_name: &str) -> anyhow::Result<crate::blob_store::BlobReader> {
            let contents = self.contents.lock().unwrap();
            Ok(crate::blob_store::reader_from_bytes(contents.get(physical_name).cloned().unwrap_or_default()))
        }
    }

    fn source(name: &str, bytes: &[u8]) -> Arc<dyn ShardSource> {
        let mut contents = Map::new();
        contents.insert(name.to_string(), bytes.to_vec());
        Arc::new(FixedSource {
            files: vec![PhysicalFile {
                physical_name: name.to_string(),
                length: bytes.len() as u64,
                checksum: format!("crc-{}", name),
                writer_uuid: Uuid::nil(),
            }],
            contents: Mutex::new(contents),
        })
    }

    fn snapshot_request(shard_dir: Arc<dyn BlobContainer>, source: Arc<dyn ShardSource>, snapshot_uuid: Uuid, prior: ShardGeneration) -> ShardSnapshotRequest {
        ShardSnapshotRequest {
            snapshot_uuid,
            shard_dir,
            source,
            prior_generation: prior,
            state_identifier: None,
            part_size: 1024 * 1024,
            compress: false,
            modern_layout: true,
            status: Arc::new(ShardSnapshotStatus::default()),
            task_runner: TaskRunner::new(2),
            dynamic_settings: DynamicSettings::default(),
            throttle_counters: Arc::new(ThrottleCounters::default()),
        }
    }

    async fn loader_for(root: Arc<dyn BlobContainer>) -> (Arc<RepositoryDataLoader>, Arc<InMemoryMetadataStore>) {
        let metadata = InMemoryMetadataStore::new();
        let tracker = Arc::new(GenerationTracker::new(ConsistencyMode::Strict, true));
        (Arc::new(RepositoryDataLoader::new("repo", root, metadata.clone(), tracker, true, false)), metadata)
    }

    #[tokio::test]
    async fn deleting_one_of_two_snapshots_keeps_the_shared_data_blob() {
        let root: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let shard_dir = root.child(naming::INDICES_DIR).child("idx").child("0");

        let content = vec![7u8; 1024];
        let t1 = Uuid::new_v4();
        let src1 = source("f.bin", &content);
        let first = snapshot_shard(snapshot_request(shard_dir.clone(), src1, t1, ShardGeneration::New)).await.unwrap();

        let t2 = Uuid::new_v4();
        let src2 = source("f.bin", &content);
        let second = snapshot_shard(snapshot_request(shard_dir.clone(), src2, t2, first.shard_generation)).await.unwrap();
        assert_eq!(second.incremental_file_count, 0); // dedup: same content, no new blob

        let (loader, _metadata) = loader_for(root.clone()).await;

        // Seed RepositoryData so the delete pipeline has something to remove.
        let mut data = RepositoryData::empty(Uuid::new_v4(), "c");
        data.snapshots.insert(t1, crate::repository_data::SnapshotId::new("s1", t1));
        data.snapshots.insert(t2, crate::repository_data::SnapshotId::new("s2", t2));
        data.indices.insert("idx".to_string(), vec![t1, t2]);
        data.shard_generations.insert((t1, "idx".to_string()), vec![first.shard_generation]);
        data.shard_generations.insert((t2, "idx".to_string()), vec![second.shard_generation]);
        loader.write(data, Generation::Empty, no_op_state_filter()).await.unwrap();

        let pipeline = DeletePipeline::new("repo", root.clone(), loader.clone(), true, TaskRunner::new(4), TaskRunner::new(4));
        let req = DeleteSnapshotsRequest {
            snapshots_to_delete: std::iter::once(t1).collect(),
            expected_safe_generation: Generation::Numbered(0),
            modern_layout: true,
        };
        let outcome = pipeline
            .delete(req, vec![IndexShardLayout { index_id: "idx".to_string(), number_of_shards: 1 }])
            .await
            .unwrap();

        assert!(!outcome.repository_data.contains_snapshot(t1));
        assert!(outcome.repository_data.contains_snapshot(t2));

        // The manifest for t2's shard-gen should still resolve and still
        // reference the shared blob.
        let gens = outcome.repository_data.shard_generations_for(t2, "idx").unwrap();
        let set = crate::shard_snapshot::discover_prior_set(&shard_dir, gens[0]).await.unwrap();
        assert!(set.find(t2).is_some());
        assert!(set.find(t1).is_none());
    }

    #[tokio::test]
    async fn cleanup_advances_generation_without_removing_snapshots() {
        let root: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let (loader, _metadata) = loader_for(root.clone()).await;
        let data = RepositoryData::empty(Uuid::new_v4(), "c");
        loader.write(data, Generation::Empty, no_op_state_filter()).await.unwrap();

        let op = CleanupOperation::new("repo", root.clone(), loader.clone(), TaskRunner::new(4));
        let outcome = op.run(Generation::Numbered(0), vec![]).await.unwrap();
        assert_eq!(outcome.repository_data.generation, 1);
    }
}
