//! The shard-snapshot pipeline (SPEC_FULL.md §4.5): diff a shard's live
//! files against its prior snapshots, upload what's new, and publish an
//! updated shard-snapshot set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::blob_store::{BlobContainer, Purpose};
use crate::codec;
use crate::config::DynamicSettings;
use crate::naming;
use crate::rate_limiter::{RateLimitedReader, ThrottleCounters, ThrottleKind};
use crate::repository_data::{FileInfo, ShardGeneration, ShardSnapshotEntry, ShardSnapshotSet, SnapshotManifest};
use crate::task_runner::TaskRunner;

/// Files at or under this length are virtualized: inlined into the
/// shard-snapshot set rather than stored as a separate data blob.
pub const VIRTUAL_FILE_MAX_LENGTH: u64 = 256;

/// A single physical file as reported by the host's live index commit.
#[derive(Debug, Clone)]
pub struct PhysicalFile {
    pub physical_name: String,
    pub length: u64,
    pub checksum: String,
    pub writer_uuid: Uuid,
}

/// The host-supplied source of a shard's current on-disk content. The core
/// never reads the host's index files directly; it only asks for a file
/// listing and, for files it decides to upload, a byte stream.
#[async_trait]
pub trait ShardSource: Send + Sync {
    async fn list_files(&self) -> anyhow::Result<Vec<PhysicalFile>>;
    async fn open(&self, physical_name: &str) -> anyhow::Result<crate::blob_store::BlobReader>;
    async fn read_fully(&self, physical_name: &str) -> anyhow::Result<Vec<u8>> {
        let mut reader = self.open(physical_name).await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await?;
        Ok(buf)
    }
}

/// Per-shard-snapshot-attempt cooperative cancellation flag, polled between
/// file uploads (SPEC_FULL.md §5, "Cancellation").
#[derive(Default)]
pub struct ShardSnapshotStatus {
    aborted: AtomicBool,
}

impl ShardSnapshotStatus {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

pub struct ShardSnapshotRequest {
    pub snapshot_uuid: Uuid,
    pub shard_dir: Arc<dyn BlobContainer>,
    pub source: Arc<dyn ShardSource>,
    pub prior_generation: ShardGeneration,
    pub state_identifier: Option<String>,
    pub part_size: u64,
    pub compress: bool,
    pub modern_layout: bool,
    pub status: Arc<ShardSnapshotStatus>,
    pub task_runner: TaskRunner,
    pub dynamic_settings: DynamicSettings,
    pub throttle_counters: Arc<ThrottleCounters>,
}

#[derive(Debug, Clone)]
pub struct ShardSnapshotOutcome {
    pub shard_generation: ShardGeneration,
    pub total_size: u64,
    pub file_count: u32,
    pub incremental_size: u64,
    pub incremental_file_count: u32,
}

enum PlannedFile {
    Virtual(FileInfo),
    Reuse(FileInfo),
    Upload { info: FileInfo, physical_name: String },
}

/// Read the shard's current shard-snapshot set, or an empty one if no
/// shard-index blob has ever been written for this shard (SPEC_FULL.md
/// §4.5 step 1).
pub async fn discover_prior_set(
    shard_dir: &Arc<dyn BlobContainer>,
    prior_generation: ShardGeneration,
) -> anyhow::Result<ShardSnapshotSet> {
    let name = match prior_generation {
        ShardGeneration::New | ShardGeneration::Deleted => return Ok(ShardSnapshotSet::default()),
        ShardGeneration::Numbered(n) => naming::shard_index_name_numbered(n),
        ShardGeneration::Uuid(id) => naming::shard_index_name_uuid(id),
    };
    if !shard_dir.blob_exists(Purpose::Snapshot, &name).await? {
        return Ok(ShardSnapshotSet::default());
    }
    let mut reader = shard_dir.read(Purpose::Snapshot, &name).await?;
    let mut raw = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut raw).await?;
    Ok(codec::decode(&raw)?)
}

/// List the shard directory and return the numerically-highest legacy
/// `index-{n}` entry, used when the caller has no shard-generation hint
/// (SPEC_FULL.md §4.5 step 1, legacy fallback).
pub async fn discover_highest_legacy_generation(shard_dir: &Arc<dyn BlobContainer>) -> anyhow::Result<ShardGeneration> {
    let listed = shard_dir.list_by_prefix(Purpose::Snapshot, naming::SHARD_INDEX_PREFIX).await?;
    let highest = listed
        .keys()
        .filter_map(|name| naming::parse_shard_index_name(name))
        .filter_map(|kind| match kind {
            naming::ShardIndexNameKind::Numbered(n) => Some(n),
            naming::ShardIndexNameKind::Uuid(_) => None,
        })
        .max();
    Ok(match highest {
        Some(n) => ShardGeneration::Numbered(n),
        None => ShardGeneration::New,
    })
}

fn diff_files(physical: &[PhysicalFile], prior: &ShardSnapshotSet, part_size: u64) -> Vec<PlannedFile> {
    physical
        .iter()
        .map(|file| {
            if file.length <= VIRTUAL_FILE_MAX_LENGTH {
                PlannedFile::Virtual(FileInfo {
                    physical_name: file.physical_name.clone(),
                    blob_name: naming::virtual_blob_name(&file.checksum),
                    length: file.length,
                    checksum: file.checksum.clone(),
                    writer_uuid: file.writer_uuid,
                    part_size,
                    inline_content: None, // filled in by caller, which has the bytes
                })
            } else if let Some(existing) = prior.find_reusable(&file.physical_name, file.length, &file.checksum, file.writer_uuid) {
                PlannedFile::Reuse(existing.clone())
            } else {
                let blob_uuid = Uuid::new_v4();
                PlannedFile::Upload {
                    info: FileInfo {
                        physical_name: file.physical_name.clone(),
                        blob_name: naming::data_blob_name(blob_uuid),
                        length: file.length,
                        checksum: file.checksum.clone(),
                        writer_uuid: file.writer_uuid,
                        part_size,
                        inline_content: None,
                    },
                    physical_name: file.physical_name.clone(),
                }
            }
        })
        .collect()
}

/// Run the full pipeline for one (snapshot, shard) pair (SPEC_FULL.md §4.5).
pub async fn snapshot_shard(req: ShardSnapshotRequest) -> anyhow::Result<ShardSnapshotOutcome> {
    let prior_set = discover_prior_set(&req.shard_dir, req.prior_generation).await?;

    // Fast-path reuse: an identical live-commit fingerprint means we can
    // copy a previous manifest's file list verbatim.
    if let Some(identifier) = &req.state_identifier {
        if let Some(reused) = prior_set
            .snapshots
            .iter()
            .find(|e| e.shard_state_identifier.as_deref() == Some(identifier.as_str()))
        {
            let files = reused.files.clone();
            return finish(&req, prior_set, files, Some(identifier.clone()), 0, 0).await;
        }
    }

    let physical = req.source.list_files().await?;
    let planned = diff_files(&physical, &prior_set, req.part_size);

    // Each upload is handed to the shard-snapshot task runner so files
    // transfer concurrently, bounded by its capacity (SPEC_FULL.md §4.12);
    // reused/virtual entries need no I/O and are resolved inline as the
    // planned list is walked.
    let mut files: Vec<Option<FileInfo>> = vec![None; planned.len()];
    let mut upload_tasks: Vec<(usize, FileInfo, JoinHandle<anyhow::Result<()>>)> = Vec::new();

    for (idx, item) in planned.into_iter().enumerate() {
        if req.status.is_aborted() {
            break;
        }
        match item {
            PlannedFile::Reuse(info) => files[idx] = Some(info),
            PlannedFile::Virtual(mut info) => {
                let bytes = req.source.read_fully(&info.physical_name).await?;
                info.inline_content = Some(bytes);
                files[idx] = Some(info);
            }
            PlannedFile::Upload { info, physical_name } => {
                let handle = spawn_upload(&req, info.clone(), physical_name);
                upload_tasks.push((idx, info, handle));
            }
        }
    }

    let mut incremental_size = 0u64;
    let mut incremental_file_count = 0u32;
    let mut uploaded_blob_names = Vec::new();
    let mut first_err: Option<anyhow::Error> = None;

    for (idx, info, handle) in upload_tasks {
        match handle.await {
            Ok(Ok(())) => {
                incremental_size += info.length;
                incremental_file_count += 1;
                uploaded_blob_names.push(info.blob_name.clone());
                files[idx] = Some(info);
            }
            Ok(Err(err)) => first_err.get_or_insert(err),
            Err(join_err) => first_err.get_or_insert_with(|| anyhow::anyhow!("upload task panicked: {}", join_err)),
        };
    }

    if req.status.is_aborted() {
        cleanup_partial_upload(&req, &uploaded_blob_names).await;
        anyhow::bail!("shard snapshot aborted");
    }
    if let Some(err) = first_err {
        cleanup_partial_upload(&req, &uploaded_blob_names).await;
        return Err(err);
    }

    let files: Vec<FileInfo> = files.into_iter().map(|f| f.expect("every planned file slot filled")).collect();

    finish(&req, prior_set, files, req.state_identifier.clone(), incremental_size, incremental_file_count).await
}

fn spawn_upload(req: &ShardSnapshotRequest, info: FileInfo, physical_name: String) -> JoinHandle<anyhow::Result<()>> {
    let shard_dir = req.shard_dir.clone();
    let source = req.source.clone();
    let status = req.status.clone();
    let dynamic_settings = req.dynamic_settings.clone();
    let throttle_counters = req.throttle_counters.clone();
    req.task_runner
        .spawn(async move { upload_file(shard_dir, source, status, dynamic_settings, throttle_counters, info, physical_name).await })
}

/// Upload one file, split into `info.part_size`-byte parts (SPEC_FULL.md
/// §4.5 step 4). The source is opened once and read sequentially; each
/// part reads exactly its slice of the stream rather than the whole file,
/// so a multi-part file's total uploaded bytes equal `info.length`.
async fn upload_file(
    shard_dir: Arc<dyn BlobContainer>,
    source: Arc<dyn ShardSource>,
    status: Arc<ShardSnapshotStatus>,
    dynamic_settings: DynamicSettings,
    throttle_counters: Arc<ThrottleCounters>,
    info: FileInfo,
    physical_name: String,
) -> anyhow::Result<()> {
    let number_of_parts = info.number_of_parts();
    let mut reader = source.open(&physical_name).await?;
    let part_size = info.part_size.max(1);
    let mut remaining = info.length;

    for part in 0..number_of_parts {
        if status.is_aborted() {
            anyhow::bail!("shard snapshot aborted mid-upload");
        }
        let part_len = remaining.min(part_size);
        remaining -= part_len;
        let limited = RateLimitedReader::new((&mut reader).take(part_len), ThrottleKind::Snapshot, dynamic_settings.clone(), throttle_counters.clone());
        let name = if number_of_parts == 1 {
            info.blob_name.clone()
        } else {
            naming::data_blob_part_name(blob_uuid_from_name(&info.blob_name), part)
        };
        shard_dir.write(Purpose::Snapshot, &name, part_len, Box::pin(limited), true).await?;
    }
    Ok(())
}

fn blob_uuid_from_name(blob_name: &str) -> Uuid {
    blob_name
        .strip_prefix(naming::UPLOADED_BLOB_PREFIX)
        .and_then(|rest| Uuid::parse_str(rest).ok())
        .unwrap_or_else(Uuid::new_v4)
}

async fn cleanup_partial_upload(req: &ShardSnapshotRequest, uploaded_blob_names: &[String]) {
    if uploaded_blob_names.is_empty() {
        return;
    }
    log::warn!("shard snapshot {} aborted; deleting {} partially uploaded blob(s)", req.snapshot_uuid, uploaded_blob_names.len());
    if let Err(err) = req
        .shard_dir
        .delete_blobs_ignoring_if_not_exists(Purpose::Snapshot, uploaded_blob_names)
        .await
    {
        log::warn!("failed to clean up partially uploaded blobs for snapshot {}: {}", req.snapshot_uuid, err);
    }
}

async fn finish(
    req: &ShardSnapshotRequest,
    prior_set: ShardSnapshotSet,
    files: Vec<FileInfo>,
    state_identifier: Option<String>,
    incremental_size: u64,
    incremental_file_count: u32,
) -> anyhow::Result<ShardSnapshotOutcome> {
    let total_size: u64 = files.iter().map(|f| f.length).sum();
    let file_count = files.len() as u32;

    let entry = ShardSnapshotEntry {
        snapshot_uuid: req.snapshot_uuid,
        files: files.clone(),
        shard_state_identifier: state_identifier,
    };
    let new_set = prior_set.with_entry_added(entry);
    let encoded_set = codec::encode(&new_set, req.compress)?;

    let new_generation = if req.modern_layout {
        // Modern layout: write the new shard-index blob before uploads
        // would have started in a from-scratch run; here uploads already
        // happened above, but the write-before-reference property still
        // holds because RepositoryData does not yet name this uuid.
        let id = Uuid::new_v4();
        let name = naming::shard_index_name_uuid(id);
        req.shard_dir
            .write_atomic(Purpose::Snapshot, &name, encoded_set.len() as u64, crate::blob_store::reader_from_bytes(encoded_set), true)
            .await?;
        ShardGeneration::Uuid(id)
    } else {
        let old = match req.prior_generation {
            ShardGeneration::Numbered(n) => n,
            _ => 0,
        };
        let next_gen = if matches!(req.prior_generation, ShardGeneration::Numbered(_)) { old + 1 } else { 0 };
        let name = naming::shard_index_name_numbered(next_gen);
        req.shard_dir
            .write_atomic(Purpose::Snapshot, &name, encoded_set.len() as u64, crate::blob_store::reader_from_bytes(encoded_set), true)
            .await?;
        ShardGeneration::Numbered(next_gen)
    };

    let manifest = SnapshotManifest {
        snapshot_uuid: req.snapshot_uuid,
        files,
        start_time_millis: 0,
        duration_millis: 0,
        incremental_file_count,
        total_file_count: file_count,
        incremental_size,
        total_size,
        shard_state_identifier: req.state_identifier.clone(),
    };
    let encoded_manifest = codec::encode(&manifest, req.compress)?;
    let manifest_name = naming::shard_manifest_name(req.snapshot_uuid);
    req.shard_dir
        .write(Purpose::Snapshot, &manifest_name, encoded_manifest.len() as u64, crate::blob_store::reader_from_bytes(encoded_manifest), true)
        .await?;

    Ok(ShardSnapshotOutcome {
        shard_generation: new_generation,
        total_size,
        file_count,
        incremental_size,
        incremental_file_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBlobContainer;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

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
            let bytes = contents.get(physical_name).cloned().unwrap_or_default();
            Ok(crate::blob_store::reader_from_bytes(bytes))
        }
    }

    fn source(files: Vec<(&str, &[u8])>) -> Arc<dyn ShardSource> {
        let mut contents = Map::new();
        let mut list = Vec::new();
        for (name, bytes) in files {
            contents.insert(name.to_string(), bytes.to_vec());
            list.push(PhysicalFile {
                physical_name: name.to_string(),
                length: bytes.len() as u64,
                checksum: format!("crc-{}", name),
                writer_uuid: Uuid::nil(),
            });
        }
        Arc::new(FixedSource { files: list, contents: Mutex::new(contents) })
    }

    fn request(shard_dir: Arc<dyn BlobContainer>, source: Arc<dyn ShardSource>, snapshot_uuid: Uuid, modern: bool) -> ShardSnapshotRequest {
        ShardSnapshotRequest {
            snapshot_uuid,
            shard_dir,
            source,
            prior_generation: ShardGeneration::New,
            state_identifier: None,
            part_size: 1024 * 1024,
            compress: false,
            modern_layout: modern,
            status: Arc::new(ShardSnapshotStatus::default()),
            task_runner: TaskRunner::new(2),
            dynamic_settings: DynamicSettings::default(),
            throttle_counters: Arc::new(ThrottleCounters::default()),
        }
    }

    #[tokio::test]
    async fn first_snapshot_uploads_large_files_and_inlines_small_ones() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let big = vec![7u8; 1024];
        let src = source(vec![("big.bin", &big), ("tiny.bin", b"hi")]);
        let outcome = snapshot_shard(request(shard_dir.clone(), src, Uuid::new_v4(), true)).await.unwrap();
        assert_eq!(outcome.file_count, 2);
        assert_eq!(outcome.incremental_file_count, 1);
        assert!(matches!(outcome.shard_generation, ShardGeneration::Uuid(_)));
    }

    #[tokio::test]
    async fn identical_file_across_snapshots_is_deduplicated() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let content = vec![9u8; 1024];
        let src1 = source(vec![("f.bin", &content)]);
        let first = snapshot_shard(request(shard_dir.clone(), src1, Uuid::new_v4(), true)).await.unwrap();

        let src2 = source(vec![("f.bin", &content)]);
        let mut req2 = request(shard_dir.clone(), src2, Uuid::new_v4(), true);
        req2.prior_generation = first.shard_generation;
        let second = snapshot_shard(req2).await.unwrap();

        assert_eq!(second.incremental_file_count, 0);
        assert_eq!(second.file_count, 1);
    }

    #[tokio::test]
    async fn aborted_upload_leaves_no_referenced_blobs() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let big = vec![7u8; 1024];
        let src = source(vec![("big.bin", &big)]);
        let mut req = request(shard_dir.clone(), src, Uuid::new_v4(), true);
        req.status.abort();
        let result = snapshot_shard(req).await;
        assert!(result.is_err());
        let listed = shard_dir.list_by_prefix(Purpose::Snapshot, naming::UPLOADED_BLOB_PREFIX).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn legacy_layout_increments_numeric_generation() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let src = source(vec![("a.bin", &[1u8; 1024])]);
        let first = snapshot_shard(request(shard_dir.clone(), src, Uuid::new_v4(), false)).await.unwrap();
        assert_eq!(first.shard_generation, ShardGeneration::Numbered(0));

        let src2 = source(vec![("b.bin", &[2u8; 1024])]);
        let mut req2 = request(shard_dir.clone(), src2, Uuid::new_v4(), false);
        req2.prior_generation = first.shard_generation;
        let second = snapshot_shard(req2).await.unwrap();
        assert_eq!(second.shard_generation, ShardGeneration::Numbered(1));
    }

    #[tokio::test]
    async fn multipart_file_uploads_exact_byte_slices_per_part() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let content: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let src = source(vec![("big.bin", &content)]);
        let mut req = request(shard_dir.clone(), src, Uuid::new_v4(), true);
        req.part_size = 512;
        let outcome = snapshot_shard(req).await.unwrap();
        assert_eq!(outcome.total_size, content.len() as u64);

        let set = discover_prior_set(&shard_dir, outcome.shard_generation).await.unwrap();
        let info = &set.snapshots[0].files[0];
        assert_eq!(info.number_of_parts(), 4);

        let mut restored = Vec::new();
        for part in 0..info.number_of_parts() {
            let name = naming::data_blob_part_name(blob_uuid_from_name(&info.blob_name), part);
            let mut reader = shard_dir.read(Purpose::Snapshot, &name).await.unwrap();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
            assert_eq!(buf.len() as u64, 512.min(info.length - restored.len() as u64));
            restored.extend_from_slice(&buf);
        }
        assert_eq!(restored, content);
    }
}
