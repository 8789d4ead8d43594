//! The restore-shard pipeline (SPEC_FULL.md §4.10): pull a shard's
//! manifest back onto a host-supplied destination store, verifying
//! checksums as bytes stream in.
//!
//! Grounded in the teacher's `backup::data_blob_reader::DataBlobReader`
//! (a `Read` wrapper that recomputes a crc32 while decoding and bails with
//! "blob crc check failed" if it disagrees with the stored one) and
//! `backup::checksum_reader::ChecksumReader` (the incremental hasher it
//! wraps around the inner stream); parallel per-file work reuses the same
//! bounded `TaskRunner` fan-out `finalize.rs` uses for its metadata writes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::blob_store::{BlobContainer, BlobWriter, Purpose};
use crate::codec;
use crate::config::DynamicSettings;
use crate::naming;
use crate::rate_limiter::{RateLimitedReader, ThrottleCounters, ThrottleKind};
use crate::repository_data::{FileInfo, RepositoryShardId, SnapshotManifest};
use crate::task_runner::TaskRunner;

/// Host-supplied destination for a restored shard's files. The core never
/// touches the host's index engine directly; it only asks for a verifying
/// sink per file and a way to discard one that failed partway through.
#[async_trait]
pub trait RestoreTarget: Send + Sync {
    /// Already holds `length` bytes matching `checksum`? Lets the
    /// higher-level restore machinery skip files it restored already
    /// (§4.10 step 2: "by default trust every file").
    async fn already_present(&self, _physical_name: &str, _length: u64, _checksum: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Open `physical_name` for writing from scratch.
    async fn create_output(&self, physical_name: &str) -> anyhow::Result<BlobWriter>;

    /// Remove a partially-written file after a checksum failure or abort.
    async fn remove_partial(&self, physical_name: &str) -> anyhow::Result<()>;

    /// Flag the destination store corrupted and unusable until
    /// re-created (§4.10 step 3).
    async fn mark_corrupted(&self);
}

/// Per-repository bookkeeping of in-flight shard restores (SPEC_FULL.md
/// §2, §5: `awaitIdle` blocks repository close until this set is empty).
#[derive(Default)]
pub struct OngoingRestores {
    active: std::sync::Mutex<std::collections::BTreeSet<(String, RepositoryShardId)>>,
    idle: Notify,
}

impl OngoingRestores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a shard restore as in-flight, returning a guard that
    /// deregisters it (and drains any `awaitIdle` waiters if this was the
    /// last one) when dropped.
    fn register(self: &Arc<Self>, index_id: String, shard: RepositoryShardId) -> RestoreGuard {
        self.active.lock().unwrap().insert((index_id.clone(), shard));
        RestoreGuard { restores: self.clone(), key: (index_id, shard) }
    }

    pub fn is_idle(&self) -> bool {
        self.active.lock().unwrap().is_empty()
    }

    /// Blocks until no shard restore is in flight.
    pub async fn await_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

struct RestoreGuard {
    restores: Arc<OngoingRestores>,
    key: (String, RepositoryShardId),
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let mut active = self.restores.active.lock().unwrap();
        active.remove(&self.key);
        if active.is_empty() {
            self.restores.idle.notify_waiters();
        }
    }
}

pub struct RestoreShardRequest {
    pub index_id: String,
    pub shard: RepositoryShardId,
    pub shard_dir: Arc<dyn BlobContainer>,
    pub snapshot_uuid: Uuid,
    pub target: Arc<dyn RestoreTarget>,
    pub ongoing: Arc<OngoingRestores>,
    pub task_runner: TaskRunner,
    pub dynamic_settings: DynamicSettings,
    pub throttle_counters: Arc<ThrottleCounters>,
    /// Cooperative cancellation: set by the owning repository when it is
    /// closing. Checked at each per-file boundary (§4.10, "Cancellation").
    pub closing: Arc<AtomicBool>,
}

impl RestoreShardRequest {
    pub fn new(
        index_id: impl Into<String>,
        shard: RepositoryShardId,
        shard_dir: Arc<dyn BlobContainer>,
        snapshot_uuid: Uuid,
        target: Arc<dyn RestoreTarget>,
        ongoing: Arc<OngoingRestores>,
        task_runner: TaskRunner,
        dynamic_settings: DynamicSettings,
        throttle_counters: Arc<ThrottleCounters>,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index_id: index_id.into(),
            shard,
            shard_dir,
            snapshot_uuid,
            target,
            ongoing,
            task_runner,
            dynamic_settings,
            throttle_counters,
            closing,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreShardOutcome {
    pub files_restored: u32,
    pub files_skipped: u32,
    pub bytes_restored: u64,
}

/// crc32 of `bytes`, rendered as it would be stored in a `FileInfo`'s
/// opaque `checksum` field -- the same algorithm the teacher's
/// `ChecksumReader`/`DataBlobReader` pair uses to detect a corrupted blob.
pub fn content_checksum(bytes: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(bytes))
}

/// Run the full pipeline for one (snapshot, shard) pair (SPEC_FULL.md
/// §4.10).
pub async fn restore_shard(req: RestoreShardRequest) -> anyhow::Result<RestoreShardOutcome> {
    let _guard = req.ongoing.register(req.index_id.clone(), req.shard);

    if req.closing.load(Ordering::SeqCst) {
        anyhow::bail!("repository closing");
    }

    let manifest_name = naming::shard_manifest_name(req.snapshot_uuid);
    let mut reader = req.shard_dir.read(Purpose::Snapshot, &manifest_name).await?;
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).await?;
    let manifest: SnapshotManifest = codec::decode(&raw)?;

    let files: VecDeque<FileInfo> = manifest.files.into_iter().collect();

    let mut handles = Vec::with_capacity(files.len());
    for info in files {
        if req.closing.load(Ordering::SeqCst) {
            anyhow::bail!("repository closing");
        }
        let shard_dir = req.shard_dir.clone();
        let target = req.target.clone();
        let dynamic_settings = req.dynamic_settings.clone();
        let throttle_counters = req.throttle_counters.clone();
        let closing = req.closing.clone();
        handles.push(req.task_runner.spawn(async move {
            restore_one_file(shard_dir, target, info, dynamic_settings, throttle_counters, closing).await
        }));
    }

    let mut outcome = RestoreShardOutcome::default();
    for handle in handles {
        let per_file = handle.await.map_err(|err| anyhow::anyhow!("restore task panicked: {}", err))??;
        match per_file {
            PerFileOutcome::Skipped => outcome.files_skipped += 1,
            PerFileOutcome::Restored { bytes } => {
                outcome.files_restored += 1;
                outcome.bytes_restored += bytes;
            }
        }
    }

    Ok(outcome)
}

enum PerFileOutcome {
    Skipped,
    Restored { bytes: u64 },
}

async fn restore_one_file(
    shard_dir: Arc<dyn BlobContainer>,
    target: Arc<dyn RestoreTarget>,
    info: FileInfo,
    dynamic_settings: DynamicSettings,
    throttle_counters: Arc<ThrottleCounters>,
    closing: Arc<AtomicBool>,
) -> anyhow::Result<PerFileOutcome> {
    if closing.load(Ordering::SeqCst) {
        anyhow::bail!("repository closing");
    }

    if target.already_present(&info.physical_name, info.length, &info.checksum).await? {
        return Ok(PerFileOutcome::Skipped);
    }

    if let Some(content) = &info.inline_content {
        let mut out = target.create_output(&info.physical_name).await?;
        if let Err(err) = write_all_and_flush(&mut out, content).await {
            let _ = target.remove_partial(&info.physical_name).await;
            return Err(err.into());
        }
        return Ok(PerFileOutcome::Restored { bytes: content.len() as u64 });
    }

    match download_and_verify(&shard_dir, &target, &info, dynamic_settings, throttle_counters, &closing).await {
        Ok(bytes) => Ok(PerFileOutcome::Restored { bytes }),
        Err(err) => {
            // Only a verification failure (bad length/checksum) implies the
            // destination store now holds corrupt bytes; a read error from
            // the shard directory is an ordinary propagated failure and
            // leaves the target's corruption state untouched.
            if err.downcast_ref::<VerificationFailed>().is_some() {
                target.mark_corrupted().await;
            }
            let _ = target.remove_partial(&info.physical_name).await;
            Err(err)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct VerificationFailed(String);

async fn write_all_and_flush(out: &mut BlobWriter, content: &[u8]) -> std::io::Result<()> {
    out.write_all(content).await?;
    out.flush().await
}

async fn download_and_verify(
    shard_dir: &Arc<dyn BlobContainer>,
    target: &Arc<dyn RestoreTarget>,
    info: &FileInfo,
    dynamic_settings: DynamicSettings,
    throttle_counters: Arc<ThrottleCounters>,
    closing: &Arc<AtomicBool>,
) -> anyhow::Result<u64> {
    let mut out = target.create_output(&info.physical_name).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut total = 0u64;

    let number_of_parts = info.number_of_parts();
    for part in 0..number_of_parts {
        if closing.load(Ordering::SeqCst) {
            anyhow::bail!("repository closing");
        }
        let blob_uuid = blob_uuid_from_name(&info.blob_name);
        let part_name = if number_of_parts == 1 {
            info.blob_name.clone()
        } else {
            naming::data_blob_part_name(blob_uuid, part)
        };
        let part_reader = shard_dir.read(Purpose::Snapshot, &part_name).await?;
        let mut limited = RateLimitedReader::new(part_reader, ThrottleKind::Restore, dynamic_settings.clone(), throttle_counters.clone());

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = limited.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    out.flush().await?;

    if total != info.length {
        return Err(VerificationFailed(format!(
            "restored {} bytes for {} but manifest records {}",
            total, info.physical_name, info.length
        ))
        .into());
    }
    let computed = format!("{:08x}", hasher.finalize());
    if computed != info.checksum {
        return Err(VerificationFailed(format!(
            "checksum mismatch restoring {}: expected {}, got {}",
            info.physical_name, info.checksum, computed
        ))
        .into());
    }

    Ok(total)
}

fn blob_uuid_from_name(blob_name: &str) -> Uuid {
    blob_name
        .strip_prefix(naming::UPLOADED_BLOB_PREFIX)
        .and_then(|rest| Uuid::parse_str(rest).ok())
        .unwrap_or_else(Uuid::nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBlobContainer;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct RecordingTarget {
        written: Arc<Mutex<Map<String, Vec<u8>>>>,
        removed: Arc<Mutex<Vec<String>>>,
        corrupted: Arc<std::sync::atomic::AtomicBool>,
    }

    // A small in-memory AsyncWrite that commits its buffer to the target's
    // map on flush, mirroring how a real index-output stream would commit
    // bytes as they're verified.
    struct Sink {
        written: Arc<Mutex<Map<String, Vec<u8>>>>,
        name: String,
        buf: Vec<u8>,
    }

    impl tokio::io::AsyncWrite for Sink {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.buf.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let this = self.get_mut();
            this.written.lock().unwrap().insert(this.name.clone(), this.buf.clone());
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl RestoreTarget for RecordingTarget {
        async fn create_output(&self, physical_name: &str) -> anyhow::Result<BlobWriter> {
            Ok(Box::pin(Sink { written: self.written.clone(), name: physical_name.to_string(), buf: Vec::new() }))
        }

        async fn remove_partial(&self, physical_name: &str) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(physical_name.to_string());
            self.written.lock().unwrap().remove(physical_name);
            Ok(())
        }

        async fn mark_corrupted(&self) {
            self.corrupted.store(true, Ordering::SeqCst);
        }
    }

    fn file(name: &str, blob: &str, content: &[u8]) -> FileInfo {
        FileInfo {
            physical_name: name.to_string(),
            blob_name: blob.to_string(),
            length: content.len() as u64,
            checksum: content_checksum(content),
            writer_uuid: Uuid::nil(),
            part_size: 1024 * 1024,
            inline_content: None,
        }
    }

    async fn write_manifest(shard_dir: &Arc<dyn BlobContainer>, snapshot_uuid: Uuid, files: Vec<FileInfo>) {
        let manifest = SnapshotManifest {
            snapshot_uuid,
            files,
            start_time_millis: 0,
            duration_millis: 0,
            incremental_file_count: 0,
            total_file_count: 0,
            incremental_size: 0,
            total_size: 0,
            shard_state_identifier: None,
        };
        let encoded = codec::encode(&manifest, false).unwrap();
        let name = naming::shard_manifest_name(snapshot_uuid);
        shard_dir
            .write(Purpose::Snapshot, &name, encoded.len() as u64, crate::blob_store::reader_from_bytes(encoded), true)
            .await
            .unwrap();
    }

    fn request(
        shard_dir: Arc<dyn BlobContainer>,
        snapshot_uuid: Uuid,
        target: Arc<dyn RestoreTarget>,
    ) -> RestoreShardRequest {
        RestoreShardRequest::new(
            "idx".to_string(),
            RepositoryShardId { shard: 0 },
            shard_dir,
            snapshot_uuid,
            target,
            OngoingRestores::new(),
            TaskRunner::new(2),
            DynamicSettings::default(),
            Arc::new(ThrottleCounters::default()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn restores_uploaded_and_virtual_files() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let snapshot_uuid = Uuid::new_v4();

        let big_content = vec![5u8; 4096];
        let blob_uuid = Uuid::new_v4();
        shard_dir
            .write(
                Purpose::Snapshot,
                &naming::data_blob_name(blob_uuid),
                big_content.len() as u64,
                crate::blob_store::reader_from_bytes(big_content.clone()),
                true,
            )
            .await
            .unwrap();
        let mut big_info = file("big.bin", &naming::data_blob_name(blob_uuid), &big_content);

        let tiny_content = b"hi".to_vec();
        let mut tiny_info = file("tiny.bin", &naming::virtual_blob_name("x"), &tiny_content);
        tiny_info.inline_content = Some(tiny_content.clone());
        big_info.part_size = big_content.len() as u64 * 2;

        write_manifest(&shard_dir, snapshot_uuid, vec![big_info, tiny_info]).await;

        let recording = RecordingTarget::default();
        let target: Arc<dyn RestoreTarget> = Arc::new(recording.clone());
        let outcome = restore_shard(request(shard_dir.clone(), snapshot_uuid, target.clone())).await.unwrap();

        assert_eq!(outcome.files_restored, 2);
        assert_eq!(outcome.files_skipped, 0);

        let written = recording.written.lock().unwrap();
        assert_eq!(written.get("big.bin").unwrap(), &big_content);
        assert_eq!(written.get("tiny.bin").unwrap(), &tiny_content);
    }

    #[tokio::test]
    async fn checksum_mismatch_marks_target_corrupted_and_removes_partial() {
        let shard_dir: Arc<dyn BlobContainer> = MemoryBlobContainer::new();
        let snapshot_uuid = Uuid::new_v4();

        let content = vec![1u8; 16];
        let blob_uuid = Uuid::new_v4();
        shard_dir
            .write(
                Purpose::Snapshot,
                &naming::data_blob_name(blob_uuid),
                content.len() as u64,
                crate::blob_store::reader_from_bytes(content.clone()),
                true,
            )
            .await
            .unwrap();
        let mut info = file("f.bin", &naming::data_blob_name(blob_uuid), &content);
        info.checksum = "deadbeef".to_string(); // force mismatch
        info.part_size = content.len() as u64 * 2;

        write_manifest(&shard_dir, snapshot_uuid, vec![info]).await;

        let target = Arc::new(RecordingTarget::default());
        let target_dyn: Arc<dyn RestoreTarget> = target.clone();
        let result = restore_shard(request(shard_dir.clone(), snapshot_uuid, target_dyn)).await;

        assert!(result.is_err());
        assert!(target.corrupted.load(Ordering::SeqCst));
        assert_eq!(target.removed.lock().unwrap().as_slice(), &["f.bin".to_string()]);
    }

    #[tokio::test]
    async fn already_idle_returns_immediately() {
        let ongoing = OngoingRestores::new();
        ongoing.await_idle().await;
    }
}
