//! Filesystem blob-store backend (SPEC_FULL.md §4.15), grounded in the
//! teacher's `tools::file_set_contents`: write to a sibling temp file with
//! `tempfile`, then atomically rename into place. Directory listing uses
//! `walkdir` restricted to depth 1, mirroring a single container's scope.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::blob_store::{BlobContainer, BlobReader, ChildEntry, Purpose};

pub struct FilesystemBlobContainer {
    root: PathBuf,
}

impl FilesystemBlobContainer {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn write_blocking(root: PathBuf, name: String, bytes: Vec<u8>, fail_if_exists: bool) -> std::io::Result<()> {
        std::fs::create_dir_all(&root)?;
        let target = root.join(&name);
        if fail_if_exists && target.exists() {
            return Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, format!("blob {} already exists", name)));
        }
        let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl BlobContainer for FilesystemBlobContainer {
    async fn list_by_prefix(&self, _purpose: Purpose, prefix: &str) -> anyhow::Result<BTreeMap<String, u64>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut out = BTreeMap::new();
            if !root.exists() {
                return Ok(out);
            }
            for entry in walkdir::WalkDir::new(&root).min_depth(1).max_depth(1) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&prefix) {
                    out.insert(name, entry.metadata()?.len());
                }
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }

    async fn list_children(&self, _purpose: Purpose) -> anyhow::Result<BTreeMap<String, ChildEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = BTreeMap::new();
            if !root.exists() {
                return Ok(out);
            }
            for entry in walkdir::WalkDir::new(&root).min_depth(1).max_depth(1) {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().is_dir() {
                    out.insert(name, ChildEntry::Container);
                } else if entry.file_type().is_file() {
                    out.insert(name, ChildEntry::Blob { size: entry.metadata()?.len() });
                }
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }

    async fn read(&self, purpose: Purpose, name: &str) -> anyhow::Result<BlobReader> {
        self.read_range(purpose, name, 0, u64::MAX).await
    }

    async fn read_range(&self, _purpose: Purpose, name: &str, offset: u64, length: u64) -> anyhow::Result<BlobReader> {
        use tokio::io::AsyncSeekExt;
        let path = self.path_for(name);
        let mut file = tokio::fs::File::open(&path).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        let mut buf = Vec::new();
        if length == u64::MAX {
            file.read_to_end(&mut buf).await?;
        } else {
            let mut limited = file.take(length);
            limited.read_to_end(&mut buf).await?;
        }
        Ok(Box::pin(std::io::Cursor::new(buf)))
    }

    async fn write(
        &self,
        purpose: Purpose,
        name: &str,
        len: u64,
        data: BlobReader,
        fail_if_exists: bool,
    ) -> anyhow::Result<()> {
        self.write_atomic(purpose, name, len, data, fail_if_exists).await
    }

    async fn write_atomic(
        &self,
        _purpose: Purpose,
        name: &str,
        _len: u64,
        mut data: BlobReader,
        fail_if_exists: bool,
    ) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes).await?;
        let root = self.root.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || Self::write_blocking(root, name, bytes, fail_if_exists)).await??;
        Ok(())
    }

    async fn delete(&self, _purpose: Purpose) -> anyhow::Result<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            Ok::<_, std::io::Error>(())
        })
        .await??;
        Ok(())
    }

    async fn delete_blobs_ignoring_if_not_exists(&self, _purpose: Purpose, names: &[String]) -> anyhow::Result<()> {
        for name in names {
            let path = self.path_for(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn blob_exists(&self, _purpose: Purpose, name: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::metadata(self.path_for(name)).await.is_ok())
    }

    async fn stats(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        let entries = self.list_children(Purpose::Snapshot).await?;
        let mut stats = BTreeMap::new();
        let blob_count = entries.values().filter(|e| matches!(e, ChildEntry::Blob { .. })).count();
        let total_bytes: u64 = entries
            .values()
            .filter_map(|e| match e {
                ChildEntry::Blob { size } => Some(*size),
                ChildEntry::Container => None,
            })
            .sum();
        stats.insert("blob_count".to_string(), blob_count as u64);
        stats.insert("total_bytes".to_string(), total_bytes);
        Ok(stats)
    }

    fn child(&self, name: &str) -> Arc<dyn BlobContainer> {
        Self::new(self.root.join(name))
    }
}

fn _assert_path_like(_: &Path) {}
