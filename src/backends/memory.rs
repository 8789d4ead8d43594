//! In-memory blob-store backend (SPEC_FULL.md §4.15): used by the property
//! tests of §8 and by unit tests throughout. Supports fault injection so
//! best-effort-consistency and corruption paths can be exercised
//! deterministically instead of racing real timers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::blob_store::{BlobContainer, BlobReader, ChildEntry, Purpose};

#[derive(Default)]
struct Inner {
    blobs: BTreeMap<String, Vec<u8>>,
    /// Names written while `drop_after_write` was armed: durable but
    /// invisible to `list_by_prefix`/`list_children`/`blob_exists` until
    /// [`MemoryBlobContainer::reveal_hidden`] is called.
    hidden: BTreeMap<String, ()>,
    children: BTreeMap<String, Arc<MemoryBlobContainer>>,
}

/// Shared fault-injection knobs. Cloning shares the same knobs; attach the
/// same injector to a root container and every `child()` it produces so
/// tests can flip one switch repository-wide.
#[derive(Clone, Default)]
pub struct FaultInjector {
    drop_after_write: Arc<AtomicBool>,
    delay_list_millis: Arc<AtomicU64>,
}

impl FaultInjector {
    pub fn set_drop_after_write(&self, enabled: bool) {
        self.drop_after_write.store(enabled, Ordering::SeqCst);
    }

    pub fn set_delay_list_millis(&self, millis: u64) {
        self.delay_list_millis.store(millis, Ordering::SeqCst);
    }
}

pub struct MemoryBlobContainer {
    inner: Mutex<Inner>,
    faults: FaultInjector,
}

impl MemoryBlobContainer {
    pub fn new() -> Arc<Self> {
        Self::with_faults(FaultInjector::default())
    }

    pub fn with_faults(faults: FaultInjector) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            faults,
        })
    }

    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    /// Make every blob written while `drop_after_write` was armed visible.
    pub fn reveal_hidden(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.hidden.clear();
    }

    fn do_write(&self, name: &str, bytes: Vec<u8>, fail_if_exists: bool) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if fail_if_exists && inner.blobs.contains_key(name) {
            anyhow::bail!("blob {} already exists", name);
        }
        let hide = self.faults.drop_after_write.load(Ordering::SeqCst);
        inner.blobs.insert(name.to_string(), bytes);
        if hide {
            inner.hidden.insert(name.to_string(), ());
        } else {
            inner.hidden.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobContainer for MemoryBlobContainer {
    async fn list_by_prefix(&self, _purpose: Purpose, prefix: &str) -> anyhow::Result<BTreeMap<String, u64>> {
        let delay = self.faults.delay_list_millis.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix) && !inner.hidden.contains_key(*name))
            .map(|(name, bytes)| (name.clone(), bytes.len() as u64))
            .collect())
    }

    async fn list_children(&self, _purpose: Purpose) -> anyhow::Result<BTreeMap<String, ChildEntry>> {
        let delay = self.faults.delay_list_millis.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let inner = self.inner.lock().unwrap();
        let mut out = BTreeMap::new();
        for (name, bytes) in inner.blobs.iter() {
            if !inner.hidden.contains_key(name) {
                out.insert(name.clone(), ChildEntry::Blob { size: bytes.len() as u64 });
            }
        }
        for name in inner.children.keys() {
            out.insert(name.clone(), ChildEntry::Container);
        }
        Ok(out)
    }

    async fn read(&self, _purpose: Purpose, name: &str) -> anyhow::Result<BlobReader> {
        let inner = self.inner.lock().unwrap();
        let bytes = inner
            .blobs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("blob {} not found", name))?
            .clone();
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn read_range(&self, _purpose: Purpose, name: &str, offset: u64, length: u64) -> anyhow::Result<BlobReader> {
        let inner = self.inner.lock().unwrap();
        let bytes = inner
            .blobs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("blob {} not found", name))?;
        let start = offset as usize;
        let end = (start + length as usize).min(bytes.len());
        let slice = bytes.get(start..end).unwrap_or(&[]).to_vec();
        Ok(Box::pin(std::io::Cursor::new(slice)))
    }

    async fn write(
        &self,
        _purpose: Purpose,
        name: &str,
        _len: u64,
        mut data: BlobReader,
        fail_if_exists: bool,
    ) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut data, &mut bytes).await?;
        self.do_write(name, bytes, fail_if_exists)
    }

    async fn write_atomic(
        &self,
        purpose: Purpose,
        name: &str,
        len: u64,
        data: BlobReader,
        fail_if_exists: bool,
    ) -> anyhow::Result<()> {
        self.write(purpose, name, len, data, fail_if_exists).await
    }

    async fn delete(&self, _purpose: Purpose) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.blobs.clear();
        inner.hidden.clear();
        inner.children.clear();
        Ok(())
    }

    async fn delete_blobs_ignoring_if_not_exists(&self, _purpose: Purpose, names: &[String]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for name in names {
            inner.blobs.remove(name);
            inner.hidden.remove(name);
        }
        Ok(())
    }

    async fn blob_exists(&self, _purpose: Purpose, name: &str) -> anyhow::Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.blobs.contains_key(name) && !inner.hidden.contains_key(name))
    }

    async fn stats(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        let inner = self.inner.lock().unwrap();
        let mut stats = BTreeMap::new();
        stats.insert("blob_count".to_string(), inner.blobs.len() as u64);
        stats.insert(
            "total_bytes".to_string(),
            inner.blobs.values().map(|b| b.len() as u64).sum(),
        );
        Ok(stats)
    }

    fn child(&self, name: &str) -> Arc<dyn BlobContainer> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .children
            .entry(name.to_string())
            .or_insert_with(|| MemoryBlobContainer::with_faults(self.faults.clone()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::reader_from_bytes;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = MemoryBlobContainer::new();
        store
            .write(Purpose::Snapshot, "foo", 3, reader_from_bytes(b"abc".to_vec()), true)
            .await
            .unwrap();
        let mut reader = store.read(Purpose::Snapshot, "foo").await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn fail_if_exists_rejects_a_second_write() {
        let store = MemoryBlobContainer::new();
        store
            .write(Purpose::Snapshot, "foo", 1, reader_from_bytes(b"a".to_vec()), true)
            .await
            .unwrap();
        let err = store
            .write(Purpose::Snapshot, "foo", 1, reader_from_bytes(b"b".to_vec()), true)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn child_containers_are_independent_and_stable() {
        let store = MemoryBlobContainer::new();
        let child_a = store.child("shard-0");
        child_a
            .write(Purpose::Snapshot, "x", 1, reader_from_bytes(b"1".to_vec()), true)
            .await
            .unwrap();
        let child_a_again = store.child("shard-0");
        assert!(child_a_again.blob_exists(Purpose::Snapshot, "x").await.unwrap());
        let child_b = store.child("shard-1");
        assert!(!child_b.blob_exists(Purpose::Snapshot, "x").await.unwrap());
    }

    #[tokio::test]
    async fn drop_after_write_hides_from_listing_until_revealed() {
        let store = MemoryBlobContainer::new();
        store.faults().set_drop_after_write(true);
        store
            .write(Purpose::Snapshot, "index-1", 1, reader_from_bytes(b"x".to_vec()), true)
            .await
            .unwrap();
        let listed = store.list_by_prefix(Purpose::Snapshot, "index-").await.unwrap();
        assert!(listed.is_empty());
        assert!(!store.blob_exists(Purpose::Snapshot, "index-1").await.unwrap());

        store.reveal_hidden();
        let listed = store.list_by_prefix(Purpose::Snapshot, "index-").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
