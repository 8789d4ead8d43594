//! The blob store abstraction (SPEC_FULL.md §6). The core only ever talks
//! to this trait; it never assumes a concrete backend. Two reference
//! implementations ship in [`crate::backends`] for testing and local use.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Accounting tag passed through to the backend so it can bucket usage
/// without the core needing to know how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Snapshot,
    SnapshotMeta,
    ClusterState,
}

pub type BlobReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;
pub type BlobWriter = Pin<Box<dyn AsyncWrite + Send + Unpin>>;

/// What a child entry under a listed container is: either another
/// container (a "directory") or a leaf blob with a known size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEntry {
    Container,
    Blob { size: u64 },
}

/// A container-relative blob store: every method is scoped to the
/// container this handle was obtained for (a base path, a shard
/// directory, an index's metadata directory, ...). Hosts construct a
/// `BlobContainer` per directory the core needs to address; the trait
/// does not expose global path traversal.
#[async_trait]
pub trait BlobContainer: Send + Sync {
    /// List every blob directly under this container whose name starts
    /// with `prefix`, returning name -> size.
    async fn list_by_prefix(&self, purpose: Purpose, prefix: &str) -> anyhow::Result<BTreeMap<String, u64>>;

    /// List every immediate child of this container (blobs and nested
    /// containers).
    async fn list_children(&self, purpose: Purpose) -> anyhow::Result<BTreeMap<String, ChildEntry>>;

    /// Open a blob for reading.
    async fn read(&self, purpose: Purpose, name: &str) -> anyhow::Result<BlobReader>;

    /// Open a byte-range slice of a blob for reading (used by the restore
    /// pipeline's per-part downloads).
    async fn read_range(&self, purpose: Purpose, name: &str, offset: u64, length: u64) -> anyhow::Result<BlobReader>;

    /// Write a blob of known length. `fail_if_exists` makes the write an
    /// atomic create: it must fail rather than overwrite if `name` already
    /// exists, honoring the "immutable body" invariant (SPEC_FULL.md §3).
    async fn write(
        &self,
        purpose: Purpose,
        name: &str,
        len: u64,
        data: BlobReader,
        fail_if_exists: bool,
    ) -> anyhow::Result<()>;

    /// Like [`write`](Self::write), but the backend must guarantee the
    /// write is atomic where the underlying storage supports it (used for
    /// the root `index-{G}` and shard `index-{gen}` blobs). Backends that
    /// cannot offer atomicity should document the gap rather than silently
    /// downgrading -- see `has_atomic_overwrites`.
    async fn write_atomic(
        &self,
        purpose: Purpose,
        name: &str,
        len: u64,
        data: BlobReader,
        fail_if_exists: bool,
    ) -> anyhow::Result<()>;

    /// Whether this backend's `write_atomic` is genuinely atomic. A `false`
    /// here means durable metadata overwrites (like `index.latest`) must
    /// be treated as best-effort by the caller, per SPEC_FULL.md §4.4.
    fn has_atomic_overwrites(&self) -> bool {
        true
    }

    /// Delete every blob in this container (used when an entire shard
    /// directory or index directory is no longer referenced).
    async fn delete(&self, purpose: Purpose) -> anyhow::Result<()>;

    /// Delete the named blobs, ignoring individual not-found errors (a
    /// concurrent cleanup sweep may have already removed one).
    async fn delete_blobs_ignoring_if_not_exists(&self, purpose: Purpose, names: &[String]) -> anyhow::Result<()>;

    async fn blob_exists(&self, purpose: Purpose, name: &str) -> anyhow::Result<bool>;

    /// Backend-reported usage statistics, passed through verbatim.
    async fn stats(&self) -> anyhow::Result<BTreeMap<String, u64>>;

    /// Address a nested container (e.g. a shard directory under this
    /// index's container, or an index's container under the repository
    /// root).
    fn child(&self, name: &str) -> Arc<dyn BlobContainer>;
}

/// Convenience helper: buffer a small in-memory payload into a `BlobReader`.
pub fn reader_from_bytes(bytes: Vec<u8>) -> BlobReader {
    Box::pin(std::io::Cursor::new(bytes))
}
