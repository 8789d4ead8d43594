//! Stale-blob identification shared by the finalize, delete, and cleanup
//! pipelines (SPEC_FULL.md §4.6-4.8, Invariants 4 & 5). This module only
//! *identifies* garbage; callers decide when and on which task runner to
//! actually delete it.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::blob_store::{BlobContainer, ChildEntry, Purpose};
use crate::naming;
use crate::repository_data::{RepositoryData, ShardGeneration, ShardSnapshotSet};

/// A root-level blob is stale iff (Invariant 5): it is an `index-{n}` with
/// `n` less than the generation that was just written, or a per-snapshot
/// `snap-*.dat`/`meta-*.dat` blob whose uuid is not in the current
/// snapshot set. `keep_generation` is always the generation the caller
/// just committed -- anything older is safe to reclaim.
pub async fn stale_root_blobs(
    root: &dyn BlobContainer,
    data: &RepositoryData,
    keep_generation: u64,
) -> anyhow::Result<Vec<String>> {
    let children = root.list_children(Purpose::SnapshotMeta).await?;
    let mut stale = Vec::new();

    for (name, entry) in children {
        if !matches!(entry, ChildEntry::Blob { .. }) {
            continue;
        }
        if let Some(n) = naming::parse_numbered_generation(&name) {
            if n < keep_generation {
                stale.push(name);
            }
            continue;
        }
        if let Some(rest) = name
            .strip_prefix(naming::SNAPSHOT_INFO_PREFIX)
            .and_then(|s| s.strip_suffix(naming::SNAPSHOT_INFO_SUFFIX))
        {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                if !data.contains_snapshot(uuid) {
                    stale.push(name);
                }
            }
            continue;
        }
        if let Some(rest) = name
            .strip_prefix(naming::GLOBAL_METADATA_PREFIX)
            .and_then(|s| s.strip_suffix(naming::GLOBAL_METADATA_SUFFIX))
        {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                if !data.contains_snapshot(uuid) {
                    stale.push(name);
                }
            }
        }
    }

    Ok(stale)
}

/// Root-level index directories (under `indices/`) no longer referenced by
/// any surviving snapshot are candidates for a whole-container delete
/// rather than a per-blob sweep.
pub fn unreferenced_index_ids(data: &RepositoryData, known_index_ids: &BTreeSet<String>) -> BTreeSet<String> {
    known_index_ids
        .iter()
        .filter(|id| !data.indices.contains_key(id.as_str()))
        .cloned()
        .collect()
}

/// A shard-level blob is stale iff (Invariant 4): it is a shard-index blob
/// whose generation is not `current`, or a manifest blob (`snap-*.dat`)
/// whose uuid is not in `surviving`, or a data blob whose canonical name
/// is not referenced by `set`, or a recognized temporary-upload blob (a
/// `.partN` fragment of a blob name that resolved to neither of the above
/// -- covered here because an unreferenced fragment's whole-blob name is
/// also unreferenced).
pub async fn stale_shard_blobs(
    shard_dir: &dyn BlobContainer,
    set: &ShardSnapshotSet,
    current: ShardGeneration,
    surviving: &BTreeSet<Uuid>,
) -> anyhow::Result<Vec<String>> {
    let children = shard_dir.list_children(Purpose::Snapshot).await?;
    let referenced = set.referenced_blob_names();
    let mut stale = Vec::new();

    for (name, entry) in children {
        if !matches!(entry, ChildEntry::Blob { .. }) {
            continue;
        }
        if let Some(kind) = naming::parse_shard_index_name(&name) {
            let is_current = match (kind, current) {
                (naming::ShardIndexNameKind::Numbered(n), ShardGeneration::Numbered(c)) => n == c,
                (naming::ShardIndexNameKind::Uuid(u), ShardGeneration::Uuid(c)) => u == c,
                _ => false,
            };
            if !is_current {
                stale.push(name);
            }
            continue;
        }
        if let Some(rest) = name
            .strip_prefix(naming::SNAPSHOT_INFO_PREFIX)
            .and_then(|s| s.strip_suffix(naming::SNAPSHOT_INFO_SUFFIX))
        {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                if !surviving.contains(&uuid) {
                    stale.push(name);
                }
            }
            continue;
        }
        if naming::is_uploaded_blob_name(&name) {
            let canonical = canonical_data_blob_name(&name);
            if !referenced.contains(&canonical) {
                stale.push(name);
            }
        }
    }

    Ok(stale)
}

/// Strip a `.part{k}` suffix (if present) to get the logical blob name a
/// manifest would reference -- parts are never individually named in a
/// `FileInfo`, only the whole-file `__{uuid}` name is.
fn canonical_data_blob_name(name: &str) -> String {
    match name.find(naming::PART_SUFFIX) {
        Some(idx) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

/// Cap the number of shard-index generations a cleanup sweep will reclaim
/// in one pass (SPEC_FULL.md §4.6: "up to 1,000 back from the new
/// generation"), so a long-neglected shard directory doesn't turn one
/// finalize into an unbounded delete storm.
pub const MAX_SHARD_GENERATIONS_RECLAIMED_PER_SWEEP: usize = 1000;

pub fn cap_reclaim_list(mut names: Vec<String>) -> Vec<String> {
    if names.len() > MAX_SHARD_GENERATIONS_RECLAIMED_PER_SWEEP {
        names.truncate(MAX_SHARD_GENERATIONS_RECLAIMED_PER_SWEEP);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBlobContainer;
    use crate::blob_store::reader_from_bytes;
    use crate::repository_data::{FileInfo, ShardSnapshotEntry};
    use uuid::Uuid;

    fn file(name: &str, blob: &str) -> FileInfo {
        FileInfo {
            physical_name: name.to_string(),
            blob_name: blob.to_string(),
            length: 5,
            checksum: "c".to_string(),
            writer_uuid: Uuid::nil(),
            part_size: 1024,
            inline_content: None,
        }
    }

    #[tokio::test]
    async fn root_sweep_keeps_only_current_generation_and_live_snapshots() {
        let root = MemoryBlobContainer::new();
        root.write(Purpose::SnapshotMeta, "index-0", 1, reader_from_bytes(vec![0]), true).await.unwrap();
        root.write(Purpose::SnapshotMeta, "index-1", 1, reader_from_bytes(vec![0]), true).await.unwrap();
        let live = Uuid::new_v4();
        let dead = Uuid::new_v4();
        root.write(Purpose::SnapshotMeta, &naming::snapshot_info_name(live), 1, reader_from_bytes(vec![0]), true).await.unwrap();
        root.write(Purpose::SnapshotMeta, &naming::snapshot_info_name(dead), 1, reader_from_bytes(vec![0]), true).await.unwrap();

        let mut data = RepositoryData::empty(Uuid::new_v4(), "c");
        data.snapshots.insert(live, crate::repository_data::SnapshotId::new("s", live));

        let stale = stale_root_blobs(root.as_ref(), &data, 1).await.unwrap();
        assert!(stale.contains(&"index-0".to_string()));
        assert!(!stale.contains(&"index-1".to_string()));
        assert!(stale.contains(&naming::snapshot_info_name(dead)));
        assert!(!stale.contains(&naming::snapshot_info_name(live)));
    }

    #[tokio::test]
    async fn shard_sweep_reclaims_superseded_generation_and_orphaned_blob() {
        let shard_dir = MemoryBlobContainer::new();
        let old_gen = Uuid::new_v4();
        let new_gen = Uuid::new_v4();
        shard_dir
            .write(Purpose::Snapshot, &naming::shard_index_name_uuid(old_gen), 1, reader_from_bytes(vec![0]), true)
            .await
            .unwrap();
        shard_dir
            .write(Purpose::Snapshot, &naming::shard_index_name_uuid(new_gen), 1, reader_from_bytes(vec![0]), true)
            .await
            .unwrap();
        shard_dir.write(Purpose::Snapshot, "__orphan", 1, reader_from_bytes(vec![0]), true).await.unwrap();

        let surviving_uuid = Uuid::new_v4();
        let entry = ShardSnapshotEntry {
            snapshot_uuid: surviving_uuid,
            files: vec![file("a.bin", "__kept")],
            shard_state_identifier: None,
        };
        let set = ShardSnapshotSet::default().with_entry_added(entry);
        let surviving: BTreeSet<Uuid> = std::iter::once(surviving_uuid).collect();

        let stale = stale_shard_blobs(shard_dir.as_ref(), &set, ShardGeneration::Uuid(new_gen), &surviving).await.unwrap();
        assert!(stale.contains(&naming::shard_index_name_uuid(old_gen)));
        assert!(!stale.contains(&naming::shard_index_name_uuid(new_gen)));
        assert!(stale.contains(&"__orphan".to_string()));
    }
}
