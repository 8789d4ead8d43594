//! The core data model (SPEC_FULL.md §3): `RepositoryData`, the shard
//! snapshot set, and the value types they're built from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// (human name, opaque uuid). The uuid is the referent in blob paths; the
/// name is display-only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub name: String,
    pub uuid: Uuid,
}

impl SnapshotId {
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self { name: name.into(), uuid }
    }
}

/// (human name, opaque id). The id is chosen by the cluster at
/// first-snapshot time and stable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId {
    pub name: String,
    pub id: String,
}

impl IndexId {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self { name: name.into(), id: id.into() }
    }
}

/// A shard within a repository's view of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepositoryShardId {
    pub shard: u32,
}

/// Either a uuid (modern layout) or a monotonically-increasing integer
/// (legacy layout), or one of the two sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardGeneration {
    Uuid(Uuid),
    Numbered(u64),
    /// The shard directory has no live snapshots.
    Deleted,
    /// No blob exists yet for this shard.
    New,
}

impl ShardGeneration {
    pub fn is_live(self) -> bool {
        !matches!(self, ShardGeneration::Deleted | ShardGeneration::New)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Started,
    Success,
    Failed,
    PartialSuccess,
}

/// Per-snapshot details stored in `RepositoryData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDetails {
    pub state: SnapshotState,
    pub start_time_millis: i64,
    pub end_time_millis: i64,
    pub version: String,
    pub indices: BTreeSet<String>,
}

/// The root `index-{N}` blob: a self-describing, acyclic snapshot of
/// repository state. Rebuilt wholesale on each mutation rather than
/// mutated in place, per SPEC_FULL.md §9 ("Cyclic/Shared graphs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryData {
    pub generation: u64,
    pub repository_uuid: Uuid,
    pub cluster_uuid: String,
    pub snapshots: BTreeMap<Uuid, SnapshotId>,
    pub snapshot_details: BTreeMap<Uuid, SnapshotDetails>,
    /// index-id -> snapshot-uuids containing it, oldest first.
    pub indices: BTreeMap<String, Vec<Uuid>>,
    /// (snapshot-uuid, index-id) -> shard-generation vector, one entry per shard.
    pub shard_generations: BTreeMap<(Uuid, String), Vec<ShardGeneration>>,
    /// metadata-content-hash -> metadata-blob-uuid, for cross-snapshot
    /// index-metadata dedup (modern layout only).
    pub index_metadata_identifiers: BTreeMap<String, Uuid>,
}

impl RepositoryData {
    pub fn empty(repository_uuid: Uuid, cluster_uuid: impl Into<String>) -> Self {
        Self {
            generation: 0,
            repository_uuid,
            cluster_uuid: cluster_uuid.into(),
            snapshots: BTreeMap::new(),
            snapshot_details: BTreeMap::new(),
            indices: BTreeMap::new(),
            shard_generations: BTreeMap::new(),
            index_metadata_identifiers: BTreeMap::new(),
        }
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn contains_snapshot(&self, uuid: Uuid) -> bool {
        self.snapshots.contains_key(&uuid)
    }

    pub fn shard_generations_for(&self, snapshot: Uuid, index_id: &str) -> Option<&[ShardGeneration]> {
        self.shard_generations
            .get(&(snapshot, index_id.to_string()))
            .map(|v| v.as_slice())
    }

    /// Build a new `RepositoryData` with `generation` bumped and the given
    /// snapshot added. Never mutates `self`; SPEC_FULL.md treats
    /// `RepositoryData` as an immutable value type.
    pub fn with_snapshot_added(
        &self,
        new_generation: u64,
        snapshot_id: SnapshotId,
        details: SnapshotDetails,
        shard_generations: BTreeMap<String, Vec<ShardGeneration>>,
        new_metadata_identifiers: BTreeMap<String, Uuid>,
    ) -> Self {
        let mut next = self.clone();
        next.generation = new_generation;

        for index_id in &details.indices {
            let entry = next.indices.entry(index_id.clone()).or_default();
            if !entry.contains(&snapshot_id.uuid) {
                entry.push(snapshot_id.uuid);
            }
        }

        for (index_id, gens) in shard_generations {
            next.shard_generations.insert((snapshot_id.uuid, index_id), gens);
        }

        next.index_metadata_identifiers.extend(new_metadata_identifiers);
        next.snapshots.insert(snapshot_id.uuid, snapshot_id.clone());
        next.snapshot_details.insert(snapshot_id.uuid, details);
        next
    }

    /// Build a new `RepositoryData` with the given snapshots removed and
    /// updated shard-generations for the shards that survived the delete.
    pub fn with_snapshots_removed(
        &self,
        new_generation: u64,
        removed: &BTreeSet<Uuid>,
        updated_shard_generations: BTreeMap<(Uuid, String), Vec<ShardGeneration>>,
    ) -> Self {
        let mut next = self.clone();
        next.generation = new_generation;

        for uuid in removed {
            next.snapshots.remove(uuid);
            next.snapshot_details.remove(uuid);
        }
        next.shard_generations.retain(|(uuid, _), _| !removed.contains(uuid));

        for index_list in next.indices.values_mut() {
            index_list.retain(|uuid| !removed.contains(uuid));
        }
        next.indices.retain(|_, list| !list.is_empty());

        for (key, gens) in updated_shard_generations {
            next.shard_generations.insert(key, gens);
        }

        next
    }
}

/// A single file in a shard's live file set, as recorded in a shard
/// snapshot set / per-snapshot manifest (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Physical file name as it appears in the live index commit.
    pub physical_name: String,
    /// Logical blob name: `__{uuid}`/`__{uuid}.part{k}` for uploaded
    /// files, `v__{hash}` for virtualized ones.
    pub blob_name: String,
    pub length: u64,
    pub checksum: String,
    pub writer_uuid: Uuid,
    pub part_size: u64,
    /// Present only for virtualized files: their content, inlined.
    pub inline_content: Option<Vec<u8>>,
}

impl FileInfo {
    pub fn is_virtual(&self) -> bool {
        self.inline_content.is_some()
    }

    pub fn number_of_parts(&self) -> u32 {
        if self.part_size == 0 || self.length == 0 {
            return 1;
        }
        ((self.length + self.part_size - 1) / self.part_size) as u32
    }

    pub fn matches_content(&self, physical_name: &str, length: u64, checksum: &str, writer_uuid: Uuid) -> bool {
        self.physical_name == physical_name
            && self.length == length
            && self.checksum == checksum
            && self.writer_uuid == writer_uuid
    }
}

/// The per-(snapshot, shard) file manifest stored at `snap-{uuid}.dat`
/// under a shard directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_uuid: Uuid,
    pub files: Vec<FileInfo>,
    pub start_time_millis: i64,
    pub duration_millis: i64,
    pub incremental_file_count: u32,
    pub total_file_count: u32,
    pub incremental_size: u64,
    pub total_size: u64,
    /// Opaque fingerprint of the live index commit this snapshot was taken
    /// from, used by the shard-snapshot pipeline's fast-path reuse.
    pub shard_state_identifier: Option<String>,
}

/// The per-shard `index-{shard-gen}` blob: an ordered list of manifests
/// for every snapshot still live in this shard. Deliberately acyclic with
/// [`SnapshotManifest`] -- the set only names manifests by uuid, manifests
/// never back-reference the set (SPEC_FULL.md §9).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShardSnapshotSet {
    pub snapshots: Vec<ShardSnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSnapshotEntry {
    pub snapshot_uuid: Uuid,
    pub files: Vec<FileInfo>,
    pub shard_state_identifier: Option<String>,
}

impl ShardSnapshotSet {
    pub fn find(&self, snapshot_uuid: Uuid) -> Option<&ShardSnapshotEntry> {
        self.snapshots.iter().find(|e| e.snapshot_uuid == snapshot_uuid)
    }

    /// Every file reused across snapshots in this shard, deduplicated by
    /// blob name -- used when looking for an existing `FileInfo` to reuse
    /// during diffing (SPEC_FULL.md §4.5 step 3).
    pub fn all_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.snapshots.iter().flat_map(|e| e.files.iter())
    }

    pub fn find_reusable(&self, physical_name: &str, length: u64, checksum: &str, writer_uuid: Uuid) -> Option<&FileInfo> {
        self.all_files()
            .find(|f| !f.is_virtual() && f.matches_content(physical_name, length, checksum, writer_uuid))
    }

    pub fn with_entry_added(&self, entry: ShardSnapshotEntry) -> Self {
        let mut next = self.clone();
        next.snapshots.retain(|e| e.snapshot_uuid != entry.snapshot_uuid);
        next.snapshots.push(entry);
        next
    }

    pub fn with_entries_removed(&self, removed: &BTreeSet<Uuid>) -> Self {
        let mut next = self.clone();
        next.snapshots.retain(|e| !removed.contains(&e.snapshot_uuid));
        next
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Every logical blob name referenced by a surviving manifest,
    /// excluding virtualized files (they never have a stored blob).
    pub fn referenced_blob_names(&self) -> BTreeSet<String> {
        self.all_files()
            .filter(|f| !f.is_virtual())
            .map(|f| f.blob_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, blob: &str) -> FileInfo {
        FileInfo {
            physical_name: name.to_string(),
            blob_name: blob.to_string(),
            length: 5,
            checksum: "deadbeef".to_string(),
            writer_uuid: Uuid::nil(),
            part_size: 1024,
            inline_content: None,
        }
    }

    #[test]
    fn shard_snapshot_set_dedups_by_snapshot_uuid_on_add() {
        let set = ShardSnapshotSet::default();
        let s1 = Uuid::new_v4();
        let entry = ShardSnapshotEntry {
            snapshot_uuid: s1,
            files: vec![file("a.bin", "__x")],
            shard_state_identifier: None,
        };
        let set = set.with_entry_added(entry.clone());
        let set = set.with_entry_added(entry);
        assert_eq!(set.snapshots.len(), 1);
    }

    #[test]
    fn referenced_blob_names_excludes_virtual_files() {
        let mut virt = file("small.bin", "v__hash");
        virt.inline_content = Some(vec![1, 2, 3]);
        let entry = ShardSnapshotEntry {
            snapshot_uuid: Uuid::new_v4(),
            files: vec![file("a.bin", "__x"), virt],
            shard_state_identifier: None,
        };
        let set = ShardSnapshotSet::default().with_entry_added(entry);
        let refs = set.referenced_blob_names();
        assert!(refs.contains("__x"));
        assert!(!refs.contains("v__hash"));
    }

    #[test]
    fn repository_data_with_snapshot_added_is_not_mutating() {
        let base = RepositoryData::empty(Uuid::new_v4(), "cluster-a");
        let id = SnapshotId::new("snap-1", Uuid::new_v4());
        let details = SnapshotDetails {
            state: SnapshotState::Success,
            start_time_millis: 0,
            end_time_millis: 1,
            version: "1".into(),
            indices: std::iter::once("idx".to_string()).collect(),
        };
        let next = base.with_snapshot_added(1, id.clone(), details, BTreeMap::new(), BTreeMap::new());
        assert_eq!(base.snapshot_count(), 0);
        assert_eq!(next.snapshot_count(), 1);
        assert!(next.contains_snapshot(id.uuid));
    }
}
