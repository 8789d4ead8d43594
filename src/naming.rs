//! Blob naming & path layout (SPEC_FULL.md §4.1). Pure: no I/O.

use uuid::Uuid;

pub const ROOT_METADATA_PREFIX: &str = "index-";
pub const LATEST_POINTER_NAME: &str = "index.latest";
pub const SNAPSHOT_INFO_PREFIX: &str = "snap-";
pub const SNAPSHOT_INFO_SUFFIX: &str = ".dat";
pub const GLOBAL_METADATA_PREFIX: &str = "meta-";
pub const GLOBAL_METADATA_SUFFIX: &str = ".dat";
pub const INDEX_METADATA_PREFIX: &str = "meta-";
pub const INDEX_METADATA_SUFFIX: &str = ".dat";
pub const SHARD_INDEX_PREFIX: &str = "index-";
pub const UPLOADED_BLOB_PREFIX: &str = "__";
pub const VIRTUAL_BLOB_PREFIX: &str = "v__";
pub const PART_SUFFIX: &str = ".part";
pub const VERIFICATION_DIR_PREFIX: &str = "tests-";
pub const VERIFICATION_MASTER_NAME: &str = "master.dat";
pub const INDICES_DIR: &str = "indices";

/// `{base}/index-{N}`
pub fn root_metadata_name(generation: u64) -> String {
    format!("{}{}", ROOT_METADATA_PREFIX, generation)
}

/// Parse `index-{N}` (or a legacy shard `index-{N}` filename) back into its
/// generation. Tolerant of a leading `index-` only; any other prefix is `None`.
pub fn parse_numbered_generation(name: &str) -> Option<u64> {
    name.strip_prefix(ROOT_METADATA_PREFIX)?.parse::<u64>().ok()
}

/// `{base}/snap-{snapshot_uuid}.dat`
pub fn snapshot_info_name(snapshot_uuid: Uuid) -> String {
    format!("{}{}{}", SNAPSHOT_INFO_PREFIX, snapshot_uuid, SNAPSHOT_INFO_SUFFIX)
}

/// `{base}/meta-{snapshot_uuid}.dat` (legacy global metadata layout)
pub fn global_metadata_name(snapshot_uuid: Uuid) -> String {
    format!("{}{}{}", GLOBAL_METADATA_PREFIX, snapshot_uuid, GLOBAL_METADATA_SUFFIX)
}

/// `{base}/indices/{index_id}/meta-{hash}.dat`
pub fn index_metadata_path(index_id: &str, content_hash: &str) -> String {
    format!(
        "{}/{}/{}{}{}",
        INDICES_DIR, index_id, INDEX_METADATA_PREFIX, content_hash, INDEX_METADATA_SUFFIX
    )
}

/// `{base}/indices/{index_id}/{shard}/`
pub fn shard_directory(index_id: &str, shard: u32) -> String {
    format!("{}/{}/{}", INDICES_DIR, index_id, shard)
}

/// `{shard_dir}/index-{shard_gen}` where `shard_gen` is a plain integer
/// (legacy layout).
pub fn shard_index_name_numbered(generation: u64) -> String {
    format!("{}{}", SHARD_INDEX_PREFIX, generation)
}

/// `{shard_dir}/index-{uuid-base64}` (modern layout). Rendered using the
/// URL-safe, unpadded base64 representation of the uuid's 16 raw bytes, so
/// names stay filesystem- and URL-safe.
pub fn shard_index_name_uuid(generation: Uuid) -> String {
    format!("{}{}", SHARD_INDEX_PREFIX, uuid_to_base64(generation))
}

/// `{shard_dir}/snap-{snapshot_uuid}.dat`
pub fn shard_manifest_name(snapshot_uuid: Uuid) -> String {
    snapshot_info_name(snapshot_uuid)
}

/// `{shard_dir}/__{blob_uuid}` (whole-file data blob).
pub fn data_blob_name(blob_uuid: Uuid) -> String {
    format!("{}{}", UPLOADED_BLOB_PREFIX, blob_uuid)
}

/// `{shard_dir}/__{blob_uuid}.part{k}`
pub fn data_blob_part_name(blob_uuid: Uuid, part: u32) -> String {
    format!("{}{}{}{}", UPLOADED_BLOB_PREFIX, blob_uuid, PART_SUFFIX, part)
}

/// `v__{content_hash}`: a virtualized file's logical blob name. No blob is
/// ever written at this name -- the bytes live inline in the manifest.
pub fn virtual_blob_name(content_hash: &str) -> String {
    format!("{}{}", VIRTUAL_BLOB_PREFIX, content_hash)
}

pub fn is_virtual_blob_name(name: &str) -> bool {
    name.starts_with(VIRTUAL_BLOB_PREFIX)
}

pub fn is_uploaded_blob_name(name: &str) -> bool {
    name.starts_with(UPLOADED_BLOB_PREFIX) && !is_virtual_blob_name(name)
}

/// `{base}/tests-{seed}/`
pub fn verification_dir(seed: u64) -> String {
    format!("{}{}", VERIFICATION_DIR_PREFIX, seed)
}

pub fn verification_master_name(seed: u64) -> String {
    format!("{}/{}", verification_dir(seed), VERIFICATION_MASTER_NAME)
}

pub fn verification_data_node_name(seed: u64, node_id: &str) -> String {
    format!("{}/data-{}.dat", verification_dir(seed), node_id)
}

/// URL-safe, unpadded base64 of a uuid's 16 raw bytes -- used wherever the
/// spec calls for "a uuid's base64 representation" in a blob name.
pub fn uuid_to_base64(id: Uuid) -> String {
    base64::encode_config(id.as_bytes(), base64::URL_SAFE_NO_PAD)
}

/// Inverse of [`uuid_to_base64`]; also accepts a plain hyphenated uuid
/// string so readers tolerate either rendering, as the spec requires.
pub fn parse_uuid_name(name: &str) -> Option<Uuid> {
    if let Ok(id) = Uuid::parse_str(name) {
        return Some(id);
    }
    let bytes = base64::decode_config(name, base64::URL_SAFE_NO_PAD).ok()?;
    Uuid::from_slice(&bytes).ok()
}

/// Strip the `index-` prefix from a shard-index blob name and try to
/// recover either a numeric generation or a uuid generation. Unparseable
/// names are tolerated (warn-and-continue, per SPEC_FULL.md's Open
/// Questions) by returning `None` rather than erroring.
pub fn parse_shard_index_name(name: &str) -> Option<ShardIndexNameKind> {
    let rest = name.strip_prefix(SHARD_INDEX_PREFIX)?;
    if let Ok(n) = rest.parse::<u64>() {
        return Some(ShardIndexNameKind::Numbered(n));
    }
    parse_uuid_name(rest).map(ShardIndexNameKind::Uuid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardIndexNameKind {
    Numbered(u64),
    Uuid(Uuid),
}
