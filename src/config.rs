//! Typed repository configuration.
//!
//! The core never locates or parses a config *file* -- that's the host's
//! job (see SPEC_FULL.md, "Out of scope"). It only consumes an already
//! materialized, `serde`-deserializable value carrying the recognized
//! keys below, with the documented defaults.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_io_buffer_size() -> usize {
    128 * 1024
}

pub const MIN_IO_BUFFER_SIZE: usize = 8 * 1024;
pub const MAX_IO_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Static configuration, fixed for the lifetime of a registered repository.
/// Changing any of these fields requires re-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Compress metadata blob bodies.
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Enable the in-memory `RepositoryData` cache.
    #[serde(default = "default_true")]
    pub cache_repository_data: bool,

    /// I/O buffer size hint, clamped to [`MIN_IO_BUFFER_SIZE`, `MAX_IO_BUFFER_SIZE`].
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: usize,

    /// Write `index.latest` after each root update, for URL-style readers.
    #[serde(default = "default_true")]
    pub support_url_repo: bool,

    /// Reject `finalize` once the snapshot count would exceed this. `None` = unbounded.
    #[serde(default)]
    pub max_number_of_snapshots: Option<u64>,

    /// Surfaced to callers; the core does not use this value itself.
    #[serde(default)]
    pub use_for_peer_recovery: bool,

    /// Reject all mutating operations.
    #[serde(default)]
    pub readonly: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            compress: true,
            cache_repository_data: true,
            io_buffer_size: default_io_buffer_size(),
            support_url_repo: true,
            max_number_of_snapshots: None,
            use_for_peer_recovery: false,
            readonly: false,
        }
    }
}

impl RepositoryConfig {
    pub fn clamped_io_buffer_size(&self) -> usize {
        self.io_buffer_size.clamp(MIN_IO_BUFFER_SIZE, MAX_IO_BUFFER_SIZE)
    }
}

/// Dynamic settings may change without rebuilding the repository: the rate
/// limiter observes them through an atomically-swappable handle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DynamicSettingsValues {
    /// Upload rate limit in bytes/sec, `0` = unlimited.
    pub max_snapshot_bytes_per_sec: u64,
    /// Download rate limit in bytes/sec, `0` = unlimited (the default).
    pub max_restore_bytes_per_sec: u64,
}

/// Shared, lock-free handle to the dynamic settings. Cloning is cheap (it
/// clones the `Arc` around the atomics); every clone observes updates made
/// through any other clone.
#[derive(Clone)]
pub struct DynamicSettings {
    snapshot_bytes_per_sec: Arc<AtomicU64>,
    restore_bytes_per_sec: Arc<AtomicU64>,
}

impl DynamicSettings {
    pub fn new(values: DynamicSettingsValues) -> Self {
        Self {
            snapshot_bytes_per_sec: Arc::new(AtomicU64::new(values.max_snapshot_bytes_per_sec)),
            restore_bytes_per_sec: Arc::new(AtomicU64::new(values.max_restore_bytes_per_sec)),
        }
    }

    pub fn max_snapshot_bytes_per_sec(&self) -> u64 {
        self.snapshot_bytes_per_sec.load(Ordering::Relaxed)
    }

    pub fn max_restore_bytes_per_sec(&self) -> u64 {
        self.restore_bytes_per_sec.load(Ordering::Relaxed)
    }

    pub fn set_max_snapshot_bytes_per_sec(&self, value: u64) {
        self.snapshot_bytes_per_sec.store(value, Ordering::Relaxed);
    }

    pub fn set_max_restore_bytes_per_sec(&self, value: u64) {
        self.restore_bytes_per_sec.store(value, Ordering::Relaxed);
    }
}

impl Default for DynamicSettings {
    fn default() -> Self {
        Self::new(DynamicSettingsValues::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = RepositoryConfig::default();
        assert!(cfg.compress);
        assert!(cfg.cache_repository_data);
        assert_eq!(cfg.io_buffer_size, 128 * 1024);
        assert!(cfg.support_url_repo);
        assert_eq!(cfg.max_number_of_snapshots, None);
        assert!(!cfg.use_for_peer_recovery);
        assert!(!cfg.readonly);
    }

    #[test]
    fn io_buffer_size_is_clamped() {
        let mut cfg = RepositoryConfig::default();
        cfg.io_buffer_size = 4;
        assert_eq!(cfg.clamped_io_buffer_size(), MIN_IO_BUFFER_SIZE);
        cfg.io_buffer_size = usize::MAX;
        assert_eq!(cfg.clamped_io_buffer_size(), MAX_IO_BUFFER_SIZE);
    }

    #[test]
    fn dynamic_settings_are_shared_across_clones() {
        let settings = DynamicSettings::default();
        let other = settings.clone();
        settings.set_max_snapshot_bytes_per_sec(1024);
        assert_eq!(other.max_snapshot_bytes_per_sec(), 1024);
    }
}
