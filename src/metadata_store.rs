//! The external cluster-state metadata store abstraction (SPEC_FULL.md §6).
//!
//! The core treats this as a linearizable compare-and-swap over a small
//! piece of state: (safe generation, pending generation, repository uuid).
//! It never talks to consensus directly -- the host's cluster-state layer
//! does that and is described here only by the operations the core
//! invokes on it.

use async_trait::async_trait;
use uuid::Uuid;

use crate::generation::Generation;

/// The slice of cluster metadata the repository core reads and writes.
/// A host's real cluster-state document almost certainly carries far more
/// than this; the core only needs -- and only touches -- these fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryMetadataState {
    pub safe_generation: Generation,
    pub pending_generation: Generation,
    pub repository_uuid: Option<Uuid>,
    /// Uncovered "in-progress" entries (snapshot/delete tasks) that must be
    /// filtered to the new generation when step 3 of the three-step writer
    /// commits. Modeled as opaque task ids the core doesn't interpret.
    pub in_progress_task_ids: Vec<String>,
}

impl RepositoryMetadataState {
    pub fn uninitialized() -> Self {
        Self {
            safe_generation: Generation::Unknown,
            pending_generation: Generation::Unknown,
            repository_uuid: None,
            in_progress_task_ids: Vec::new(),
        }
    }
}

/// An update function: given the current state, returns the new state or
/// an error if the precondition it depends on no longer holds. Must be
/// pure and side-effect free -- the metadata store may invoke it more than
/// once under contention.
pub type UpdateFn = Box<dyn Fn(&RepositoryMetadataState) -> anyhow::Result<RepositoryMetadataState> + Send + Sync>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Submit a linearizable update. `source` is a short human-readable
    /// description of the caller (used in host-side audit logs only).
    /// Returns the state *after* `update` was applied, or the error
    /// `update` produced.
    async fn submit_update(&self, source: &str, update: UpdateFn) -> anyhow::Result<RepositoryMetadataState>;

    /// A lock-free read of the last known state, for diagnostics and for
    /// the generation tracker's best-effort-consistency fallback. May be
    /// stale relative to a concurrent `submit_update`.
    async fn current(&self) -> anyhow::Result<RepositoryMetadataState>;
}
