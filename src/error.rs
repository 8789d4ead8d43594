//! Error taxonomy for the repository core.
//!
//! Every variant carries the repository name, plus whatever identifiers
//! (snapshot, shard, generation) are relevant at the point the error became
//! user-facing. Internal plumbing composes fallible steps with
//! `anyhow::Context` and converts to a concrete variant only at a pipeline
//! boundary (finalize/delete/clone/restore/cleanup) -- callers never see a
//! bare `anyhow::Error` escape the crate.

use thiserror::Error;

use crate::generation::Generation;

/// Errors produced by the repository core. All variants carry the
/// repository name so a host can attribute failures when it multiplexes
/// several repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("[{repository}] concurrent modification detected: expected safe generation {expected:?}, found {actual:?}")]
    ConcurrentModification {
        repository: String,
        expected: Generation,
        actual: Generation,
    },

    #[error("[{repository}] snapshot {snapshot} missing blob {blob}")]
    SnapshotMissing {
        repository: String,
        snapshot: String,
        blob: String,
    },

    #[error("[{repository}] snapshot {snapshot} failed: {source}")]
    SnapshotException {
        repository: String,
        snapshot: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{repository}] shard snapshot failed for index {index} shard {shard}: {source}")]
    IndexShardSnapshotFailed {
        repository: String,
        index: String,
        shard: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{repository}] shard restore failed for index {index} shard {shard}: {source}")]
    IndexShardRestoreFailed {
        repository: String,
        index: String,
        shard: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{repository}] snapshot {snapshot} aborted")]
    AbortedSnapshot { repository: String, snapshot: String },

    #[error("[{repository}] repository verification failed on node {node}: {source}")]
    RepositoryVerification {
        repository: String,
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{repository}] repository is corrupted and requires re-registration")]
    CorruptedState { repository: String },

    #[error("[{repository}] repository not started")]
    NotStarted { repository: String },

    #[error("[{repository}] task cancelled")]
    TaskCancelled { repository: String },

    #[error("[{repository}] repository is read-only")]
    ReadOnly { repository: String },

    #[error("[{repository}] blob store error: {source}")]
    BlobStore {
        repository: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{repository}] codec error: {0}")]
    Codec(#[source] crate::codec::CodecError),
}

impl RepositoryError {
    pub fn repository(&self) -> &str {
        match self {
            RepositoryError::ConcurrentModification { repository, .. }
            | RepositoryError::SnapshotMissing { repository, .. }
            | RepositoryError::SnapshotException { repository, .. }
            | RepositoryError::IndexShardSnapshotFailed { repository, .. }
            | RepositoryError::IndexShardRestoreFailed { repository, .. }
            | RepositoryError::AbortedSnapshot { repository, .. }
            | RepositoryError::RepositoryVerification { repository, .. }
            | RepositoryError::CorruptedState { repository }
            | RepositoryError::NotStarted { repository }
            | RepositoryError::TaskCancelled { repository }
            | RepositoryError::ReadOnly { repository }
            | RepositoryError::BlobStore { repository, .. } => repository,
            RepositoryError::Codec(_) => "<codec>",
        }
    }

    /// Whether a caller can sensibly retry the same operation with a fresh
    /// read of repository data (as opposed to `CorruptedState`, which is
    /// terminal until re-registration).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::ConcurrentModification { .. })
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
