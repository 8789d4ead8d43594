//! The repository-data loader/writer (SPEC_FULL.md §4.4) -- the central
//! three-step generational update algorithm.

use std::sync::Arc;

use uuid::Uuid;

use crate::blob_store::{BlobContainer, Purpose};
use crate::codec;
use crate::error::RepositoryError;
use crate::generation::{ConsistencyMode, Generation, GenerationTracker};
use crate::metadata_store::{MetadataStore, RepositoryMetadataState};
use crate::naming;
use crate::repository_data::RepositoryData;

/// Applied during step 3 of the writer to atomically fold any in-progress
/// snapshot/delete entries referencing the old generation into the new
/// one. The core does not interpret the contents; it just threads the
/// filter through to the metadata store.
pub type StateFilter = Box<dyn Fn(&mut RepositoryMetadataState) + Send + Sync>;

pub fn no_op_state_filter() -> StateFilter {
    Box::new(|_state| {})
}

pub struct RepositoryDataLoader {
    repository_name: String,
    root: Arc<dyn BlobContainer>,
    metadata: Arc<dyn MetadataStore>,
    tracker: Arc<GenerationTracker>,
    compress: bool,
    support_url_repo: bool,
}

impl RepositoryDataLoader {
    pub fn new(
        repository_name: impl Into<String>,
        root: Arc<dyn BlobContainer>,
        metadata: Arc<dyn MetadataStore>,
        tracker: Arc<GenerationTracker>,
        compress: bool,
        support_url_repo: bool,
    ) -> Self {
        Self {
            repository_name: repository_name.into(),
            root,
            metadata,
            tracker,
            compress,
            support_url_repo,
        }
    }

    fn err(&self, source: anyhow::Error) -> RepositoryError {
        RepositoryError::BlobStore {
            repository: self.repository_name.clone(),
            source,
        }
    }

    /// Scan the repository root for every `index-{N}` blob and return the
    /// highest `N`, or `Generation::Empty` if none exist.
    async fn discover_highest_physical_generation(&self) -> Result<Generation, RepositoryError> {
        let listed = self
            .root
            .list_by_prefix(Purpose::SnapshotMeta, naming::ROOT_METADATA_PREFIX)
            .await
            .map_err(|e| self.err(e))?;

        let highest = listed
            .keys()
            .filter_map(|name| naming::parse_numbered_generation(name))
            .max();

        Ok(match highest {
            Some(n) => Generation::Numbered(n),
            None => Generation::Empty,
        })
    }

    async fn read_generation(&self, generation: u64) -> Result<RepositoryData, RepositoryError> {
        let name = naming::root_metadata_name(generation);
        let mut reader = self
            .root
            .read(Purpose::SnapshotMeta, &name)
            .await
            .map_err(|e| self.err(e))?;
        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut raw)
            .await
            .map_err(|e| self.err(e.into()))?;
        codec::decode(&raw).map_err(|e| RepositoryError::Codec(e))
    }

    /// Load the current `RepositoryData`, bootstrapping an uninitialized
    /// repository if necessary (SPEC_FULL.md §4.4, Loader). Callers are
    /// responsible for only invoking this on a master-eligible node -- the
    /// core does not itself know what "master-eligible" means.
    pub async fn load(&self) -> Result<Arc<RepositoryData>, RepositoryError> {
        let repository_name = self.repository_name.clone();
        let root = self.root.clone();
        let metadata = self.metadata.clone();
        let tracker = self.tracker.clone();

        if tracker.is_corrupted() {
            return Err(RepositoryError::CorruptedState { repository: repository_name });
        }

        let safe = tracker.safe_generation();

        if tracker.mode() == ConsistencyMode::BestEffort {
            let observed = self.discover_highest_physical_generation().await?;
            tracker.observe_known_generation(observed);
        }

        if safe == Generation::Unknown {
            return self.bootstrap().await;
        }

        let target = match safe {
            Generation::Numbered(n) => n,
            Generation::Empty => return Ok(Arc::new(RepositoryData::empty(Uuid::nil(), String::new()))),
            Generation::Corrupted => unreachable!("checked above"),
            Generation::Unknown => unreachable!("checked above"),
        };

        let outcome = tracker
            .load_deduplicated(|| async move {
                let mut attempt_generation = target;
                let mut attempts = 0u32;
                loop {
                    match self.read_generation(attempt_generation).await {
                        Ok(data) => return Ok(data),
                        Err(_err) if attempts == 0 => {
                            // Transient failure: re-observe the physical
                            // highest generation and retry once.
                            let observed = self.discover_highest_physical_generation().await?;
                            if let Generation::Numbered(n) = observed {
                                if n != attempt_generation {
                                    attempt_generation = n;
                                    attempts += 1;
                                    continue;
                                }
                            }
                            attempts += 1;
                            continue;
                        }
                        Err(err) => return Err(anyhow::anyhow!("{}", err)),
                    }
                }
            })
            .await;

        match outcome {
            Ok(data) => Ok(data),
            Err(_) => {
                log::error!(
                    "[{}] repository-data load failed twice at generation {}; latching corrupted",
                    repository_name,
                    target
                );
                tracker.mark_corrupted();
                let _ = metadata.current().await;
                let _ = root.stats().await;
                Err(RepositoryError::CorruptedState { repository: repository_name })
            }
        }
    }

    async fn bootstrap(&self) -> Result<Arc<RepositoryData>, RepositoryError> {
        let observed = self.discover_highest_physical_generation().await?;

        let (data, safe) = match observed {
            Generation::Empty => {
                let repo_uuid = Uuid::new_v4();
                (RepositoryData::empty(repo_uuid, String::new()), Generation::Empty)
            }
            Generation::Numbered(n) => (self.read_generation(n).await?, Generation::Numbered(n)),
            _ => unreachable!("discover_highest_physical_generation never returns a sentinel other than Empty"),
        };

        let repo_uuid = data.repository_uuid;
        let state = self
            .metadata
            .submit_update(
                "repository-data-loader:init",
                Box::new(move |_current| {
                    Ok(RepositoryMetadataState {
                        safe_generation: safe,
                        pending_generation: safe,
                        repository_uuid: Some(repo_uuid),
                        in_progress_task_ids: Vec::new(),
                    })
                }),
            )
            .await
            .map_err(|e| self.err(e))?;

        self.tracker.advance_safe_generation(state.safe_generation);
        let data = Arc::new(data);
        self.tracker.publish(data.clone());
        log::info!(
            "[{}] initialized generation tracking at safe generation {}",
            self.repository_name,
            state.safe_generation
        );
        Ok(data)
    }

    /// The three-step generational update (SPEC_FULL.md §4.4): reserve a
    /// pending generation, write the new root body, then commit the safe
    /// generation. Returns the newly-committed `RepositoryData`.
    pub async fn write(
        &self,
        new_data: RepositoryData,
        expected_safe: Generation,
        state_filter: StateFilter,
    ) -> Result<Arc<RepositoryData>, RepositoryError> {
        if self.tracker.is_corrupted() {
            return Err(RepositoryError::CorruptedState {
                repository: self.repository_name.clone(),
            });
        }

        // Step 1: reserve.
        let reserved = self
            .metadata
            .submit_update(
                "repository-data-writer:reserve",
                Box::new(move |current| {
                    if current.safe_generation != Generation::Unknown && current.safe_generation != expected_safe {
                        anyhow::bail!(
                            "expected safe generation {:?}, found {:?}",
                            expected_safe,
                            current.safe_generation
                        );
                    }
                    let mut next = current.clone();
                    next.pending_generation =
                        Generation::Numbered(current.pending_generation.next_at_least(expected_safe));
                    Ok(next)
                }),
            )
            .await;

        let reserved = match reserved {
            Ok(state) => state,
            Err(_source) => {
                let actual = self.metadata.current().await.map(|s| s.safe_generation).unwrap_or(Generation::Unknown);
                return Err(RepositoryError::ConcurrentModification {
                    repository: self.repository_name.clone(),
                    expected: expected_safe,
                    actual,
                });
            }
        };

        let target_generation = match reserved.pending_generation {
            Generation::Numbered(n) => n,
            other => {
                return Err(RepositoryError::BlobStore {
                    repository: self.repository_name.clone(),
                    source: anyhow::anyhow!("metadata store returned non-numbered pending generation {:?}", other),
                })
            }
        };

        // Step 2: write body. First confirm the expected-safe blob still
        // physically exists; its absence means the repository was altered
        // out from under us.
        if let Generation::Numbered(expected_n) = expected_safe {
            let expected_name = naming::root_metadata_name(expected_n);
            let exists = self
                .root
                .blob_exists(Purpose::SnapshotMeta, &expected_name)
                .await
                .map_err(|e| self.err(e))?;
            if !exists {
                log::error!(
                    "[{}] expected safe generation {} missing on disk; latching corrupted",
                    self.repository_name,
                    expected_n
                );
                self.tracker.mark_corrupted();
                return Err(RepositoryError::CorruptedState {
                    repository: self.repository_name.clone(),
                });
            }
        }

        let mut body = new_data;
        body.generation = target_generation;
        let encoded = codec::encode(&body, self.compress).map_err(RepositoryError::Codec)?;
        let name = naming::root_metadata_name(target_generation);
        self.root
            .write_atomic(
                Purpose::SnapshotMeta,
                &name,
                encoded.len() as u64,
                crate::blob_store::reader_from_bytes(encoded),
                true,
            )
            .await
            .map_err(|e| self.err(e))?;

        if self.support_url_repo {
            if let Err(err) = self.write_latest_pointer(target_generation).await {
                // Best-effort: SPEC_FULL.md §9 says never let this fail the
                // owning operation.
                log::warn!(
                    "[{}] failed to update index.latest to {}: {}",
                    self.repository_name,
                    target_generation,
                    err
                );
            }
        }

        // Step 3: commit.
        let repository_uuid = body.repository_uuid;
        let commit = self
            .metadata
            .submit_update(
                "repository-data-writer:commit",
                Box::new(move |current| {
                    let mut next = current.clone();
                    next.safe_generation = Generation::Numbered(target_generation);
                    next.repository_uuid = Some(repository_uuid);
                    state_filter(&mut next);
                    Ok(next)
                }),
            )
            .await;

        match commit {
            Ok(state) => {
                self.tracker.advance_safe_generation(state.safe_generation);
                let data = Arc::new(body);
                self.tracker.publish(data.clone());
                log::info!(
                    "[{}] advanced safe generation to {}",
                    self.repository_name,
                    target_generation
                );
                Ok(data)
            }
            Err(source) => {
                // The body write (step 2) already succeeded and is durable.
                // We surface the error but do not roll it back -- the next
                // successful writer will discover and reconcile this state
                // (SPEC_FULL.md §4.4, §7 Propagation).
                log::error!(
                    "[{}] commit of generation {} failed after body write succeeded: {}",
                    self.repository_name,
                    target_generation,
                    source
                );
                Err(RepositoryError::ConcurrentModification {
                    repository: self.repository_name.clone(),
                    expected: expected_safe,
                    actual: Generation::Unknown,
                })
            }
        }
    }

    async fn write_latest_pointer(&self, generation: u64) -> anyhow::Result<()> {
        let bytes = (generation as i64).to_be_bytes().to_vec();
        self.root
            .write(Purpose::SnapshotMeta, naming::LATEST_POINTER_NAME, bytes.len() as u64, crate::blob_store::reader_from_bytes(bytes), false)
            .await
    }
}
