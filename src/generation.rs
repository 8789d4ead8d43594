//! The repository-wide generational "index-N" protocol (SPEC_FULL.md §4.3).

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::repository_data::RepositoryData;

/// A repository generation number, or one of the three sentinels.
///
/// Ordinary generations are non-negative 63-bit integers naming an
/// `index-{N}` root blob. Sentinels live outside that range so ordering
/// comparisons (`<`, `max`) behave sensibly without special-casing every
/// call site -- `CORRUPTED < EMPTY < UNKNOWN < 0` would be wrong, so we
/// keep sentinels as a distinct enum and only expose `i64` at the
/// serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// No `index-N` has ever been written.
    Empty,
    /// No load has happened yet; the tracker has no opinion.
    Unknown,
    /// Terminal latch: physical content disagreed with expected generation.
    Corrupted,
    Numbered(u64),
}

impl Generation {
    pub const EMPTY_VALUE: i64 = -1;
    pub const UNKNOWN_VALUE: i64 = -2;
    pub const CORRUPTED_VALUE: i64 = -3;

    pub fn from_raw(value: i64) -> Self {
        match value {
            Self::EMPTY_VALUE => Generation::Empty,
            Self::UNKNOWN_VALUE => Generation::Unknown,
            Self::CORRUPTED_VALUE => Generation::Corrupted,
            n if n >= 0 => Generation::Numbered(n as u64),
            n => panic!("invalid repository generation {}", n),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Generation::Empty => Self::EMPTY_VALUE,
            Generation::Unknown => Self::UNKNOWN_VALUE,
            Generation::Corrupted => Self::CORRUPTED_VALUE,
            Generation::Numbered(n) => n as i64,
        }
    }

    pub fn is_numbered(self) -> bool {
        matches!(self, Generation::Numbered(_))
    }

    pub fn as_number(self) -> Option<u64> {
        match self {
            Generation::Numbered(n) => Some(n),
            _ => None,
        }
    }

    /// The generation a fresh write should target: strictly greater than
    /// `self`, strictly greater than `at_least`. `Empty` and `Unknown`
    /// behave as if they were `-1` for this purpose; `Corrupted` must never
    /// reach this call (callers check the latch first).
    pub fn next_at_least(self, at_least: Generation) -> u64 {
        let a = match self {
            Generation::Numbered(n) => n as i64,
            Generation::Corrupted => panic!("next_at_least called on corrupted generation"),
            _ => -1,
        };
        let b = match at_least {
            Generation::Numbered(n) => n as i64,
            Generation::Corrupted => panic!("next_at_least called on corrupted generation"),
            _ => -1,
        };
        (std::cmp::max(a, b) + 1) as u64
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Empty => write!(f, "EMPTY"),
            Generation::Unknown => write!(f, "UNKNOWN"),
            Generation::Corrupted => write!(f, "CORRUPTED"),
            Generation::Numbered(n) => write!(f, "{}", n),
        }
    }
}

/// Consistency mode the tracker operates in. See SPEC_FULL.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Trust `safe_generation` as mirrored from the metadata store; cache
    /// `RepositoryData` aggressively.
    Strict,
    /// Cannot rely on the externally tracked safe generation; re-list the
    /// repository root before every operation and never cache shard
    /// generation information across reads.
    BestEffort,
}

/// In-memory view of safe/pending/known generations, plus the cached
/// `RepositoryData` and a single-result deduplicator for concurrent loads.
///
/// All three atomics are per-repository state (SPEC_FULL.md §9, "Global
/// mutable state") -- there is nothing process-wide here.
pub struct GenerationTracker {
    safe_generation: AtomicI64,
    latest_known_generation: AtomicI64,
    cache_enabled: bool,
    cached_data: Mutex<Option<Arc<RepositoryData>>>,
    mode: Mutex<ConsistencyMode>,
    /// Fan-out point for the single-result deduplicator: a load already in
    /// flight publishes its result here; concurrent callers subscribe
    /// instead of issuing their own physical read.
    inflight_load: Mutex<Option<broadcast::Sender<LoadOutcome>>>,
}

#[derive(Clone)]
enum LoadOutcome {
    Data(Arc<RepositoryData>),
    Failed(Arc<String>),
}

impl GenerationTracker {
    pub fn new(initial_mode: ConsistencyMode, cache_enabled: bool) -> Self {
        Self {
            safe_generation: AtomicI64::new(Generation::Unknown.to_raw()),
            latest_known_generation: AtomicI64::new(Generation::Unknown.to_raw()),
            cache_enabled,
            cached_data: Mutex::new(None),
            mode: Mutex::new(initial_mode),
            inflight_load: Mutex::new(None),
        }
    }

    pub fn safe_generation(&self) -> Generation {
        Generation::from_raw(self.safe_generation.load(Ordering::SeqCst))
    }

    pub fn latest_known_generation(&self) -> Generation {
        Generation::from_raw(self.latest_known_generation.load(Ordering::SeqCst))
    }

    pub fn mode(&self) -> ConsistencyMode {
        *self.mode.lock().unwrap()
    }

    pub fn set_mode(&self, mode: ConsistencyMode) {
        *self.mode.lock().unwrap() = mode;
        if mode == ConsistencyMode::BestEffort {
            // Never cache shard-generation information across reads in
            // best-effort mode: drop whatever we had.
            *self.cached_data.lock().unwrap() = None;
        }
    }

    /// Mirror an externally observed safe generation (after a successful
    /// metadata-store commit, or on discovery during load).
    pub fn advance_safe_generation(&self, safe: Generation) {
        self.safe_generation.store(safe.to_raw(), Ordering::SeqCst);
        self.observe_known_generation(safe);
    }

    /// Monotonic max: compare-and-set loop so concurrent observers never
    /// regress `latest_known_generation`.
    pub fn observe_known_generation(&self, observed: Generation) {
        if let Generation::Numbered(n) = observed {
            let n = n as i64;
            let mut current = self.latest_known_generation.load(Ordering::SeqCst);
            loop {
                if current >= n {
                    return;
                }
                match self.latest_known_generation.compare_exchange_weak(
                    current,
                    n,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Latch the repository as corrupted. One-way: only a fresh
    /// `GenerationTracker` (i.e. re-registration) clears it.
    pub fn mark_corrupted(&self) {
        log::error!("generation tracker latching repository as corrupted");
        self.safe_generation
            .store(Generation::Corrupted.to_raw(), Ordering::SeqCst);
        *self.cached_data.lock().unwrap() = None;
    }

    pub fn is_corrupted(&self) -> bool {
        self.safe_generation() == Generation::Corrupted
    }

    pub fn cached(&self) -> Option<Arc<RepositoryData>> {
        if !self.cache_enabled {
            return None;
        }
        self.cached_data.lock().unwrap().clone()
    }

    pub fn publish(&self, data: Arc<RepositoryData>) {
        self.observe_known_generation(Generation::Numbered(data.generation));
        if self.cache_enabled && self.mode() == ConsistencyMode::Strict {
            *self.cached_data.lock().unwrap() = Some(data);
        }
    }

    /// Run `physical_load` at most once for any set of concurrent callers:
    /// the first caller in actually performs the I/O and broadcasts the
    /// outcome; everyone else just awaits the broadcast.
    pub async fn load_deduplicated<F, Fut>(&self, physical_load: F) -> Result<Arc<RepositoryData>, anyhow::Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<RepositoryData, anyhow::Error>>,
    {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }

        let mut receiver = {
            let mut guard = self.inflight_load.lock().unwrap();
            if let Some(sender) = guard.as_ref() {
                sender.subscribe()
            } else {
                let (sender, receiver) = broadcast::channel(1);
                *guard = Some(sender);
                drop(guard);

                let outcome = match physical_load().await {
                    Ok(data) => {
                        let data = Arc::new(data);
                        self.publish(data.clone());
                        LoadOutcome::Data(data)
                    }
                    Err(err) => LoadOutcome::Failed(Arc::new(err.to_string())),
                };

                let mut guard = self.inflight_load.lock().unwrap();
                if let Some(sender) = guard.take() {
                    let _ = sender.send(outcome.clone());
                }
                return match outcome {
                    LoadOutcome::Data(data) => Ok(data),
                    LoadOutcome::Failed(msg) => Err(anyhow::anyhow!("{}", msg)),
                };
            }
        };

        match receiver.recv().await {
            Ok(LoadOutcome::Data(data)) => Ok(data),
            Ok(LoadOutcome::Failed(msg)) => Err(anyhow::anyhow!("{}", msg)),
            Err(_) => Err(anyhow::anyhow!("repository data load was dropped before completing")),
        }
    }
}
