//! Background node indexer.
//!
//! The [`NodeIndexer`] owns the "current snapshot" reference. A dedicated
//! thread wakes on a fixed interval, reads the source's generation marker, and
//! rebuilds the index only when that marker is strictly newer than the one
//! last published.
//!
//! ## Architecture
//!
//! ```text
//! Idle ──tick──▶ Building ──publish──▶ Published ──▶ Idle
//!   ▲                                                  │
//!   └──────────────── marker unchanged ◀───────────────┘
//! ```
//!
//! - Published state (marker + snapshot) lives behind one mutex that also
//!   backs the condition variable first-time readers wait on
//! - Readers clone the `Arc<NodeIndex>` and release the lock immediately
//! - An atomic flag makes builds single-flight: a tick that finds a build in
//!   progress returns without starting another
//! - Stopping signals the thread through a channel and joins it, so a build
//!   already under way runs to completion

use crate::error::{OnionooError, Result};
use crate::index::{build_index, NodeIndex};
use crate::source::{load_all, SummarySource};
use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

/// Source of "now" for day-bucket computation.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Indexer tuning.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    /// How often the background thread checks for a new generation
    pub refresh_interval: Duration,

    /// Records last seen longer ago than this are left out of the index
    pub max_record_age: chrono::Duration,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        IndexerSettings {
            refresh_interval: Duration::from_secs(60),
            max_record_age: chrono::Duration::days(7),
        }
    }
}

#[derive(Default)]
struct IndexerState {
    last_indexed: Option<DateTime<Utc>>,
    latest: Option<Arc<NodeIndex>>,
    running: bool,
}

struct Shared {
    source: Arc<dyn SummarySource>,
    settings: IndexerSettings,
    clock: Clock,
    state: Mutex<IndexerState>,
    published: Condvar,
    building: AtomicBool,
}

/// Clears the single-flight flag when a build ends, including by unwinding.
struct BuildGuard<'a>(&'a AtomicBool);

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    fn index_once(&self) -> Result<bool> {
        if self
            .building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Index build already in progress");
            return Ok(false);
        }
        let _guard = BuildGuard(&self.building);
        self.refresh()
    }

    #[instrument(skip(self), fields(source = self.source.name()))]
    fn refresh(&self) -> Result<bool> {
        let generation = match self.source.updated_at()? {
            Some(generation) => generation,
            None => {
                debug!("Summary source has not been written yet");
                return Ok(false);
            }
        };

        if let Some(last) = self.state.lock().last_indexed {
            if generation <= last {
                debug!(generation = %generation, "Summary source unchanged");
                return Ok(false);
            }
        }

        let started = Instant::now();
        self.source.invalidate_cache();
        let loaded = load_all(self.source.as_ref())?;
        let mut index = build_index(
            loaded.records,
            generation,
            (self.clock)(),
            self.settings.max_record_age,
        );
        index.add_skipped_invalid(loaded.unreadable);
        let index = Arc::new(index);
        let (relays, bridges) = (index.stats().relays, index.stats().bridges);

        {
            let mut state = self.state.lock();
            state.last_indexed = Some(generation);
            state.latest = Some(index);
        }
        self.published.notify_all();

        info!(
            generation = %generation,
            relays,
            bridges,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Published node index"
        );
        Ok(true)
    }

    /// Lock the state, first waiting up to `timeout` if nothing has been
    /// published yet and a build may still produce something.
    fn wait_for_first(&self, timeout: Duration) -> MutexGuard<'_, IndexerState> {
        let mut state = self.state.lock();
        if timeout.is_zero() {
            return state;
        }
        let deadline = Instant::now() + timeout;
        while state.latest.is_none()
            && (state.running || self.building.load(Ordering::Acquire))
        {
            if self.published.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state
    }
}

struct Worker {
    thread: JoinHandle<()>,
    shutdown_tx: Sender<()>,
}

/// Periodically rebuilds and publishes the node index.
///
/// ## Example
///
/// ```rust,no_run
/// use onionoo_core::{IndexerSettings, JsonFileSource, NodeIndexer};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let source = Arc::new(JsonFileSource::new("/srv/onionoo/summary.json"));
/// let indexer = NodeIndexer::new(source, IndexerSettings::default());
/// indexer.start().unwrap();
///
/// if let Some(index) = indexer.latest_index(Duration::from_secs(10)) {
///     println!("{} relays", index.stats().relays);
/// }
/// indexer.stop();
/// ```
pub struct NodeIndexer {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl NodeIndexer {
    /// Create an indexer over `source`. Nothing is built until [`start`](Self::start)
    /// or [`index_once`](Self::index_once) is called.
    pub fn new(source: Arc<dyn SummarySource>, settings: IndexerSettings) -> Self {
        NodeIndexer {
            shared: Arc::new(Shared {
                source,
                settings,
                clock: Arc::new(Utc::now),
                state: Mutex::new(IndexerState::default()),
                published: Condvar::new(),
                building: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Replace the wall clock used for day buckets.
    ///
    /// Must be called before the indexer is shared or started.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.clock = clock;
        }
        self
    }

    /// Start the background thread. Calling this while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        shared.state.lock().running = true;

        let thread = thread::Builder::new()
            .name("onionoo-node-indexer".to_string())
            .spawn(move || {
                info!(
                    interval_secs = shared.settings.refresh_interval.as_secs(),
                    "Starting node indexer"
                );
                loop {
                    if let Err(e) = shared.index_once() {
                        error!(error = %e, "Index refresh failed");
                    }
                    match shutdown_rx.recv_timeout(shared.settings.refresh_interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Node indexer stopped");
            })
            .map_err(|e| {
                self.shared.state.lock().running = false;
                OnionooError::Io(e)
            })?;

        *worker = Some(Worker {
            thread,
            shutdown_tx,
        });
        Ok(())
    }

    /// Stop the background thread, letting an in-flight build finish.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.shared.state.lock().running = false;
        self.shared.published.notify_all();
        let _ = worker.shutdown_tx.send(());
        if worker.thread.join().is_err() {
            error!("Node indexer thread panicked");
        }
    }

    /// Whether the background thread is running
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Run one refresh tick on the calling thread.
    ///
    /// Returns `Ok(true)` if a new snapshot was published, `Ok(false)` if the
    /// generation was unchanged, the source is empty, or another build was
    /// already running.
    pub fn index_once(&self) -> Result<bool> {
        self.shared.index_once()
    }

    /// The current snapshot.
    ///
    /// Blocks up to `timeout` only while nothing has been published and a
    /// build may be under way; otherwise returns immediately, stale or not.
    pub fn latest_index(&self, timeout: Duration) -> Option<Arc<NodeIndex>> {
        self.shared.wait_for_first(timeout).latest.clone()
    }

    /// Generation marker of the current snapshot, with the same waiting rule
    /// as [`latest_index`](Self::latest_index).
    pub fn last_indexed(&self, timeout: Duration) -> Option<DateTime<Utc>> {
        self.shared.wait_for_first(timeout).last_indexed
    }
}

impl Drop for NodeIndexer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{bridge, now, relay, B1, F1, F2};
    use crate::source::MemorySource;

    fn fixture() -> (Arc<MemorySource>, NodeIndexer) {
        let source = Arc::new(MemorySource::new());
        source.replace(vec![relay(F1), relay(F2), bridge(B1)], now());
        let indexer = NodeIndexer::new(source.clone(), IndexerSettings::default())
            .with_clock(Arc::new(now));
        (source, indexer)
    }

    #[test]
    fn test_index_once_publishes() {
        let (source, indexer) = fixture();
        assert!(indexer.latest_index(Duration::ZERO).is_none());

        assert!(indexer.index_once().unwrap());
        let index = indexer.latest_index(Duration::ZERO).unwrap();
        assert_eq!(index.stats().relays, 2);
        assert_eq!(index.stats().bridges, 1);
        assert_eq!(index.built_at(), now());
        assert_eq!(indexer.last_indexed(Duration::ZERO), Some(now()));
        assert_eq!(source.invalidations(), 1);
    }

    #[test]
    fn test_unchanged_generation_is_noop() {
        let (source, indexer) = fixture();
        assert!(indexer.index_once().unwrap());
        let first = indexer.latest_index(Duration::ZERO).unwrap();
        let retrievals = source.retrievals();

        assert!(!indexer.index_once().unwrap());
        let second = indexer.latest_index(Duration::ZERO).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.retrievals(), retrievals);
        assert_eq!(source.invalidations(), 1);
    }

    #[test]
    fn test_newer_generation_rebuilds() {
        let (source, indexer) = fixture();
        assert!(indexer.index_once().unwrap());
        let first = indexer.latest_index(Duration::ZERO).unwrap();

        let later = now() + chrono::Duration::minutes(5);
        source.replace(vec![relay(F1)], later);
        assert!(indexer.index_once().unwrap());
        let second = indexer.latest_index(Duration::ZERO).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.stats().relays, 1);
        assert_eq!(indexer.last_indexed(Duration::ZERO), Some(later));

        // Readers holding the old snapshot still see it intact
        assert_eq!(first.stats().relays, 2);
    }

    #[test]
    fn test_older_generation_ignored() {
        let (source, indexer) = fixture();
        assert!(indexer.index_once().unwrap());
        source.set_updated_at(now() - chrono::Duration::minutes(5));
        assert!(!indexer.index_once().unwrap());
    }

    #[test]
    fn test_empty_source_builds_nothing() {
        let source = Arc::new(MemorySource::new());
        let indexer = NodeIndexer::new(source.clone(), IndexerSettings::default());
        assert!(!indexer.index_once().unwrap());
        assert!(indexer.latest_index(Duration::ZERO).is_none());
        assert_eq!(source.invalidations(), 0);
    }

    /// Fails to fetch one record and delegates everything else.
    struct BrokenRecordSource {
        inner: MemorySource,
        broken: &'static str,
    }

    impl SummarySource for BrokenRecordSource {
        fn list(&self) -> anyhow::Result<Vec<String>> {
            self.inner.list()
        }

        fn retrieve(&self, fingerprint: &str) -> anyhow::Result<Option<crate::SummaryRecord>> {
            if fingerprint == self.broken {
                anyhow::bail!("corrupt document for {}", fingerprint);
            }
            self.inner.retrieve(fingerprint)
        }

        fn updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
            self.inner.updated_at()
        }

        fn invalidate_cache(&self) {
            self.inner.invalidate_cache()
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_unreadable_record_skipped() {
        let inner = MemorySource::new();
        inner.replace(vec![relay(F1), relay(F2), bridge(B1)], now());
        let source = Arc::new(BrokenRecordSource { inner, broken: F2 });
        let indexer = NodeIndexer::new(source, IndexerSettings::default())
            .with_clock(Arc::new(now));

        assert!(indexer.index_once().unwrap());
        let index = indexer.latest_index(Duration::ZERO).unwrap();
        assert_eq!(index.stats().relays, 1);
        assert_eq!(index.stats().bridges, 1);
        assert_eq!(index.stats().skipped_invalid, 1);
        assert!(index.relays().contains_key(F1));
        assert!(!index.relays().contains_key(F2));
    }

    #[test]
    fn test_single_flight() {
        let (source, indexer) = fixture();
        indexer.shared.building.store(true, Ordering::Release);
        assert!(!indexer.index_once().unwrap());
        assert_eq!(source.retrievals(), 0);

        indexer.shared.building.store(false, Ordering::Release);
        assert!(indexer.index_once().unwrap());
        assert!(!indexer.shared.building.load(Ordering::Acquire));
    }

    #[test]
    fn test_no_wait_when_not_running() {
        let source = Arc::new(MemorySource::new());
        let indexer = NodeIndexer::new(source, IndexerSettings::default());
        let started = Instant::now();
        assert!(indexer.latest_index(Duration::from_secs(10)).is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_start_waits_for_first_publication() {
        let (_source, indexer) = fixture();
        indexer.start().unwrap();
        assert!(indexer.is_running());
        indexer.start().unwrap();

        let index = indexer.latest_index(Duration::from_secs(10)).unwrap();
        assert_eq!(index.stats().relays, 2);

        indexer.stop();
        assert!(!indexer.is_running());
        // Published snapshot survives stop
        assert!(indexer.latest_index(Duration::ZERO).is_some());
    }

    #[test]
    fn test_waiting_times_out_without_data() {
        let source = Arc::new(MemorySource::new());
        let indexer = NodeIndexer::new(source, IndexerSettings::default());
        indexer.start().unwrap();

        let started = Instant::now();
        assert!(indexer.latest_index(Duration::from_millis(100)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(indexer.last_indexed(Duration::from_millis(10)).is_none());
        indexer.stop();
    }
}
