//! Summary record sources.
//!
//! The index never produces records itself. It reads them from a
//! [`SummarySource`], the upstream store that downloads, enriches and persists
//! node summaries on its own schedule. The source contract is small:
//!
//! 1. Enumerate current record identifiers
//! 2. Fetch one record by identifier
//! 3. Report the generation marker (when the store last changed)
//! 4. Drop any read caches so the next build sees fresh data
//!
//! Identifiers are fingerprints: relay fingerprints for relays, hashed
//! fingerprints for bridges.

use crate::types::{NodeKind, SummaryRecord};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Abstract upstream store of summary records.
///
/// Implementations must be thread-safe: the background indexer and request
/// handlers call into the same source concurrently.
pub trait SummarySource: Send + Sync {
    /// Identifiers of all records currently in the store.
    fn list(&self) -> anyhow::Result<Vec<String>>;

    /// Fetch one record by fingerprint, or `None` if the store has no such record.
    fn retrieve(&self, fingerprint: &str) -> anyhow::Result<Option<SummaryRecord>>;

    /// Monotonic generation marker, or `None` if the store has never been written.
    fn updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Drop read caches so the next enumeration reflects the current store.
    fn invalidate_cache(&self);

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// Records read from a source for one build.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<SummaryRecord>,

    /// Identifiers whose fetch failed
    pub unreadable: usize,
}

/// Enumerate and fetch every record in `source`.
///
/// Only a failing enumeration is an error. A record that cannot be fetched is
/// logged and counted, and identifiers that vanish between `list` and
/// `retrieve` are skipped.
pub fn load_all(source: &dyn SummarySource) -> anyhow::Result<LoadedRecords> {
    let ids = source.list()?;
    let mut loaded = LoadedRecords {
        records: Vec::with_capacity(ids.len()),
        unreadable: 0,
    };
    for id in ids {
        match source.retrieve(&id) {
            Ok(Some(record)) => loaded.records.push(record),
            Ok(None) => {}
            Err(e) => {
                warn!(fingerprint = %id, error = %e, "Skipping unreadable summary record");
                loaded.unreadable += 1;
            }
        }
    }
    Ok(loaded)
}

/// In-memory source, used by tests and embedders that already hold records.
#[derive(Default)]
pub struct MemorySource {
    records: RwLock<BTreeMap<String, SummaryRecord>>,
    updated_at: RwLock<Option<DateTime<Utc>>>,
    retrievals: AtomicUsize,
    invalidations: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the store contents and stamp a new generation.
    pub fn replace(&self, records: impl IntoIterator<Item = SummaryRecord>, updated_at: DateTime<Utc>) {
        let mut map = self.records.write();
        map.clear();
        for record in records {
            map.insert(record.fingerprint.to_ascii_uppercase(), record);
        }
        *self.updated_at.write() = Some(updated_at);
    }

    /// Set the generation marker without touching records.
    pub fn set_updated_at(&self, updated_at: DateTime<Utc>) {
        *self.updated_at.write() = Some(updated_at);
    }

    /// Number of `retrieve` calls served so far
    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::Relaxed)
    }

    /// Number of `invalidate_cache` calls served so far
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl SummarySource for MemorySource {
    fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn retrieve(&self, fingerprint: &str) -> anyhow::Result<Option<SummaryRecord>> {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .records
            .read()
            .get(&fingerprint.to_ascii_uppercase())
            .cloned())
    }

    fn updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(*self.updated_at.read())
    }

    fn invalidate_cache(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// On-disk layout read by [`JsonFileSource`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SummaryFile {
    #[serde(default)]
    pub relays: Vec<SummaryRecord>,
    #[serde(default)]
    pub bridges: Vec<SummaryRecord>,
}

/// Source backed by a single JSON summary document.
///
/// The file's modification time is the generation marker. Parsed contents
/// are cached until `invalidate_cache` is called.
pub struct JsonFileSource {
    path: PathBuf,
    cache: RwLock<Option<Arc<HashMap<String, SummaryRecord>>>>,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileSource {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `file` to `path` as pretty-printed JSON.
    pub fn write(path: &Path, file: &SummaryFile) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(file)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Arc<HashMap<String, SummaryRecord>>> {
        if let Some(cached) = self.cache.read().as_ref() {
            return Ok(Arc::clone(cached));
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading summary file {}", self.path.display()))?;
        let file: SummaryFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing summary file {}", self.path.display()))?;

        let mut records = HashMap::with_capacity(file.relays.len() + file.bridges.len());
        let tagged = file
            .relays
            .into_iter()
            .map(|r| (NodeKind::Relay, r))
            .chain(file.bridges.into_iter().map(|r| (NodeKind::Bridge, r)));
        for (kind, mut record) in tagged {
            record.kind = kind;
            records.insert(record.fingerprint.to_ascii_uppercase(), record);
        }

        let records = Arc::new(records);
        *self.cache.write() = Some(Arc::clone(&records));
        Ok(records)
    }
}

impl SummarySource for JsonFileSource {
    fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self.load()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn retrieve(&self, fingerprint: &str) -> anyhow::Result<Option<SummaryRecord>> {
        Ok(self.load()?.get(&fingerprint.to_ascii_uppercase()).cloned())
    }

    fn updated_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("reading mtime of {}", self.path.display()))?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat {}", self.path.display())),
        }
    }

    fn invalidate_cache(&self) {
        *self.cache.write() = None;
    }

    fn name(&self) -> &'static str {
        "json-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const RELAY: &str = "000C5F55BD4814B917CC474BD537F1A3B33CCE2A";
    const BRIDGE: &str = "0011BD2485AD45D984EC4159C88FC066E5E3300E";

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new();
        assert_eq!(source.updated_at().unwrap(), None);

        source.replace(
            vec![SummaryRecord::relay(RELAY), SummaryRecord::bridge(BRIDGE)],
            ts(),
        );
        assert_eq!(source.updated_at().unwrap(), Some(ts()));
        assert_eq!(source.list().unwrap().len(), 2);

        let record = source.retrieve(&RELAY.to_lowercase()).unwrap().unwrap();
        assert!(record.is_relay());
        assert!(source.retrieve("FFFF").unwrap().is_none());
        assert_eq!(source.retrievals(), 2);

        source.invalidate_cache();
        assert_eq!(source.invalidations(), 1);
    }

    #[test]
    fn test_load_all() {
        let source = MemorySource::new();
        source.replace(
            vec![SummaryRecord::relay(RELAY), SummaryRecord::bridge(BRIDGE)],
            ts(),
        );
        let loaded = load_all(&source).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.unreadable, 0);
    }

    #[test]
    fn test_json_file_source() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("summary.json");
        let source = JsonFileSource::new(&path);
        assert_eq!(source.updated_at().unwrap(), None);
        assert!(source.list().is_err());

        let file = SummaryFile {
            relays: vec![SummaryRecord::relay(RELAY).with_nickname("moria1")],
            bridges: vec![SummaryRecord::bridge(BRIDGE)],
        };
        JsonFileSource::write(&path, &file).unwrap();

        assert!(source.updated_at().unwrap().is_some());
        assert_eq!(
            source.list().unwrap(),
            vec![RELAY.to_string(), BRIDGE.to_string()]
        );

        let bridge = source.retrieve(BRIDGE).unwrap().unwrap();
        assert_eq!(bridge.kind, NodeKind::Bridge);
        let relay = source.retrieve(RELAY).unwrap().unwrap();
        assert_eq!(relay.nickname.as_deref(), Some("moria1"));
    }

    #[test]
    fn test_json_file_source_cache() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("summary.json");
        JsonFileSource::write(&path, &SummaryFile::default()).unwrap();

        let source = JsonFileSource::new(&path);
        assert!(source.list().unwrap().is_empty());

        let file = SummaryFile {
            relays: vec![SummaryRecord::relay(RELAY)],
            bridges: Vec::new(),
        };
        JsonFileSource::write(&path, &file).unwrap();

        // Served from cache until invalidated
        assert!(source.list().unwrap().is_empty());
        source.invalidate_cache();
        assert_eq!(source.list().unwrap().len(), 1);
    }
}
