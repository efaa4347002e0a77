//! Application state management.

use onionoo_core::{Config, JsonFileSource, NodeIndexer, QueryService, SummarySource};
use std::sync::Arc;
use tracing::info;

/// Shared application state.
pub struct App {
    /// Configuration
    pub config: Config,

    /// Summary document reader
    pub source: Arc<JsonFileSource>,

    /// Snapshot publisher
    pub indexer: Arc<NodeIndexer>,
}

impl App {
    /// Create a new application instance.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let data_path = config.data_path()?;
        let source = Arc::new(JsonFileSource::new(data_path.clone()));
        let indexer = Arc::new(NodeIndexer::new(
            source.clone(),
            config.indexer_settings(),
        ));

        info!(data_path = %data_path.display(), "Application initialized");

        Ok(App {
            config,
            source,
            indexer,
        })
    }

    /// Build one snapshot from the current summary document.
    ///
    /// Returns `false` when the document is missing, leaving nothing published.
    pub fn index_now(&self) -> anyhow::Result<bool> {
        Ok(self.indexer.index_once()?)
    }

    /// Query service over this application's indexer.
    pub fn service(&self) -> QueryService {
        let source: Arc<dyn SummarySource> = self.source.clone();
        QueryService::new(
            self.indexer.clone(),
            source,
            self.config.service_settings(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use onionoo_core::{SummaryFile, SummaryRecord};
    use tempfile::TempDir;

    fn record(record: SummaryRecord, weight: u64) -> SummaryRecord {
        record
            .with_running(true)
            .with_consensus_weight(weight)
            .with_first_seen(Utc::now() - Duration::days(10))
            .with_last_seen(Utc::now() - Duration::hours(1))
    }

    #[test]
    fn test_query_summary_file() {
        let temp_dir = TempDir::new().unwrap();
        let data_path = temp_dir.path().join("summary.json");
        let file = SummaryFile {
            relays: vec![
                record(SummaryRecord::relay("000C5F55BD4814B917CC474BD537F1A3B33CCE2A"), 10),
                record(SummaryRecord::relay("0011BD2485AD45D984EC4159C88FC066E5E3300E"), 20),
            ],
            bridges: vec![record(
                SummaryRecord::bridge("0025C136C1F3A9EEFE2AE3F918F03BFA21B5070B"),
                0,
            )],
        };
        JsonFileSource::write(&data_path, &file).unwrap();

        let mut config = Config::default();
        config.general.data_path = Some(data_path);
        let app = App::new(config).unwrap();
        assert!(app.index_now().unwrap());

        let response = app
            .service()
            .query_string("summary", "type=relay&order=-consensus_weight")
            .unwrap();
        let fingerprints: Vec<&str> = response.result.fingerprints().collect();
        assert_eq!(
            fingerprints,
            vec![
                "0011BD2485AD45D984EC4159C88FC066E5E3300E",
                "000C5F55BD4814B917CC474BD537F1A3B33CCE2A",
            ]
        );
    }

    #[test]
    fn test_missing_summary_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.general.data_path = Some(temp_dir.path().join("missing.json"));

        let app = App::new(config).unwrap();
        assert!(!app.index_now().unwrap());
    }
}
