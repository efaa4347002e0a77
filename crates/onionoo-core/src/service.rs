//! Query entry point.
//!
//! `QueryService` ties the indexer to the request pipeline. For each request it
//! resolves the resource, captures the current snapshot (waiting a bounded
//! time for the first one), rejects snapshots that are too old, runs the
//! pipeline and attaches the metadata a response formatter needs.

use crate::error::{OnionooError, Result};
use crate::indexer::{Clock, NodeIndexer};
use crate::query::{QueryParams, ResourceType};
use crate::request::{QueryResult, RequestHandler};
use crate::source::SummarySource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Service tuning.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// How long a request waits for the first snapshot
    pub wait_timeout: Duration,

    /// Snapshots whose generation is older than this are refused
    pub max_index_age: Duration,

    /// Lower bound of the advertised cache lifetime
    pub cache_min_max_age: Duration,

    /// Upper bound of the advertised cache lifetime
    pub cache_max_max_age: Duration,

    /// Granularity the cache lifetime is rounded down to
    pub cache_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            wait_timeout: Duration::from_secs(10),
            max_index_age: Duration::from_secs(6 * 60 * 60),
            cache_min_max_age: Duration::from_secs(5 * 60),
            cache_max_max_age: Duration::from_secs(45 * 60),
            cache_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl ServiceSettings {
    /// Cache lifetime for a response built from a snapshot of the given age.
    ///
    /// Counts down from the maximum in whole intervals as the snapshot ages and
    /// never drops below the minimum.
    pub fn cache_max_age(&self, index_age: Duration) -> Duration {
        let interval = self.cache_interval.as_secs().max(1);
        let remaining = self.cache_max_max_age.saturating_sub(index_age).as_secs();
        let rounded = Duration::from_secs(remaining / interval * interval);
        rounded.max(self.cache_min_max_age)
    }
}

/// Response metadata, independent of how records get rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
    pub resource: ResourceType,

    /// Newest relay last-seen time, `YYYY-MM-DD HH:MM:SS`
    pub relays_published: Option<String>,

    /// Newest bridge last-seen time, `YYYY-MM-DD HH:MM:SS`
    pub bridges_published: Option<String>,

    /// Generation marker of the snapshot the response was built from
    pub generation: DateTime<Utc>,

    pub cache_max_age_secs: u64,

    pub relays_skipped: usize,
    pub bridges_skipped: usize,
    pub relays_truncated: usize,
    pub bridges_truncated: usize,

    /// Requested field projection, passed through untouched
    pub fields: Option<Vec<String>>,
}

/// A finished query.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub meta: ResponseMeta,
    pub result: QueryResult,
}

/// Answers queries against whatever snapshot the indexer last published.
pub struct QueryService {
    indexer: Arc<NodeIndexer>,
    source: Arc<dyn SummarySource>,
    settings: ServiceSettings,
    clock: Clock,
}

impl QueryService {
    pub fn new(
        indexer: Arc<NodeIndexer>,
        source: Arc<dyn SummarySource>,
        settings: ServiceSettings,
    ) -> Self {
        QueryService {
            indexer,
            source,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock used to age snapshots.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn indexer(&self) -> &Arc<NodeIndexer> {
        &self.indexer
    }

    /// Parse a raw query string and run it.
    pub fn query_string(&self, path: &str, query: &str) -> Result<QueryResponse> {
        let params = QueryParams::parse_query_string(query)?;
        self.query(path, &params)
    }

    /// Run a parsed query against the resource named by `path`.
    #[instrument(skip(self, params))]
    pub fn query(&self, path: &str, params: &QueryParams) -> Result<QueryResponse> {
        let resource = ResourceType::from_path(path)?;

        let index = self
            .indexer
            .latest_index(self.settings.wait_timeout)
            .ok_or(OnionooError::NotReady {
                waited: self.settings.wait_timeout,
            })?;

        let age = ((self.clock)() - index.generation())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > self.settings.max_index_age {
            warn!(age_secs = age.as_secs(), "Refusing query against stale index");
            return Err(OnionooError::IndexStale { age });
        }
        let cache_max_age = self.settings.cache_max_age(age);

        let result = RequestHandler::new(index.clone(), self.source.as_ref(), resource, params)
            .handle()?;
        debug!(
            relays = result.relays.len(),
            bridges = result.bridges.len(),
            "Query answered"
        );

        let meta = ResponseMeta {
            resource,
            relays_published: index.relays_published_string(),
            bridges_published: index.bridges_published_string(),
            generation: index.generation(),
            cache_max_age_secs: cache_max_age.as_secs(),
            relays_skipped: result.relays_skipped,
            bridges_skipped: result.bridges_skipped,
            relays_truncated: result.relays_truncated,
            bridges_truncated: result.bridges_truncated,
            fields: params.fields.clone(),
        };
        Ok(QueryResponse { meta, result })
    }
}
