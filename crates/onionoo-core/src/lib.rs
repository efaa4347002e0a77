//! # Onionoo Core Library
//!
//! This crate provides the in-memory node index and the query engine of an
//! Onionoo-style Tor network status service. A background indexer turns the
//! current set of relay and bridge summary records into an immutable,
//! fully-indexed snapshot; queries run against whichever snapshot was most
//! recently published, without ever observing a partially built one.
//!
//! ## Architecture
//!
//! - **Types** (`types`): Summary records and fingerprint helpers
//! - **Version** (`version`): Tor version parsing and ordering
//! - **Source** (`source`): The summary record collaborator and two implementations
//! - **Index** (`index`): Immutable snapshot with secondary indexes
//! - **Indexer** (`indexer`): Background refresh and snapshot publication
//! - **Query** (`query`): Parameter parsing and validation
//! - **Order** (`order`): Multi-key result ordering
//! - **Request** (`request`): The filter, order and paging pipeline
//! - **Service** (`service`): Snapshot capture, freshness and response metadata
//! - **Config** (`config`): Configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use onionoo_core::{
//!     IndexerSettings, JsonFileSource, NodeIndexer, QueryService, ServiceSettings,
//! };
//! use std::sync::Arc;
//!
//! let source = Arc::new(JsonFileSource::new("summary.json"));
//! let indexer = Arc::new(NodeIndexer::new(source.clone(), IndexerSettings::default()));
//! indexer.start()?;
//!
//! let service = QueryService::new(indexer, source, ServiceSettings::default());
//! let response = service.query_string("summary", "type=relay&order=-consensus_weight&limit=10")?;
//! for fingerprint in response.result.fingerprints() {
//!     println!("{}", fingerprint);
//! }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod order;
pub mod query;
pub mod request;
pub mod service;
pub mod source;
pub mod types;
pub mod version;

// Re-export commonly used types
pub use config::Config;
pub use error::{OnionooError, Result};
pub use index::{build_index, IndexStats, NodeIndex};
pub use indexer::{Clock, IndexerSettings, NodeIndexer};
pub use order::{Direction, OrderField, OrderKey, Orderer};
pub use query::{QueryParams, ResourceType};
pub use request::{QueryResult, RequestHandler};
pub use service::{QueryResponse, QueryService, ResponseMeta, ServiceSettings};
pub use source::{JsonFileSource, MemorySource, SummaryFile, SummarySource};
pub use types::{NodeKind, SummaryRecord};
pub use version::{TorVersion, VersionSpec};
