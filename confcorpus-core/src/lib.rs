//! # confcorpus-core
//!
//! Core library for confcorpus - a multi-source corpus of scientific events
//! and event series.
//!
//! This library provides:
//! - A SQLite record store with one cached table per (entity kind, source)
//! - Entity collections that load from cache or fetch and re-cache
//! - A source registry with partial-failure loading
//! - Series ↔ event linking and cross-source union views
//! - Configuration management and logging infrastructure
//!
//! ## Data flow
//!
//! ```text
//! SourceRegistry::load_all
//!   → EntityCollection::refresh (per source, per kind)
//!   → linker::link (per source)
//!   → view::build_union_view (once per kind)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use confcorpus_core::{Config, RecordStore, SourceRegistry};
//!
//! let config = Config::load().expect("failed to load config");
//! let store = RecordStore::open(&config.storage).expect("failed to open store");
//! let mut registry = SourceRegistry::from_config(&config, store).expect("bad sources");
//!
//! let report = registry.load_all(false).expect("store failure");
//! for failed in report.failed() {
//!     eprintln!("{} failed", failed.source_id);
//! }
//! let rows = registry.query("SELECT acronym FROM event", &[]).expect("query failed");
//! ```

// Re-export commonly used items at the crate root
pub use collection::{
    CollectionBuilder, EntityCollection, ImportOutcome, RefreshOrigin, RefreshOutcome,
};
pub use config::Config;
pub use db::{RecordStore, TableInfo};
pub use error::{Error, Result};
pub use linker::{LinkStats, SeriesLinks};
pub use registry::{DataSource, LoadReport, SourceMetadata, SourceOutcome, SourceRegistry};
pub use source::{Fetcher, FileFetcher, FileFormat};
pub use types::*;
pub use view::UnionView;

// Public modules
pub mod collection;
pub mod config;
pub mod db;
pub mod error;
pub mod flat;
pub mod linker;
pub mod logging;
pub mod registry;
pub mod source;
pub mod types;
pub mod view;
