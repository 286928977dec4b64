//! Source registry
//!
//! The composition root: one [`DataSource`] (events + series collections)
//! per source id, all sharing one [`RecordStore`].
//!
//! ## Loading
//!
//! ```text
//! load_all(force)
//!   ├─ for each source, in registration order
//!   │    ├─ events.prepare_refresh(force)   ┐ a failure here marks the
//!   │    ├─ series.prepare_refresh(force)   ┘ source failed and moves on
//!   │    ├─ commit both
//!   │    └─ link(events, series)
//!   └─ build_union_view(event), build_union_view(eventseries)
//! ```
//!
//! Store failures are not per-source; they abort the load.

use crate::collection::{CollectionBuilder, EntityCollection, ImportOutcome, RefreshOrigin};
use crate::config::{Config, ViewConfig};
use crate::db::store::validate_table_name;
use crate::db::{RecordStore, TableInfo};
use crate::error::{Error, Result};
use crate::linker::{self, LinkStats, SeriesLinks};
use crate::source::FileFetcher;
use crate::types::{EntityKindConfig, Record, Value};
use crate::view::{self, UnionView};
use std::collections::BTreeMap;

/// Descriptive fields of a source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    /// Display name
    pub name: String,
    pub url: Option<String>,
    pub title: Option<String>,
    /// Appended to the kind's table prefix, e.g. `dblp` in `event_dblp`
    pub table_suffix: String,
}

impl SourceMetadata {
    /// Metadata whose name and table suffix are the source id
    pub fn for_id(source_id: &str) -> Self {
        Self {
            name: source_id.to_string(),
            table_suffix: source_id.to_string(),
            ..Default::default()
        }
    }
}

/// Events and series of one source
#[derive(Debug)]
pub struct DataSource {
    id: String,
    metadata: SourceMetadata,
    pub events: EntityCollection,
    pub series: EntityCollection,
    links: Option<SeriesLinks>,
}

impl DataSource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    /// Result of the last successful link, if any
    pub fn links(&self) -> Option<&SeriesLinks> {
        self.links.as_ref()
    }

    /// Events of a series; `None` if unlinked or not found
    pub fn events_for_series(&self, acronym: &str) -> Option<&[Record]> {
        self.links.as_ref()?.events_for_series(acronym)
    }

    /// Collection whose table or view prefix is `kind`, e.g. `eventseries`
    pub fn collection(&self, kind: &str) -> Option<&EntityCollection> {
        [&self.events, &self.series]
            .into_iter()
            .find(|c| c.kind().view_name() == kind)
    }

    fn collection_mut(&mut self, kind: &str) -> Option<&mut EntityCollection> {
        [&mut self.events, &mut self.series]
            .into_iter()
            .find(|c| c.kind().view_name() == kind)
    }

    /// Whether one of this source's collections uses `table_name`
    pub fn owns_table(&self, table_name: &str) -> bool {
        self.events.table_name() == table_name || self.series.table_name() == table_name
    }

    /// Refresh both collections and relink
    ///
    /// Both collections are read or fetched before either is replaced, so a
    /// fetch failure on one side leaves the source exactly as it was. If the
    /// store rejects the series after the events were written, the links are
    /// rebuilt over what the collections now hold.
    pub fn load(&mut self, store: &RecordStore, force_update: bool) -> Result<SourceOutcome> {
        let pending_events = self.events.prepare_refresh(store, force_update)?;
        let pending_series = self.series.prepare_refresh(store, force_update)?;

        let events = self.events.commit_refresh(store, pending_events)?;
        let series = match self.series.commit_refresh(store, pending_series) {
            Ok(series) => series,
            Err(e) => {
                self.links = Some(linker::link_default(&self.events, &self.series));
                return Err(e);
            }
        };

        let links = linker::link_default(&self.events, &self.series);
        let link_stats = links.stats.clone();
        self.links = Some(links);

        Ok(SourceOutcome::Loaded {
            events: events.records,
            series: series.records,
            link_stats,
            from_cache: events.origin == RefreshOrigin::Cache
                && series.origin == RefreshOrigin::Cache,
        })
    }
}

/// What happened to one source during a load
#[derive(Debug)]
pub enum SourceOutcome {
    Loaded {
        events: usize,
        series: usize,
        link_stats: LinkStats,
        /// Both collections were served from cache
        from_cache: bool,
    },
    Failed {
        error: Error,
    },
}

/// Per-source line of a [`LoadReport`]
#[derive(Debug)]
pub struct SourceReport {
    pub source_id: String,
    pub outcome: SourceOutcome,
}

impl SourceReport {
    pub fn is_loaded(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Loaded { .. })
    }
}

/// Aggregate result of a load
#[derive(Debug, Default)]
pub struct LoadReport {
    pub sources: Vec<SourceReport>,
    pub views: Vec<UnionView>,
}

impl LoadReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| s.is_loaded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| !s.is_loaded())
    }

    /// Whether every source loaded
    pub fn is_complete(&self) -> bool {
        self.sources.iter().all(SourceReport::is_loaded)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// Holds every registered source and the shared store
pub struct SourceRegistry {
    store: RecordStore,
    sources: Vec<DataSource>,
    views: ViewConfig,
    queries: BTreeMap<String, String>,
}

impl SourceRegistry {
    /// Empty registry over `store` with default view projections
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            sources: Vec::new(),
            views: ViewConfig::default(),
            queries: BTreeMap::new(),
        }
    }

    /// Registry with the file-backed sources, views and named queries of `config`
    pub fn from_config(config: &Config, store: RecordStore) -> Result<Self> {
        let mut registry = Self::new(store);
        registry.views = config.views.clone();
        registry.queries = config.queries.clone();

        for source in &config.sources {
            let mut events = CollectionBuilder::events().fetcher(FileFetcher::new(
                source.events.pattern.clone(),
                source.events.format,
            ));
            if let Some(pk) = &source.events.primary_key {
                events = events.primary_key(pk);
            }

            let mut series = CollectionBuilder::series().fetcher(FileFetcher::new(
                source.series.pattern.clone(),
                source.series.format,
            ));
            if let Some(pk) = &source.series.primary_key {
                series = series.primary_key(pk);
            }

            let metadata = SourceMetadata {
                name: source.name.clone().unwrap_or_else(|| source.id.clone()),
                url: source.url.clone(),
                title: source.title.clone(),
                table_suffix: source.table_suffix().to_string(),
            };
            registry.add_source(&source.id, events, series, metadata)?;
        }

        tracing::debug!(sources = registry.sources.len(), "Registry built from config");
        Ok(registry)
    }

    /// Register a source.
    ///
    /// An empty `table_suffix` defaults to the source id.
    pub fn add_source(
        &mut self,
        source_id: &str,
        events: CollectionBuilder,
        series: CollectionBuilder,
        mut metadata: SourceMetadata,
    ) -> Result<&DataSource> {
        if self.sources.iter().any(|s| s.id == source_id) {
            return Err(Error::DuplicateSource(source_id.to_string()));
        }
        if metadata.table_suffix.is_empty() {
            metadata.table_suffix = source_id.to_string();
        }
        for kind in [events.kind(), series.kind()] {
            validate_table_name(&kind.table_name(&metadata.table_suffix))?;
        }

        let events = events.build(source_id, &metadata.table_suffix);
        let series = series.build(source_id, &metadata.table_suffix);
        if let Some(taken) = self
            .sources
            .iter()
            .find(|s| s.owns_table(events.table_name()) || s.owns_table(series.table_name()))
        {
            return Err(Error::Config(format!(
                "source {:?} reuses the table suffix of {:?}",
                source_id, taken.id
            )));
        }

        tracing::debug!(
            source = source_id,
            events_table = %events.table_name(),
            series_table = %series.table_name(),
            "Registered data source"
        );
        self.sources.push(DataSource {
            id: source_id.to_string(),
            metadata,
            events,
            series,
            links: None,
        });
        Ok(&self.sources[self.sources.len() - 1])
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Sources in registration order
    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn get_source(&self, source_id: &str) -> Option<&DataSource> {
        self.sources.iter().find(|s| s.id == source_id)
    }

    /// Source owning a generated table name, e.g. `event_dblp`
    pub fn get_source_for_table(&self, table_name: &str) -> Option<&DataSource> {
        self.sources.iter().find(|s| s.owns_table(table_name))
    }

    // ============================================
    // Loading
    // ============================================

    /// Refresh and link every source, then rebuild the union views.
    pub fn load_all(&mut self, force_update: bool) -> Result<LoadReport> {
        self.load_all_with_progress(force_update, |_, _, _| {})
    }

    /// [`Self::load_all`] with a callback receiving
    /// `(current_index, total, source_id)` before each source.
    pub fn load_all_with_progress<F>(&mut self, force_update: bool, on_progress: F) -> Result<LoadReport>
    where
        F: FnMut(usize, usize, &str),
    {
        let all: Vec<usize> = (0..self.sources.len()).collect();
        self.load_indices(&all, force_update, on_progress)
    }

    /// Load only the named sources; the views still cover every cached table.
    pub fn load_sources(&mut self, source_ids: &[&str], force_update: bool) -> Result<LoadReport> {
        let mut indices = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            let index = self
                .sources
                .iter()
                .position(|s| s.id == *id)
                .ok_or_else(|| Error::SourceNotFound(id.to_string()))?;
            indices.push(index);
        }
        self.load_indices(&indices, force_update, |_, _, _| {})
    }

    fn load_indices<F>(&mut self, indices: &[usize], force_update: bool, mut on_progress: F) -> Result<LoadReport>
    where
        F: FnMut(usize, usize, &str),
    {
        let mut report = LoadReport::default();
        let total = indices.len();

        for (i, &index) in indices.iter().enumerate() {
            let source = &mut self.sources[index];
            on_progress(i, total, &source.id);

            let outcome = match source.load(&self.store, force_update) {
                Ok(outcome) => {
                    if let SourceOutcome::Loaded {
                        events,
                        series,
                        from_cache,
                        ..
                    } = &outcome
                    {
                        tracing::info!(
                            source = %source.id,
                            events,
                            series,
                            from_cache,
                            "Loaded data source"
                        );
                    }
                    outcome
                }
                Err(e) if e.is_cross_cutting() => {
                    tracing::error!(source = %source.id, error = %e, "Store failure, aborting load");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(source = %source.id, error = %e, "Failed to load data source");
                    SourceOutcome::Failed { error: e }
                }
            };
            report.sources.push(SourceReport {
                source_id: source.id.clone(),
                outcome,
            });
        }

        report.views = self.rebuild_views()?;

        tracing::info!(
            loaded = report.succeeded().count(),
            failed = report.failed().count(),
            "Load complete"
        );
        Ok(report)
    }

    /// Rebuild the `event` and `eventseries` union views
    pub fn rebuild_views(&self) -> Result<Vec<UnionView>> {
        let exclude = Some(&self.views.exclude).filter(|ex| !ex.is_empty());
        let event = view::build_union_view(
            &self.store,
            &EntityKindConfig::event().view_name(),
            &self.views.event,
            exclude,
        )?;
        let eventseries = view::build_union_view(
            &self.store,
            &EntityKindConfig::event_series().view_name(),
            &self.views.eventseries,
            exclude,
        )?;
        Ok(vec![event, eventseries])
    }

    /// Merge CSV text into one collection of a source, write it to the
    /// cache, relink the source and rebuild the views.
    ///
    /// `kind` is the view prefix (`event` or `eventseries`); `append` has the
    /// meaning of [`EntityCollection::from_flat_records`].
    pub fn import_csv(
        &mut self,
        source_id: &str,
        kind: &str,
        text: &str,
        append: bool,
    ) -> Result<ImportOutcome> {
        let source = self
            .sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or_else(|| Error::SourceNotFound(source_id.to_string()))?;
        let collection = source.collection_mut(kind).ok_or_else(|| {
            Error::Malformed(format!(
                "unknown entity kind {:?} (use event or eventseries)",
                kind
            ))
        })?;

        let outcome = collection.from_csv(text, append)?;
        collection.store(&self.store)?;
        source.links = Some(linker::link_default(&source.events, &source.series));

        tracing::info!(
            source = source_id,
            kind,
            added = outcome.added,
            updated = outcome.updated,
            "Imported CSV"
        );
        self.rebuild_views()?;
        Ok(outcome)
    }

    // ============================================
    // Queries
    // ============================================

    pub fn list_tables(&self) -> Result<Vec<TableInfo>> {
        self.store.list_tables()
    }

    /// Configured query names and their SQL
    pub fn named_queries(&self) -> &BTreeMap<String, String> {
        &self.queries
    }

    /// Run a named query, or `name_or_sql` itself when no query has that name
    pub fn query(&self, name_or_sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let sql = self
            .queries
            .get(name_or_sql)
            .map(String::as_str)
            .unwrap_or(name_or_sql);
        self.store.run_query(sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type FetchResult = std::result::Result<Vec<Record>, BoxError>;

    fn events_of(source: &'static str) -> CollectionBuilder {
        CollectionBuilder::events().fetcher(move || -> FetchResult {
            Ok(vec![Record::new()
                .with("eventId", format!("{source}-1"))
                .with("acronym", "WebSci 2019")
                .with("series", "WebSci")])
        })
    }

    fn series_of() -> CollectionBuilder {
        CollectionBuilder::series().fetcher(|| -> FetchResult {
            Ok(vec![Record::new()
                .with("eventSeriesId", "s1")
                .with("acronym", "WebSci")])
        })
    }

    fn registry() -> SourceRegistry {
        SourceRegistry::new(RecordStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_partial_failure_keeps_siblings() {
        let mut registry = registry();
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        registry
            .add_source(
                "b",
                CollectionBuilder::events()
                    .fetcher(|| -> FetchResult { Err("connection refused".into()) }),
                series_of(),
                SourceMetadata::for_id("b"),
            )
            .unwrap();
        registry
            .add_source("c", events_of("c"), series_of(), SourceMetadata::for_id("c"))
            .unwrap();

        let report = registry.load_all(false).unwrap();
        assert!(!report.is_complete());
        let failed: Vec<_> = report.failed().map(|r| r.source_id.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
        assert!(matches!(
            report.get("b").unwrap().outcome,
            SourceOutcome::Failed {
                error: Error::FetchFailed { .. }
            }
        ));

        for id in ["a", "c"] {
            let source = registry.get_source(id).unwrap();
            assert_eq!(source.events.len(), 1);
            assert_eq!(source.events_for_series("WebSci").unwrap().len(), 1);
        }
        assert!(registry.get_source("b").unwrap().links().is_none());

        let rows = registry.query("SELECT eventId FROM event", &[]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut registry = registry();
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        let err = registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSource(id) if id == "a"));
    }

    #[test]
    fn test_shared_table_suffix_rejected() {
        let mut registry = registry();
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("shared"))
            .unwrap();
        let err = registry
            .add_source("b", events_of("b"), series_of(), SourceMetadata::for_id("shared"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_get_source_for_table() {
        let mut registry = registry();
        let metadata = SourceMetadata {
            name: "Open Research".to_string(),
            table_suffix: "orwiki".to_string(),
            ..Default::default()
        };
        registry
            .add_source("or", events_of("or"), series_of(), metadata)
            .unwrap();

        assert_eq!(registry.get_source_for_table("event_orwiki").unwrap().id(), "or");
        assert_eq!(
            registry.get_source_for_table("eventseries_orwiki").unwrap().id(),
            "or"
        );
        assert!(registry.get_source_for_table("event_or").is_none());
        assert_eq!(
            registry.get_source("or").unwrap().collection("eventseries").unwrap().table_name(),
            "eventseries_orwiki"
        );
    }

    #[test]
    fn test_empty_suffix_defaults_to_id() {
        let mut registry = registry();
        let source = registry
            .add_source("dblp", events_of("dblp"), series_of(), SourceMetadata::default())
            .unwrap();
        assert_eq!(source.metadata().table_suffix, "dblp");
        assert_eq!(source.events.table_name(), "event_dblp");
    }

    #[test]
    fn test_invalid_suffix_rejected() {
        let mut registry = registry();
        let err = registry
            .add_source("x", events_of("x"), series_of(), SourceMetadata::for_id("bad-name"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTableName(_)));
    }

    #[test]
    fn test_second_load_is_served_from_cache() {
        let mut registry = registry();
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        registry.load_all(false).unwrap();

        let report = registry.load_all(false).unwrap();
        assert!(matches!(
            report.get("a").unwrap().outcome,
            SourceOutcome::Loaded {
                from_cache: true,
                ..
            }
        ));
        assert_eq!(report.views.len(), 2);
    }

    #[test]
    fn test_load_sources_restricts_and_validates() {
        let mut registry = registry();
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        registry
            .add_source("c", events_of("c"), series_of(), SourceMetadata::for_id("c"))
            .unwrap();

        let report = registry.load_sources(&["c"], false).unwrap();
        assert_eq!(report.sources.len(), 1);
        assert!(registry.get_source("a").unwrap().events.is_empty());

        assert!(matches!(
            registry.load_sources(&["zz"], false),
            Err(Error::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_named_query_resolution() {
        let mut registry = registry();
        registry
            .queries
            .insert("count".to_string(), "SELECT COUNT(*) AS n FROM event".to_string());
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        registry.load_all(false).unwrap();

        let rows = registry.query("count", &[]).unwrap();
        assert_eq!(rows[0].get("n"), Some(&Value::Integer(1)));
        assert!(matches!(
            registry.query("SELEKT", &[]),
            Err(Error::QuerySyntax { .. })
        ));
    }

    /// Events fetcher returning `gen<n>` on its n-th call (from 0)
    fn generational_events() -> CollectionBuilder {
        let calls = AtomicUsize::new(0);
        CollectionBuilder::events().fetcher(move || -> FetchResult {
            let generation = calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Record::new()
                .with("eventId", format!("gen{generation}"))
                .with("series", "WebSci")])
        })
    }

    fn linked_ids(source: &DataSource) -> Vec<String> {
        source
            .events_for_series("WebSci")
            .unwrap_or(&[])
            .iter()
            .filter_map(|r| r.key_string("eventId"))
            .collect()
    }

    #[test]
    fn test_series_fetch_failure_keeps_events_and_links_together() {
        let mut registry = registry();
        let series_calls = AtomicUsize::new(0);
        let series = CollectionBuilder::series().fetcher(move || -> FetchResult {
            if series_calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err("series endpoint gone".into());
            }
            Ok(vec![Record::new()
                .with("eventSeriesId", "s1")
                .with("acronym", "WebSci")])
        });
        registry
            .add_source("a", generational_events(), series, SourceMetadata::for_id("a"))
            .unwrap();
        registry.load_all(false).unwrap();
        assert_eq!(linked_ids(registry.get_source("a").unwrap()), vec!["gen0"]);

        let report = registry.load_all(true).unwrap();
        assert!(matches!(
            report.get("a").unwrap().outcome,
            SourceOutcome::Failed {
                error: Error::FetchFailed { .. }
            }
        ));

        let source = registry.get_source("a").unwrap();
        assert_eq!(source.events.records()[0].get_str("eventId"), Some("gen0"));
        assert_eq!(
            registry.store().load_table("event_a").unwrap()[0].get_str("eventId"),
            Some("gen0")
        );
        assert_eq!(linked_ids(source), vec!["gen0"]);
    }

    #[test]
    fn test_series_store_failure_relinks_replaced_events() {
        let mut registry = registry();
        registry
            .add_source("a", generational_events(), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        registry.load_all(false).unwrap();

        // a view squatting on the series table name makes its replacement fail
        registry.store().execute_ddl("DROP TABLE eventseries_a").unwrap();
        registry
            .store()
            .execute_ddl("CREATE VIEW eventseries_a AS SELECT 1 AS x")
            .unwrap();

        let err = registry.load_all(true).unwrap_err();
        assert!(err.is_cross_cutting(), "unexpected error: {err}");

        let source = registry.get_source("a").unwrap();
        assert_eq!(source.events.records()[0].get_str("eventId"), Some("gen1"));
        assert_eq!(linked_ids(source), vec!["gen1"]);
    }

    #[test]
    fn test_store_failure_aborts_whole_load() {
        let mut registry = registry();
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = later_calls.clone();
        registry
            .add_source("a", events_of("a"), series_of(), SourceMetadata::for_id("a"))
            .unwrap();
        registry
            .add_source("b", events_of("b"), series_of(), SourceMetadata::for_id("b"))
            .unwrap();
        registry
            .add_source(
                "c",
                CollectionBuilder::events().fetcher(move || -> FetchResult {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }),
                series_of(),
                SourceMetadata::for_id("c"),
            )
            .unwrap();
        registry
            .store()
            .execute_ddl("CREATE VIEW event_b AS SELECT 1 AS x")
            .unwrap();

        let err = registry.load_all(false).unwrap_err();
        assert!(matches!(err, Error::Database(_)), "unexpected error: {err}");
        assert!(err.is_cross_cutting());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert!(registry.get_source("c").unwrap().events.is_empty());
        assert!(!registry.store().view_exists("event").unwrap());
    }
}
