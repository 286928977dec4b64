//! Entity collections
//!
//! An [`EntityCollection`] owns the records of one entity kind from one
//! source. It decides whether to serve the cached table or to call its
//! fetcher, normalizes fetched records (post-processing, `source` stamping,
//! primary-key de-duplication) and handles flat record im/export.
//!
//! ## Lifecycle
//!
//! ```text
//! CollectionBuilder ──build──► EntityCollection (empty)
//!                                     │ refresh(force)
//!                     cached? ────────┴──────── otherwise
//!                        │                          │
//!                 load_table()           fetch → post_process → stamp
//!                                         → dedup → replace_table()
//! ```

use crate::db::store::TableOwner;
use crate::db::RecordStore;
use crate::error::{Error, Result};
use crate::flat;
use crate::source::Fetcher;
use crate::types::{EntityKindConfig, Record, SOURCE_FIELD};
use std::collections::HashMap;
use std::fmt;

/// Hook run on every fetched record before it is stamped and cached.
pub type PostProcess = Box<dyn Fn(&mut Record) + Send + Sync>;

/// Provides the ordered canonical field names of an entity kind.
pub type SampleSchema = Box<dyn Fn() -> Vec<String> + Send + Sync>;

/// Where the records of the last refresh came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOrigin {
    /// Served from the cached table
    Cache,
    /// Fetched and written to the cache
    Fetched,
}

/// Result of [`EntityCollection::refresh`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub origin: RefreshOrigin,
    /// Records held after the refresh
    pub records: usize,
    /// Fetched records discarded for lacking a primary key
    pub dropped: usize,
}

/// Records read by [`EntityCollection::prepare_refresh`], not yet installed
#[derive(Debug)]
pub struct PendingRefresh {
    origin: RefreshOrigin,
    records: Vec<Record>,
    index: HashMap<String, usize>,
    dropped: usize,
}

/// Result of merging flat records into a collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Records appended as new entities
    pub added: usize,
    /// Existing records patched or replaced
    pub updated: usize,
}

/// Describes a collection before it is bound to a source.
///
/// This is the collection factory handed to
/// [`SourceRegistry::add_source`](crate::registry::SourceRegistry::add_source).
pub struct CollectionBuilder {
    kind: EntityKindConfig,
    fetcher: Option<Box<dyn Fetcher>>,
    post_process: Option<PostProcess>,
    sample_schema: Option<SampleSchema>,
}

impl CollectionBuilder {
    pub fn new(kind: EntityKindConfig) -> Self {
        Self {
            kind,
            fetcher: None,
            post_process: None,
            sample_schema: None,
        }
    }

    /// Builder for events
    pub fn events() -> Self {
        Self::new(EntityKindConfig::event())
    }

    /// Builder for event series
    pub fn series() -> Self {
        Self::new(EntityKindConfig::event_series())
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn post_process(mut self, hook: impl Fn(&mut Record) + Send + Sync + 'static) -> Self {
        self.post_process = Some(Box::new(hook));
        self
    }

    pub fn sample_schema(mut self, schema: impl Fn() -> Vec<String> + Send + Sync + 'static) -> Self {
        self.sample_schema = Some(Box::new(schema));
        self
    }

    pub fn primary_key(mut self, primary_key: &str) -> Self {
        self.kind = self.kind.with_primary_key(primary_key);
        self
    }

    pub fn kind(&self) -> &EntityKindConfig {
        &self.kind
    }

    /// Bind to a source, producing an empty collection.
    pub fn build(self, source_id: &str, table_suffix: &str) -> EntityCollection {
        let mut fields = match &self.sample_schema {
            Some(schema) => schema(),
            None => self.kind.fields.clone(),
        };
        for required in [self.kind.primary_key.as_str(), SOURCE_FIELD] {
            if !fields.iter().any(|f| f == required) {
                fields.push(required.to_string());
            }
        }

        EntityCollection {
            table_name: self.kind.table_name(table_suffix),
            source_id: source_id.to_string(),
            kind: self.kind,
            fields,
            records: Vec::new(),
            index: HashMap::new(),
            fetcher: self.fetcher,
            post_process: self.post_process,
        }
    }
}

/// In-memory records of one entity kind from one source
pub struct EntityCollection {
    kind: EntityKindConfig,
    source_id: String,
    table_name: String,
    fields: Vec<String>,
    records: Vec<Record>,
    /// primary key → position in `records`
    index: HashMap<String, usize>,
    fetcher: Option<Box<dyn Fetcher>>,
    post_process: Option<PostProcess>,
}

impl fmt::Debug for EntityCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCollection")
            .field("kind", &self.kind.name)
            .field("source_id", &self.source_id)
            .field("table_name", &self.table_name)
            .field("records", &self.records.len())
            .field("has_fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl EntityCollection {
    pub fn kind(&self) -> &EntityKindConfig {
        &self.kind
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Canonical fields in declaration order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by primary key
    pub fn get(&self, primary_key: &str) -> Option<&Record> {
        self.index.get(primary_key).map(|&i| &self.records[i])
    }

    /// Whether the store holds a usable cached table for this collection
    pub fn is_cached(&self, store: &RecordStore) -> Result<bool> {
        store.is_cached(&self.table_name)
    }

    /// Load from cache, or fetch and re-cache.
    ///
    /// With `force_update == false` and a usable cached table, the table is
    /// loaded. Otherwise the fetcher runs, records are post-processed,
    /// stamped with the source id, de-duplicated by primary key (last one
    /// wins) and the cached table is replaced. On any failure the in-memory
    /// records and the cached table stay as they were.
    pub fn refresh(&mut self, store: &RecordStore, force_update: bool) -> Result<RefreshOutcome> {
        let pending = self.prepare_refresh(store, force_update)?;
        self.commit_refresh(store, pending)
    }

    /// First half of [`Self::refresh`]: read the cache or run the fetcher
    /// without changing the collection or the store.
    pub fn prepare_refresh(&self, store: &RecordStore, force_update: bool) -> Result<PendingRefresh> {
        let (origin, raw) = if !force_update && self.is_cached(store)? {
            (RefreshOrigin::Cache, store.load_table(&self.table_name)?)
        } else {
            (RefreshOrigin::Fetched, self.fetch()?)
        };

        let (records, index, dropped) = self.dedup(raw);
        if dropped > 0 {
            tracing::warn!(
                source = %self.source_id,
                kind = %self.kind.name,
                primary_key = %self.kind.primary_key,
                dropped,
                "Dropped records without primary key"
            );
        }
        Ok(PendingRefresh {
            origin,
            records,
            index,
            dropped,
        })
    }

    /// Second half of [`Self::refresh`]: write fetched records to the cache,
    /// then install them in memory.
    pub fn commit_refresh(
        &mut self,
        store: &RecordStore,
        pending: PendingRefresh,
    ) -> Result<RefreshOutcome> {
        if pending.origin == RefreshOrigin::Fetched {
            store.replace_table(
                &self.table_name,
                &self.fields,
                &pending.records,
                Some(TableOwner {
                    source_id: &self.source_id,
                    entity_kind: &self.kind.name,
                }),
            )?;
        }
        self.records = pending.records;
        self.index = pending.index;

        match pending.origin {
            RefreshOrigin::Cache => tracing::debug!(
                source = %self.source_id,
                kind = %self.kind.name,
                count = self.records.len(),
                "Loaded collection from cache"
            ),
            RefreshOrigin::Fetched => tracing::info!(
                source = %self.source_id,
                kind = %self.kind.name,
                count = self.records.len(),
                table = %self.table_name,
                "Fetched and cached collection"
            ),
        }
        Ok(RefreshOutcome {
            origin: pending.origin,
            records: self.records.len(),
            dropped: pending.dropped,
        })
    }

    /// Write the current in-memory records to the cached table
    pub fn store(&self, store: &RecordStore) -> Result<()> {
        store.replace_table(
            &self.table_name,
            &self.fields,
            &self.records,
            Some(TableOwner {
                source_id: &self.source_id,
                entity_kind: &self.kind.name,
            }),
        )?;
        Ok(())
    }

    fn fetch(&self) -> Result<Vec<Record>> {
        let fetcher = self.fetcher.as_ref().ok_or_else(|| Error::FetchFailed {
            source_id: self.source_id.clone(),
            entity_kind: self.kind.name.clone(),
            cause: "no fetcher configured and no cached table".into(),
        })?;

        let mut records = fetcher.fetch().map_err(|cause| Error::FetchFailed {
            source_id: self.source_id.clone(),
            entity_kind: self.kind.name.clone(),
            cause,
        })?;

        for record in &mut records {
            if let Some(hook) = &self.post_process {
                hook(record);
            }
            record.drop_nulls();
            record.set(SOURCE_FIELD, self.source_id.as_str());
        }
        Ok(records)
    }

    /// Keep the last record per primary key at the position of its first
    /// occurrence; drop records without a key.
    fn dedup(&self, records: Vec<Record>) -> (Vec<Record>, HashMap<String, usize>, usize) {
        let mut out: Vec<Record> = Vec::with_capacity(records.len());
        let mut index = HashMap::new();
        let mut dropped = 0;

        for record in records {
            match record.key_string(&self.kind.primary_key) {
                Some(key) => match index.get(&key).copied() {
                    Some(i) => out[i] = record,
                    None => {
                        index.insert(key, out.len());
                        out.push(record);
                    }
                },
                None => dropped += 1,
            }
        }
        (out, index, dropped)
    }

    // ============================================
    // Flat record im/export
    // ============================================

    /// Merge pre-fetched flat records into the collection.
    ///
    /// - Incoming `source` values are ignored; this collection's id is kept.
    /// - A record whose primary key is absent is appended as a new entity.
    /// - A record with an unknown primary key is appended as a new entity.
    /// - A record with a known primary key patches the existing record when
    ///   `append` is false (only the incoming fields change), and replaces it
    ///   wholesale when `append` is true.
    pub fn from_flat_records(&mut self, records: Vec<Record>, append: bool) -> ImportOutcome {
        let mut outcome = ImportOutcome::default();

        for mut record in records {
            record.remove(SOURCE_FIELD);
            match record.key_string(&self.kind.primary_key) {
                Some(key) => match self.index.get(&key).copied() {
                    Some(i) if append => {
                        record.set(SOURCE_FIELD, self.source_id.as_str());
                        self.records[i] = record;
                        outcome.updated += 1;
                    }
                    Some(i) => {
                        self.records[i].apply_patch(&record);
                        outcome.updated += 1;
                    }
                    None => {
                        record.set(SOURCE_FIELD, self.source_id.as_str());
                        self.index.insert(key, self.records.len());
                        self.records.push(record);
                        outcome.added += 1;
                    }
                },
                None => {
                    record.set(SOURCE_FIELD, self.source_id.as_str());
                    self.records.push(record);
                    outcome.added += 1;
                }
            }
        }

        tracing::debug!(
            source = %self.source_id,
            kind = %self.kind.name,
            added = outcome.added,
            updated = outcome.updated,
            "Merged flat records"
        );
        outcome
    }

    /// All records projected to the canonical fields
    pub fn as_flat_records(&self) -> Vec<Record> {
        self.project(self.records.iter())
    }

    /// Records chosen by `select` projected to the canonical fields
    ///
    /// `select` receives the whole collection and returns the subset to
    /// export; it replaces the default selection rather than filtering it.
    pub fn as_flat_records_with<'a, F>(&'a self, select: F) -> Vec<Record>
    where
        F: FnOnce(&'a [Record]) -> Vec<&'a Record>,
    {
        self.project(select(&self.records).into_iter())
    }

    fn project<'a>(&self, records: impl Iterator<Item = &'a Record>) -> Vec<Record> {
        records.map(|r| r.project(&self.fields)).collect()
    }

    /// Merge CSV text (header row required), see [`Self::from_flat_records`]
    pub fn from_csv(&mut self, text: &str, append: bool) -> Result<ImportOutcome> {
        let records = flat::records_from_csv(text)?;
        Ok(self.from_flat_records(records, append))
    }

    /// All records as CSV over the canonical fields
    pub fn as_csv(&self) -> Result<String> {
        flat::records_to_csv(&self.records, &self.fields)
    }

    /// Selected records as CSV over the canonical fields
    pub fn as_csv_with<'a, F>(&'a self, select: F) -> Result<String>
    where
        F: FnOnce(&'a [Record]) -> Vec<&'a Record>,
    {
        flat::records_to_csv(select(&self.records), &self.fields)
    }
}
