//! Series ↔ event linking
//!
//! Joins one source's events to its series by equality of a normalized key
//! (by default the event's `series` field against the series' `acronym`).
//! Both sides keep duplicates: same-acronym collisions are real in the
//! source data and are surfaced, never collapsed.

use crate::collection::EntityCollection;
use crate::types::Record;
use serde::Serialize;
use std::collections::HashMap;

/// Event field holding the series key
pub const DEFAULT_FOREIGN_KEY: &str = "series";

/// Series field matched against the event's foreign key
pub const DEFAULT_SERIES_KEY: &str = "acronym";

/// Counts describing one link run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Events carrying a foreign key
    pub linked_events: usize,
    /// Series carrying a series key
    pub keyed_series: usize,
    /// Distinct foreign keys with at least one matching series
    pub resolved_keys: usize,
    /// Foreign keys with no matching series, sorted
    pub unresolved_keys: Vec<String>,
    /// Series keys shared by more than one series record, sorted
    pub ambiguous_series: Vec<String>,
}

/// The two lookups produced by [`link`]
#[derive(Debug, Clone, Default)]
pub struct SeriesLinks {
    /// foreign key → events sharing it, in collection order
    pub series_lookup: HashMap<String, Vec<Record>>,
    /// series key → series records sharing it, in collection order
    pub series_acronym_lookup: HashMap<String, Vec<Record>>,
    pub stats: LinkStats,
}

impl SeriesLinks {
    /// Events of a series, by exact case-sensitive key.
    ///
    /// `None` when the key has no events or no series entry; consult
    /// [`Self::series_for`] to tell the two apart.
    pub fn events_for_series(&self, acronym: &str) -> Option<&[Record]> {
        if !self.series_acronym_lookup.contains_key(acronym) {
            return None;
        }
        self.series_lookup.get(acronym).map(Vec::as_slice)
    }

    /// Series records registered under a key
    pub fn series_for(&self, acronym: &str) -> Option<&[Record]> {
        self.series_acronym_lookup.get(acronym).map(Vec::as_slice)
    }

    /// Whether the key has events but no series
    pub fn is_unresolved(&self, key: &str) -> bool {
        self.series_lookup.contains_key(key) && !self.series_acronym_lookup.contains_key(key)
    }
}

/// Link with the default key fields.
pub fn link_default(events: &EntityCollection, series: &EntityCollection) -> SeriesLinks {
    link(events, series, DEFAULT_FOREIGN_KEY, DEFAULT_SERIES_KEY)
}

/// Build both lookups for one source.
///
/// Records without a key on their side are skipped. Unresolved keys are
/// recorded in the stats and logged; they never fail the link.
pub fn link(
    events: &EntityCollection,
    series: &EntityCollection,
    foreign_key: &str,
    series_key: &str,
) -> SeriesLinks {
    let series_lookup = group_by_key(events.records(), foreign_key);
    let series_acronym_lookup = group_by_key(series.records(), series_key);

    let mut unresolved_keys: Vec<String> = series_lookup
        .keys()
        .filter(|k| !series_acronym_lookup.contains_key(*k))
        .cloned()
        .collect();
    unresolved_keys.sort();

    let mut ambiguous_series: Vec<String> = series_acronym_lookup
        .iter()
        .filter(|(_, records)| records.len() > 1)
        .map(|(k, _)| k.clone())
        .collect();
    ambiguous_series.sort();

    let stats = LinkStats {
        linked_events: series_lookup.values().map(Vec::len).sum(),
        keyed_series: series_acronym_lookup.values().map(Vec::len).sum(),
        resolved_keys: series_lookup.len() - unresolved_keys.len(),
        unresolved_keys,
        ambiguous_series,
    };

    if !stats.unresolved_keys.is_empty() {
        tracing::info!(
            source = %events.source_id(),
            unresolved = stats.unresolved_keys.len(),
            "Events reference series without a series record"
        );
        tracing::debug!(
            source = %events.source_id(),
            keys = ?stats.unresolved_keys,
            "Unresolved series keys"
        );
    }
    if !stats.ambiguous_series.is_empty() {
        tracing::warn!(
            source = %series.source_id(),
            keys = ?stats.ambiguous_series,
            "Several series share a key"
        );
    }
    tracing::debug!(
        source = %events.source_id(),
        events = stats.linked_events,
        series = stats.keyed_series,
        resolved = stats.resolved_keys,
        "Linked events to series"
    );

    SeriesLinks {
        series_lookup,
        series_acronym_lookup,
        stats,
    }
}

fn group_by_key(records: &[Record], field: &str) -> HashMap<String, Vec<Record>> {
    let mut groups: HashMap<String, Vec<Record>> = HashMap::new();
    for record in records {
        if let Some(key) = record.key_string(field) {
            groups.entry(key).or_default().push(record.clone());
        }
    }
    groups
}
