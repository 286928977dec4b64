//! Integration tests for the confcorpus load pipeline
//!
//! These tests copy the record files in `tests/fixtures/` into a temporary
//! directory, describe them in a `config.toml`, and run the registry end to
//! end against a file-backed cache.

use confcorpus_core::config::{Config, StorageConfig};
use confcorpus_core::{Error, RecordStore, SourceOutcome, SourceRegistry, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CONFIG: &str = r#"
[storage]
mode = "sql"

[queries]
websci = "SELECT eventId, source FROM event WHERE acronym LIKE 'WebSci%' ORDER BY eventId"

[[sources]]
id = "dblp"
name = "dblp computer science bibliography"
url = "https://dblp.org"

[sources.events]
pattern = "dblp/events.json"

[sources.series]
pattern = "dblp/series.json"

[[sources]]
id = "or"
name = "OPENRESEARCH"
table_suffix = "orwiki"

[sources.events]
pattern = "orwiki/*.csv"
format = "csv"

[sources.series]
pattern = "orwiki/series.jsonl"
format = "jsonl"
"#;

/// Path of the checked-in fixtures
fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Temp workspace holding the fixtures, a config file and a cache file
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        copy_dir(&fixtures_dir(), dir.path());
        fs::write(dir.path().join("config.toml"), CONFIG).unwrap();
        Self { dir }
    }

    fn config(&self) -> Config {
        let mut config = Config::load_from(&self.dir.path().join("config.toml")).unwrap();
        config.storage = StorageConfig::sql(self.dir.path().join("cache").join("EventCorpus.db"));
        config
    }

    fn registry(&self) -> SourceRegistry {
        let config = self.config();
        let store = RecordStore::open(&config.storage).unwrap();
        SourceRegistry::from_config(&config, store).unwrap()
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}

// ============================================
// Full load
// ============================================

#[test]
fn test_load_all_builds_tables_and_views() {
    let ws = Workspace::new();
    let mut registry = ws.registry();

    let report = registry.load_all(false).unwrap();
    assert!(report.is_complete());
    assert_eq!(registry.source_ids(), vec!["dblp", "or"]);

    let tables: Vec<_> = registry
        .list_tables()
        .unwrap()
        .into_iter()
        .map(|t| (t.name, t.row_count))
        .collect();
    assert_eq!(
        tables,
        vec![
            ("event_dblp".to_string(), 3),
            ("event_orwiki".to_string(), 2),
            ("eventseries_dblp".to_string(), 1),
            ("eventseries_orwiki".to_string(), 2),
        ]
    );

    let events = registry.query("SELECT * FROM event", &[]).unwrap();
    assert_eq!(events.len(), 5);
    let series = registry.query("SELECT * FROM eventseries", &[]).unwrap();
    assert_eq!(series.len(), 3);
}

#[test]
fn test_union_view_keeps_cross_source_duplicates() {
    let ws = Workspace::new();
    let mut registry = ws.registry();
    registry.load_all(false).unwrap();

    let rows = registry
        .query("SELECT source FROM event WHERE acronym = ?1", &[Value::from("WebSci 2019")])
        .unwrap();
    let mut sources: Vec<_> = rows.iter().filter_map(|r| r.get_str("source")).collect();
    sources.sort();
    assert_eq!(sources, vec!["dblp", "or"]);

    let named = registry.query("websci", &[]).unwrap();
    assert_eq!(named.len(), 3);
}

#[test]
fn test_linking_per_source() {
    let ws = Workspace::new();
    let mut registry = ws.registry();
    registry.load_all(false).unwrap();

    let dblp = registry.get_source("dblp").unwrap();
    assert_eq!(dblp.events_for_series("WebSci").unwrap().len(), 2);
    assert!(dblp.events_for_series("ISWC").is_none());
    let stats = &dblp.links().unwrap().stats;
    assert_eq!(stats.unresolved_keys, vec!["ISWC".to_string()]);

    let or = registry.get_source("or").unwrap();
    assert_eq!(or.metadata().name, "OPENRESEARCH");
    assert_eq!(or.events_for_series("AAAI").unwrap().len(), 1);
    assert_eq!(
        or.events.get("Q2").unwrap().get("startDate").map(ToString::to_string),
        Some("2019-06-30".to_string())
    );
}

#[test]
fn test_table_reverse_lookup() {
    let ws = Workspace::new();
    let mut registry = ws.registry();
    registry.load_all(false).unwrap();

    for table in registry.list_tables().unwrap() {
        let source = registry.get_source_for_table(&table.name).unwrap();
        assert!(table.name.ends_with(&source.metadata().table_suffix));
    }
}

// ============================================
// Export
// ============================================

#[test]
fn test_csv_export_uses_canonical_fields() {
    let ws = Workspace::new();
    let mut registry = ws.registry();
    registry.load_all(false).unwrap();

    let dblp = registry.get_source("dblp").unwrap();
    let csv = dblp.events.as_csv().unwrap();
    let mut lines = csv.split("\r\n");
    assert_eq!(
        lines.next().unwrap(),
        "\"eventId\",\"acronym\",\"series\",\"title\",\"year\",\"startDate\",\"endDate\",\
         \"url\",\"city\",\"region\",\"country\",\"countryIso\",\"regionIso\",\"source\""
    );
    assert!(!csv.contains("dblpInternal"));
    assert!(!csv.contains("iswc2020-1"));
    assert_eq!(csv.matches("\r\n").count(), 4);

    // The cached table keeps the extra field
    let cached = registry
        .query("SELECT dblpInternal FROM event_dblp WHERE eventId = 'conf/iswc/2020'", &[])
        .unwrap();
    assert_eq!(cached[0].get_str("dblpInternal"), Some("iswc2020-1"));
}

// ============================================
// Cache behaviour
// ============================================

#[test]
fn test_second_process_reads_cache_without_source_files() {
    let ws = Workspace::new();
    ws.registry().load_all(false).unwrap();

    fs::remove_dir_all(ws.path("dblp")).unwrap();

    let mut registry = ws.registry();
    let report = registry.load_all(false).unwrap();
    assert!(report.is_complete());
    assert!(matches!(
        report.get("dblp").unwrap().outcome,
        SourceOutcome::Loaded {
            from_cache: true,
            events: 3,
            ..
        }
    ));
}

#[test]
fn test_forced_refresh_isolates_failing_source() {
    let ws = Workspace::new();
    ws.registry().load_all(false).unwrap();

    fs::remove_dir_all(ws.path("dblp")).unwrap();

    let mut registry = ws.registry();
    let report = registry.load_all(true).unwrap();

    let failed: Vec<_> = report.failed().map(|r| r.source_id.as_str()).collect();
    assert_eq!(failed, vec!["dblp"]);
    match &report.get("dblp").unwrap().outcome {
        SourceOutcome::Failed { error } => {
            assert!(matches!(error, Error::FetchFailed { source_id, .. } if source_id == "dblp"));
            assert!(error.to_string().contains("no files match"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(matches!(
        report.get("or").unwrap().outcome,
        SourceOutcome::Loaded {
            from_cache: false,
            ..
        }
    ));

    // The old cache survives the failed fetch
    assert_eq!(registry.store().row_count("event_dblp").unwrap(), 3);
    assert_eq!(registry.query("SELECT * FROM event", &[]).unwrap().len(), 5);
}

#[test]
fn test_csv_import_then_persist() {
    let ws = Workspace::new();
    let mut registry = ws.registry();
    registry.load_all(false).unwrap();

    let outcome = registry
        .import_csv("or", "event", "eventId,city\r\nQ1,Online\r\nQ3,Rome\r\n", false)
        .unwrap();
    assert_eq!((outcome.added, outcome.updated), (1, 1));

    let or = registry.get_source("or").unwrap();
    assert_eq!(or.events.get("Q1").unwrap().get_str("acronym"), Some("AAAI 2021"));
    assert_eq!(registry.store().row_count("event_orwiki").unwrap(), 3);

    let rows = registry
        .query("SELECT city FROM event WHERE eventId = 'Q3'", &[])
        .unwrap();
    assert_eq!(rows[0].get_str("city"), Some("Rome"));

    assert!(matches!(
        registry.import_csv("nope", "event", "eventId\r\nx\r\n", false),
        Err(Error::SourceNotFound(_))
    ));
    assert!(matches!(
        registry.import_csv("or", "venue", "eventId\r\nx\r\n", false),
        Err(Error::Malformed(_))
    ));
}

#[test]
fn test_unopenable_store_is_storage_unavailable() {
    let ws = Workspace::new();
    let blocker = ws.path("not-a-dir");
    fs::write(&blocker, "file").unwrap();

    let err = RecordStore::open(&StorageConfig::sql(blocker.join("EventCorpus.db"))).err().unwrap();
    assert!(matches!(err, Error::StorageUnavailable(_)));
    assert!(err.is_cross_cutting());
}
