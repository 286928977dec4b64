//! confcorpus - Scientific event corpus lookup
//!
//! Loads every configured event source into the local cache, links series
//! to events per source, rebuilds the `event` and `eventseries` union views
//! and optionally queries or exports the result.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Cache: $XDG_DATA_HOME/confcorpus/EventCorpus.db (~/.local/share/confcorpus/EventCorpus.db)
//! - Logs: $XDG_STATE_HOME/confcorpus/confcorpus.<date>.log (~/.local/state/confcorpus/)
//! - Config: $XDG_CONFIG_HOME/confcorpus/config.toml (~/.config/confcorpus/config.toml)
//!
//! Exit codes: 0 on success, 1 when configuration, storage or a request
//! fails, 2 when at least one source failed to load.

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use confcorpus_core::config::StorageMode;
use confcorpus_core::flat::records_to_csv;
use confcorpus_core::{fields_of, Config, LoadReport, RecordStore, SourceOutcome, SourceRegistry};
use process_lock::acquire_load_guard;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "confcorpus")]
#[command(about = "Load, link and query a multi-source corpus of scientific events")]
#[command(version)]
struct Args {
    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Fetch every source again instead of using the cache
    #[arg(short, long)]
    force: bool,

    /// Only load these source ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    datasources: Vec<String>,

    /// Named query or SQL text; result is printed as CSV
    #[arg(short, long)]
    query: Option<String>,

    /// List cached tables with row counts and owning source
    #[arg(long)]
    tables: bool,

    /// Merge a CSV file into one collection and re-cache it, e.g. `or:event=new.csv`
    #[arg(long, value_name = "SOURCE:KIND=FILE")]
    import: Option<String>,

    /// List the named queries from the configuration
    #[arg(long)]
    list_queries: bool,

    /// Export one collection as CSV, e.g. `dblp:event` or `dblp:eventseries`
    #[arg(long, value_name = "SOURCE:KIND")]
    export: Option<String>,

    /// Configuration file (default: $XDG_CONFIG_HOME/confcorpus/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    match args.verbose {
        0 => {}
        1 => config.logging.level = "debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }

    let _log_guard =
        confcorpus_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(sources = config.sources.len(), "confcorpus starting");

    // Serialize loads into the same cache file
    let _load_guard = match config.storage.mode {
        StorageMode::Sql => Some(
            acquire_load_guard(&config.storage.cache_path())
                .context("failed to acquire process lock")?,
        ),
        StorageMode::Memory => None,
    };

    let store = RecordStore::open(&config.storage).context("failed to open cache")?;
    eprintln!("Cache: {}", store.location());

    let mut registry =
        SourceRegistry::from_config(&config, store).context("failed to register sources")?;

    let report = if args.datasources.is_empty() {
        registry.load_all(args.force)
    } else {
        let ids: Vec<&str> = args.datasources.iter().map(String::as_str).collect();
        registry.load_sources(&ids, args.force)
    }
    .context("failed to load sources")?;

    print_report(&report);

    if let Some(target) = &args.import {
        import(&mut registry, target)?;
    }
    if args.list_queries {
        for (name, sql) in registry.named_queries() {
            println!("{}\t{}", name, sql);
        }
    }
    if args.tables {
        print_tables(&registry)?;
    }
    if let Some(target) = &args.export {
        export(&registry, target)?;
    }
    if let Some(query) = &args.query {
        run_query(&registry, query)?;
    }

    if report.is_complete() {
        tracing::info!("confcorpus finished");
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!(failed = report.failed().count(), "confcorpus finished with failures");
        Ok(ExitCode::from(2))
    }
}

/// Load summary on stderr so stdout stays machine readable
fn print_report(report: &LoadReport) {
    for source in &report.sources {
        match &source.outcome {
            SourceOutcome::Loaded {
                events,
                series,
                link_stats,
                from_cache,
            } => {
                eprintln!(
                    "  - {}: {} event(s), {} series, {} unresolved series key(s){}",
                    source.source_id,
                    events,
                    series,
                    link_stats.unresolved_keys.len(),
                    if *from_cache { " (cached)" } else { "" }
                );
            }
            SourceOutcome::Failed { error } => {
                eprintln!("  - {}: FAILED: {}", source.source_id, error);
            }
        }
    }
    for view in &report.views {
        if view.tables.is_empty() {
            eprintln!("View {}: no tables", view.name);
        } else {
            eprintln!("View {}: {}", view.name, view.tables.join(", "));
        }
    }
}

fn print_tables(registry: &SourceRegistry) -> Result<()> {
    let tables = registry.list_tables().context("failed to list tables")?;
    for table in tables {
        let owner = registry
            .get_source_for_table(&table.name)
            .map(|s| s.id())
            .unwrap_or("-");
        println!("{}\t{}\t{}", table.name, table.row_count, owner);
    }
    Ok(())
}

fn import(registry: &mut SourceRegistry, target: &str) -> Result<()> {
    let (collection, path) = target
        .split_once('=')
        .with_context(|| format!("--import expects SOURCE:KIND=FILE, got {:?}", target))?;
    let (source_id, kind) = collection
        .split_once(':')
        .with_context(|| format!("--import expects SOURCE:KIND=FILE, got {:?}", target))?;
    let text =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;

    let outcome = registry
        .import_csv(source_id, kind, &text, false)
        .with_context(|| format!("failed to import {}", path))?;
    eprintln!(
        "Imported {}: {} added, {} updated",
        collection, outcome.added, outcome.updated
    );
    Ok(())
}

fn export(registry: &SourceRegistry, target: &str) -> Result<()> {
    let (source_id, kind) = target
        .split_once(':')
        .with_context(|| format!("--export expects SOURCE:KIND, got {:?}", target))?;
    let source = registry
        .get_source(source_id)
        .with_context(|| format!("unknown source {:?}", source_id))?;
    let collection = source
        .collection(kind)
        .with_context(|| format!("unknown entity kind {:?} (use event or eventseries)", kind))?;

    let csv = collection.as_csv().context("failed to export CSV")?;
    print!("{}", csv);
    Ok(())
}

fn run_query(registry: &SourceRegistry, query: &str) -> Result<()> {
    let rows = registry
        .query(query, &[])
        .with_context(|| format!("query failed: {}", query))?;
    if rows.is_empty() {
        eprintln!("No rows");
        return Ok(());
    }
    let csv = records_to_csv(&rows, &fields_of(&rows)).context("failed to format result")?;
    print!("{}", csv);
    Ok(())
}
