//! Fetch collaborators
//!
//! A [`Fetcher`] hands an entity collection the raw records of one entity
//! kind from one source. Remote adapters (wikis, SPARQL endpoints, scrapers)
//! live outside this crate; the only built-in adapter is [`FileFetcher`],
//! which reads exported record files from disk.
//!
//! A fetcher must report failure instead of returning a partial list. Any
//! retry or timeout policy belongs to the fetcher itself.

use crate::error::BoxError;
use crate::flat;
use crate::types::Record;
use serde::Deserialize;
use std::path::PathBuf;

/// Supplies the raw records of one entity kind.
pub trait Fetcher: Send + Sync {
    fn fetch(&self) -> std::result::Result<Vec<Record>, BoxError>;
}

impl<F> Fetcher for F
where
    F: Fn() -> std::result::Result<Vec<Record>, BoxError> + Send + Sync,
{
    fn fetch(&self) -> std::result::Result<Vec<Record>, BoxError> {
        self()
    }
}

/// On-disk record file format
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// JSON array of objects
    #[default]
    Json,
    /// One JSON object per line
    Jsonl,
    /// CSV with header row
    Csv,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Jsonl => "jsonl",
            FileFormat::Csv => "csv",
        }
    }

    fn parse(&self, text: &str) -> crate::error::Result<Vec<Record>> {
        match self {
            FileFormat::Json => flat::records_from_json(text),
            FileFormat::Jsonl => flat::records_from_jsonl(text),
            FileFormat::Csv => flat::records_from_csv(text),
        }
    }
}

impl std::str::FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(FileFormat::Json),
            "jsonl" => Ok(FileFormat::Jsonl),
            "csv" => Ok(FileFormat::Csv),
            _ => Err(format!("unknown file format: {}", s)),
        }
    }
}

/// Reads every file matching a glob pattern and concatenates their records.
///
/// Files are read in sorted path order. A pattern that matches nothing is a
/// fetch failure, not an empty result.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    pattern: String,
    format: FileFormat,
}

impl FileFetcher {
    pub fn new(pattern: impl Into<String>, format: FileFormat) -> Self {
        Self {
            pattern: pattern.into(),
            format,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Files currently matching the pattern, sorted.
    pub fn discover_files(&self) -> std::result::Result<Vec<PathBuf>, BoxError> {
        let entries = glob::glob(&self.pattern)
            .map_err(|e| format!("invalid glob pattern {:?}: {}", self.pattern, e))?;
        let mut files: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
        files.sort();
        Ok(files)
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self) -> std::result::Result<Vec<Record>, BoxError> {
        let files = self.discover_files()?;
        if files.is_empty() {
            return Err(format!("no files match {:?}", self.pattern).into());
        }

        let mut records = Vec::new();
        for path in &files {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
            let parsed = self
                .format
                .parse(&text)
                .map_err(|e| format!("{}: {}", path.display(), e))?;
            tracing::debug!(
                path = %path.display(),
                format = self.format.as_str(),
                count = parsed.len(),
                "Read record file"
            );
            records.extend(parsed);
        }
        Ok(records)
    }
}
