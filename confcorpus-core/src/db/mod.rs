//! Storage layer for confcorpus
//!
//! This module provides the record store using SQLite with:
//! - One physical table per (entity kind, source) pair
//! - Cache metadata for staleness checks
//! - Read queries and view DDL over the cached tables

pub mod schema;
pub mod store;

pub use store::{CacheInfo, RecordStore, ReplaceOutcome, TableInfo, TableOwner};
