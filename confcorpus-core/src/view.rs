//! Union views across sources
//!
//! For an entity kind, every cached table named `<kind>_<suffix>` is
//! projected onto a fixed column list and the projections are concatenated
//! with `UNION ALL` into a view named after the kind. Rebuilding always
//! recomputes the table list from the catalogue.

use crate::db::store::quote_ident;
use crate::db::RecordStore;
use crate::error::Result;
use std::collections::HashSet;

/// Default projection of the `event` view
pub const EVENT_PROJECTION: &[&str] = &[
    "eventId",
    "title",
    "url",
    "city",
    "country",
    "region",
    "countryIso",
    "regionIso",
    "acronym",
    "source",
    "year",
];

/// Default projection of the `eventseries` view
pub const EVENTSERIES_PROJECTION: &[&str] = &["acronym", "title", "url", "source"];

/// A physical table taking part in a union view, with its columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewTable {
    pub name: String,
    pub columns: Vec<String>,
}

/// Outcome of [`build_union_view`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionView {
    pub name: String,
    /// Tables included, sorted
    pub tables: Vec<String>,
    /// The installed definition; `None` when no table matched and the view
    /// was dropped
    pub ddl: Option<String>,
}

/// Whether `table` follows the `<view_name>_<suffix>` convention
pub fn is_view_member(view_name: &str, table: &str) -> bool {
    table
        .strip_prefix(view_name)
        .and_then(|rest| rest.strip_prefix('_'))
        .map(|suffix| !suffix.is_empty())
        .unwrap_or(false)
}

/// `CREATE VIEW` text for the given tables, or `None` without tables.
///
/// Projected columns a table lacks are selected as `NULL`.
pub fn union_view_ddl(view_name: &str, projection: &[String], tables: &[ViewTable]) -> Option<String> {
    if tables.is_empty() {
        return None;
    }

    let selects: Vec<String> = tables
        .iter()
        .map(|table| {
            let columns: Vec<String> = projection
                .iter()
                .map(|field| {
                    if table.columns.iter().any(|c| c == field) {
                        quote_ident(field)
                    } else {
                        format!("NULL AS {}", quote_ident(field))
                    }
                })
                .collect();
            format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&table.name))
        })
        .collect();

    Some(format!(
        "CREATE VIEW {} AS {}",
        quote_ident(view_name),
        selects.join(" UNION ALL ")
    ))
}

/// (Re)install the union view `view_name` in the store.
///
/// Any previous definition is dropped first. When no table matches, the
/// view stays dropped.
pub fn build_union_view(
    store: &RecordStore,
    view_name: &str,
    projection: &[String],
    exclude: Option<&HashSet<String>>,
) -> Result<UnionView> {
    let mut tables = Vec::new();
    for info in store.list_tables()? {
        if !is_view_member(view_name, &info.name) {
            continue;
        }
        if exclude.is_some_and(|ex| ex.contains(&info.name)) {
            tracing::debug!(view = view_name, table = %info.name, "Excluded from view");
            continue;
        }
        let columns = store.column_names(&info.name)?;
        tables.push(ViewTable {
            name: info.name,
            columns,
        });
    }

    store.execute_ddl(&format!("DROP VIEW IF EXISTS {}", quote_ident(view_name)))?;

    let ddl = union_view_ddl(view_name, projection, &tables);
    match &ddl {
        Some(sql) => {
            store.execute_ddl(sql)?;
            tracing::info!(view = view_name, tables = tables.len(), "Built union view");
        }
        None => tracing::warn!(view = view_name, "No tables for view; view dropped"),
    }

    Ok(UnionView {
        name: view_name.to_string(),
        tables: tables.into_iter().map(|t| t.name).collect(),
        ddl,
    })
}

/// Projection as owned strings
pub fn projection(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}
