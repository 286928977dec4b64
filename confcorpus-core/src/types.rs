//! Core domain types for confcorpus
//!
//! Every source delivers flat records with no shared schema. The core only
//! interprets a handful of fields:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `source` | Id of the source the record came from; stamped at load time |
//! | primary key | Per entity kind (`eventId`, `eventSeriesId`); unique inside one collection |
//! | `series` | Foreign key on events pointing at a series acronym |
//! | `acronym` | Join key on series records |
//!
//! All other fields are carried along untouched.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the field stamped with the originating source id.
pub const SOURCE_FIELD: &str = "source";

// ============================================
// Value
// ============================================

/// A single scalar field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    /// Infer a typed value from raw text (CSV cells, scraped strings).
    ///
    /// Tries integer, real, boolean and ISO date in that order before
    /// falling back to text.
    pub fn infer(text: &str) -> Value {
        if let Ok(i) = text.parse::<i64>() {
            return Value::Integer(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            if f.is_finite() {
                return Value::Real(f);
            }
        }
        match text {
            "true" | "True" => return Value::Bool(true),
            "false" | "False" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            return Value::Date(d);
        }
        Value::Text(text.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Convert from a JSON value. Nested arrays and objects are kept as JSON text.
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

// ============================================
// Record
// ============================================

/// An open-ended field map describing one event or event series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, handy for fixtures and adapters.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Remove fields holding [`Value::Null`]; the store never returns them.
    pub fn drop_nulls(&mut self) {
        self.fields.retain(|_, v| !v.is_null());
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Normalized join key for `field`.
    ///
    /// Scalars render as text and are trimmed; absent, null and blank values
    /// have no key.
    pub fn key_string(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::Null => None,
            value => {
                let key = value.to_string();
                let trimmed = key.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }

    /// Overwrite only the fields present in `patch`.
    pub fn apply_patch(&mut self, patch: &Record) {
        for (field, value) in patch.iter() {
            self.set(field, value.clone());
        }
    }

    /// Keep only the given fields, in the given order.
    pub fn project(&self, fields: &[String]) -> Record {
        let mut out = Record::new();
        for field in fields {
            if let Some(value) = self.get(field) {
                out.set(field, value.clone());
            }
        }
        out
    }

    /// Build a record from a JSON object; non-objects yield `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Record> {
        match value {
            serde_json::Value::Object(map) => Some(Record {
                fields: map
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            }),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Union of the field names of `records` in order of first appearance.
pub fn fields_of(records: &[Record]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for record in records {
        for name in record.field_names() {
            if !fields.iter().any(|f| f == name) {
                fields.push(name.to_string());
            }
        }
    }
    fields
}

// ============================================
// Entity kinds
// ============================================

/// Describes one entity kind: its name, primary key and canonical field set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKindConfig {
    /// Entity name, e.g. `Event`
    pub name: String,
    /// Plural form, e.g. `Events`
    pub plural: String,
    /// Field that identifies a record within one collection
    pub primary_key: String,
    /// Canonical fields in declaration order
    pub fields: Vec<String>,
}

impl EntityKindConfig {
    pub fn event() -> Self {
        Self {
            name: "Event".to_string(),
            plural: "Events".to_string(),
            primary_key: "eventId".to_string(),
            fields: [
                "eventId",
                "acronym",
                "series",
                "title",
                "year",
                "startDate",
                "endDate",
                "url",
                "city",
                "region",
                "country",
                "countryIso",
                "regionIso",
                SOURCE_FIELD,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    pub fn event_series() -> Self {
        Self {
            name: "EventSeries".to_string(),
            plural: "EventSeries".to_string(),
            primary_key: "eventSeriesId".to_string(),
            fields: ["eventSeriesId", "acronym", "title", "url", SOURCE_FIELD]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Same kind with a different primary key field.
    pub fn with_primary_key(mut self, primary_key: &str) -> Self {
        if !self.fields.iter().any(|f| f == primary_key) {
            self.fields.insert(0, primary_key.to_string());
        }
        self.primary_key = primary_key.to_string();
        self
    }

    /// Name of the union view and table prefix, e.g. `eventseries`.
    pub fn view_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Physical table name for one source, e.g. `event_dblp`.
    pub fn table_name(&self, table_suffix: &str) -> String {
        format!("{}_{}", self.view_name(), table_suffix)
    }
}
