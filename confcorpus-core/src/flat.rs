//! Flat record interchange: CSV and JSON list-of-dicts
//!
//! CSV output is comma separated and CRLF terminated, with a quoted header
//! row naming the exported fields in order. Text cells are quoted; numbers,
//! booleans and dates are written bare. On read only bare cells are
//! type-inferred, so text such as `"1984"` or `"true"` stays text. A bare
//! empty cell reads back as an absent field, a quoted one as empty text.

use crate::error::{Error, Result};
use crate::types::{Record, Value};

/// Write records as CSV restricted to `fields`, in that order.
pub fn records_to_csv<'a, I>(records: I, fields: &[String]) -> Result<String>
where
    I: IntoIterator<Item = &'a Record>,
{
    // cells are quoted by csv_cell
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b',')
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());

    writer.write_record(fields.iter().map(|f| quote(f)))?;
    for record in records {
        writer.write_record(fields.iter().map(|f| csv_cell(record.get(f))))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Malformed(format!("failed to flush CSV: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::Malformed(format!("CSV is not UTF-8: {}", e)))
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::Text(s)) => quote(s),
        // Debug keeps the fraction, e.g. 4.0, so the cell reads back as real
        Some(Value::Real(f)) => format!("{:?}", f),
        Some(other) => other.to_string(),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Parse CSV text with a header row into records.
///
/// Bare cells are type-inferred via [`Value::infer`] and skipped when
/// empty; quoted cells are always text.
pub fn records_from_csv(text: &str) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let raw = row
            .position()
            .and_then(|pos| text.as_bytes().get(pos.byte() as usize..))
            .unwrap_or(&[]);
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .zip(quoted_cells(raw, &row))
            .filter_map(|((name, cell), quoted)| {
                let value = if quoted {
                    Value::Text(cell.to_string())
                } else if cell.is_empty() {
                    return None;
                } else {
                    Value::infer(cell)
                };
                Some((name.to_string(), value))
            })
            .collect();
        records.push(record);
    }
    Ok(records)
}

/// Which cells of `row` were quoted in `raw`, the input starting at the row.
///
/// The csv reader does not report quoting, so the raw row is walked using
/// the decoded cells: a bare cell spans exactly its decoded bytes.
fn quoted_cells(raw: &[u8], row: &csv::StringRecord) -> Vec<bool> {
    let mut quoted = Vec::with_capacity(row.len());
    let mut p = 0;
    for cell in row.iter() {
        if raw.get(p) == Some(&b'"') {
            quoted.push(true);
            p += 1;
            while p < raw.len() {
                if raw[p] == b'"' {
                    if raw.get(p + 1) == Some(&b'"') {
                        p += 2;
                        continue;
                    }
                    p += 1;
                    break;
                }
                p += 1;
            }
            while p < raw.len() && !matches!(raw[p], b',' | b'\r' | b'\n') {
                p += 1;
            }
        } else {
            quoted.push(false);
            p += cell.len();
        }
        p += 1;
    }
    quoted
}

/// Parse a JSON array of objects.
pub fn records_from_json(text: &str) -> Result<Vec<Record>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                Record::from_json(item)
                    .ok_or_else(|| Error::Malformed(format!("element {} is not a JSON object", i)))
            })
            .collect(),
        _ => Err(Error::Malformed(
            "expected a JSON array of objects".to_string(),
        )),
    }
}

/// Parse JSON lines, one object per non-blank line.
pub fn records_from_jsonl(text: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)?;
        let record = Record::from_json(value).ok_or_else(|| {
            Error::Malformed(format!("line {} is not a JSON object", line_no + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}
