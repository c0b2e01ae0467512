//! The records-and-feedback view: one row per record, widened with one
//! column per feedback function name.
//!
//! Two scans feed it. The feedback scan left-joins records to feedbacks so a
//! record without feedback still yields one row. The record scan joins
//! records to apps and derives the cost, latency and app type columns. The
//! feedback rows are grouped per record into `(name, result, calls)` cells,
//! collapsed column by column with "first non-missing value wins", and
//! joined onto the record rows by `record_id`.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use trulens_store_core::{
    decode_json, is_missing, unwrap_calls_value, App, AppId, Cost, Perf, Row, Table,
};

pub(crate) const FEEDBACK_SCAN_COLUMNS: [&str; 4] = ["record_id", "calls_json", "result", "name"];

const RECORD_ID: &str = "record_id";
const JSON_COLUMNS: [&str; 4] = ["record_json", "cost_json", "perf_json", "app_json"];
const CALLS_SUFFIX: &str = "_calls";
const FEEDBACK_SUFFIX: &str = "_feedback";

/// One joined row of the feedback scan, decoded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeedbackCell {
    pub(crate) name: String,
    pub(crate) result: Value,
    pub(crate) calls: Value,
}

/// Feedback cells grouped by record, in scan order.
#[derive(Debug, Default)]
pub(crate) struct FeedbackScan {
    record_order: Vec<String>,
    cells: HashMap<String, Vec<FeedbackCell>>,
}

impl FeedbackScan {
    fn push(&mut self, record_id: String, cell: Option<FeedbackCell>) {
        if !self.cells.contains_key(&record_id) {
            self.record_order.push(record_id.clone());
        }
        let entry = self.cells.entry(record_id).or_default();
        if let Some(cell) = cell {
            entry.push(cell);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.record_order.is_empty()
    }
}

/// Collapsed pivot: one row of feedback columns per record.
#[derive(Debug, Default)]
pub(crate) struct Pivot {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: HashMap<String, Row>,
    pub(crate) names: BTreeSet<String>,
}

pub(crate) fn records_and_feedback(
    conn: &Connection,
    app_ids: &[AppId],
) -> Result<(Table, Vec<String>)> {
    let feedback = scan_feedback(conn, app_ids)?;
    if feedback.is_empty() {
        return Ok((Table::with_columns(FEEDBACK_SCAN_COLUMNS), Vec::new()));
    }

    let records = scan_records(conn, app_ids)?;
    if records.is_empty() {
        return Ok((records, Vec::new()));
    }

    let pivot = pivot_feedback(&feedback, records.columns());
    let merged = merge(records, &pivot);
    Ok((merged, pivot.names.into_iter().collect()))
}

fn app_filter(app_ids: &[AppId]) -> String {
    if app_ids.is_empty() {
        String::new()
    } else {
        format!("WHERE r.app_id IN ({})", vec!["?"; app_ids.len()].join(", "))
    }
}

fn scan_feedback(conn: &Connection, app_ids: &[AppId]) -> Result<FeedbackScan> {
    let sql = format!(
        "SELECT r.record_id, f.calls_json, f.result, f.name
         FROM records r
            LEFT JOIN feedbacks f ON r.record_id = f.record_id
         {}
         ORDER BY r.rowid ASC, f.rowid ASC",
        app_filter(app_ids)
    );
    let mut stmt = conn
        .prepare(&sql)
        .context("failed to prepare feedback scan")?;
    let mut rows = stmt.query(params_from_iter(app_ids.iter().map(AppId::as_str)))?;

    let mut scan = FeedbackScan::default();
    while let Some(row) = rows.next()? {
        let record_id: String = row.get(0)?;
        let calls_json: Option<String> = row.get(1)?;
        let result: Option<f64> = row.get(2)?;
        let name: Option<String> = row.get(3)?;

        let cell = match name {
            Some(name) => {
                let calls = match calls_json {
                    Some(raw) => unwrap_calls_value(&raw)
                        .with_context(|| format!("feedback {name} on record {record_id}"))?,
                    None => Value::Null,
                };
                Some(FeedbackCell {
                    name,
                    result: real_to_json(result),
                    calls,
                })
            }
            None => None,
        };
        scan.push(record_id, cell);
    }

    Ok(scan)
}

fn scan_records(conn: &Connection, app_ids: &[AppId]) -> Result<Table> {
    let sql = format!(
        "SELECT DISTINCT r.*, a.app_json
         FROM records r
            JOIN apps a ON r.app_id = a.app_id
         {}
         ORDER BY r.ts ASC, r.record_id ASC",
        app_filter(app_ids)
    );
    let mut stmt = conn
        .prepare(&sql)
        .context("failed to prepare record scan")?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = stmt.query(params_from_iter(app_ids.iter().map(AppId::as_str)))?;

    let mut table = Table::with_columns(columns.iter().cloned());
    for derived in ["type", "total_tokens", "total_cost", "latency"] {
        table.ensure_column(derived);
    }

    while let Some(row) = rows.next()? {
        let mut out = Row::new();
        for (index, column) in columns.iter().enumerate() {
            let value = sql_to_json(row.get_ref(index)?, column)?;
            out.insert(column.clone(), value);
        }
        decode_record_row(&mut out)?;
        table.push_row(out);
    }

    Ok(table)
}

fn decode_record_row(row: &mut Row) -> Result<()> {
    for column in JSON_COLUMNS {
        let decoded = match row.get(column) {
            Some(Value::String(raw)) => decode_json::<Value>(column, raw)?,
            _ => return Err(anyhow!("record scan is missing text column {column}")),
        };
        row.insert(column.to_string(), decoded);
    }

    let app: App = serde_json::from_value(row["app_json"].clone())
        .context("invalid app_json payload")?;
    let cost: Cost = serde_json::from_value(row["cost_json"].clone())
        .context("invalid cost_json payload")?;
    let perf: Perf = serde_json::from_value(row["perf_json"].clone())
        .context("invalid perf_json payload")?;

    row.insert("type".to_string(), Value::String(app.root_class));
    row.insert("total_tokens".to_string(), Value::from(cost.n_tokens));
    row.insert("total_cost".to_string(), real_to_json(Some(cost.cost)));
    row.insert("latency".to_string(), real_to_json(Some(perf.latency)));
    Ok(())
}

/// Builds one row of feedback columns per record. Each column keeps the
/// first non-missing value in scan order, independently of its sibling
/// columns; later values for the same name on the same record are dropped.
/// A name that collides with a column of `reserved` is pivoted under
/// `<name>_feedback` instead.
pub(crate) fn pivot_feedback(scan: &FeedbackScan, reserved: &[String]) -> Pivot {
    let mut pivot = Pivot::default();
    let mut renamed = BTreeSet::new();

    for record_id in &scan.record_order {
        let mut row = Row::new();
        for cell in scan.cells.get(record_id).into_iter().flatten() {
            let column = pivot_column(&cell.name, reserved);
            if column != cell.name && renamed.insert(cell.name.clone()) {
                tracing::warn!(
                    "feedback name {} collides with a record column; pivoted as {}",
                    cell.name,
                    column
                );
            }
            let calls_column = format!("{column}{CALLS_SUFFIX}");

            if pivot.names.insert(column.clone()) {
                pivot.columns.push(column.clone());
                pivot.columns.push(calls_column.clone());
            }
            keep_first_present(&mut row, &column, &cell.result);
            keep_first_present(&mut row, &calls_column, &cell.calls);
        }
        pivot.rows.insert(record_id.clone(), row);
    }

    pivot
}

fn pivot_column(name: &str, reserved: &[String]) -> String {
    let mut column = name.to_string();
    while reserved.iter().any(|taken| {
        *taken == column
            || taken
                .strip_suffix(CALLS_SUFFIX)
                .is_some_and(|stem| stem == column)
    }) {
        column.push_str(FEEDBACK_SUFFIX);
    }
    column
}

fn keep_first_present(row: &mut Row, column: &str, value: &Value) {
    if is_missing(value) || row.get(column).is_some_and(|existing| !is_missing(existing)) {
        return;
    }
    row.insert(column.to_string(), value.clone());
}

/// Inner join of the record rows with the pivot on `record_id`, keeping the
/// record scan's order.
fn merge(records: Table, pivot: &Pivot) -> Table {
    let mut columns = records.columns().to_vec();
    columns.extend(pivot.columns.iter().cloned());
    let mut merged = Table::with_columns(columns);

    for mut row in records.into_rows() {
        let Some(record_id) = row.get(RECORD_ID).and_then(Value::as_str) else {
            continue;
        };
        let Some(feedback) = pivot.rows.get(record_id) else {
            continue;
        };
        for (column, value) in feedback {
            row.insert(column.clone(), value.clone());
        }
        merged.push_row(row);
    }

    merged
}

fn real_to_json(value: Option<f64>) -> Value {
    value
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn sql_to_json(value: ValueRef<'_>, column: &str) -> Result<Value> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(value) => Ok(Value::from(value)),
        ValueRef::Real(value) => Ok(real_to_json(Some(value))),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes)
                .with_context(|| format!("column {column} holds invalid UTF-8"))?;
            Ok(Value::String(text.to_string()))
        }
        ValueRef::Blob(_) => Err(anyhow!("column {column} holds an unexpected blob")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell(name: &str, result: Value, calls: Value) -> FeedbackCell {
        FeedbackCell {
            name: name.to_string(),
            result,
            calls,
        }
    }

    fn reserved() -> Vec<String> {
        ["record_id", "ts", "latency"]
            .iter()
            .map(|column| (*column).to_string())
            .collect()
    }

    #[test]
    fn record_without_feedback_gets_an_empty_pivot_row() {
        let mut scan = FeedbackScan::default();
        scan.push("r1".to_string(), None);

        let pivot = pivot_feedback(&scan, &reserved());
        assert!(pivot.names.is_empty());
        assert!(pivot.columns.is_empty());
        assert_eq!(pivot.rows.get("r1"), Some(&Row::new()));
    }

    #[test]
    fn distinct_names_become_distinct_columns() {
        let mut scan = FeedbackScan::default();
        scan.push("r1".to_string(), Some(cell("relevance", json!(0.8), json!([]))));
        scan.push("r1".to_string(), Some(cell("groundedness", json!(0.3), json!([{"ret": 0.3}]))));

        let pivot = pivot_feedback(&scan, &reserved());
        assert_eq!(
            pivot.columns,
            ["relevance", "relevance_calls", "groundedness", "groundedness_calls"]
        );
        let row = &pivot.rows["r1"];
        assert_eq!(row["relevance"], json!(0.8));
        assert_eq!(row["groundedness_calls"], json!([{"ret": 0.3}]));
    }

    #[test]
    fn first_present_value_wins_per_column() {
        let mut scan = FeedbackScan::default();
        scan.push("r1".to_string(), Some(cell("relevance", Value::Null, json!(["first"]))));
        scan.push("r1".to_string(), Some(cell("relevance", json!(0.4), json!(["second"]))));
        scan.push("r1".to_string(), Some(cell("relevance", json!(0.9), json!(["third"]))));

        let pivot = pivot_feedback(&scan, &reserved());
        let row = &pivot.rows["r1"];
        assert_eq!(row["relevance"], json!(0.4));
        assert_eq!(row["relevance_calls"], json!(["first"]));
    }

    #[test]
    fn zero_and_false_results_are_present() {
        let mut scan = FeedbackScan::default();
        scan.push("r1".to_string(), Some(cell("toxicity", json!(0.0), json!([]))));
        scan.push("r1".to_string(), Some(cell("toxicity", json!(1.0), json!([]))));

        let pivot = pivot_feedback(&scan, &reserved());
        assert_eq!(pivot.rows["r1"]["toxicity"], json!(0.0));
    }

    #[test]
    fn names_colliding_with_record_columns_get_a_suffix() {
        let mut scan = FeedbackScan::default();
        scan.push("r1".to_string(), Some(cell("latency", json!(0.1), json!([1]))));
        scan.push("r1".to_string(), Some(cell("relevance", json!(0.2), json!([]))));

        let pivot = pivot_feedback(&scan, &reserved());
        assert_eq!(
            pivot.names.iter().collect::<Vec<_>>(),
            ["latency_feedback", "relevance"]
        );
        let row = &pivot.rows["r1"];
        assert!(!row.contains_key("latency"));
        assert_eq!(row["latency_feedback"], json!(0.1));
        assert_eq!(row["latency_feedback_calls"], json!([1]));
    }

    #[test]
    fn suffix_repeats_until_the_column_is_free() {
        let mut reserved = reserved();
        reserved.push("ts_feedback_calls".to_string());
        assert_eq!(pivot_column("ts", &reserved), "ts_feedback_feedback");
        assert_eq!(pivot_column("record", &reserved), "record");
    }

    #[test]
    fn merge_is_inner_on_record_id_and_keeps_record_order() {
        let mut records = Table::with_columns(["record_id", "ts"]);
        for (record_id, ts) in [("r2", 1.0), ("r1", 2.0), ("r3", 3.0)] {
            let mut row = Row::new();
            row.insert("record_id".to_string(), json!(record_id));
            row.insert("ts".to_string(), json!(ts));
            records.push_row(row);
        }

        let mut scan = FeedbackScan::default();
        scan.push("r1".to_string(), Some(cell("relevance", json!(0.5), json!([]))));
        scan.push("r2".to_string(), None);
        let pivot = pivot_feedback(&scan, &reserved());

        let merged = merge(records, &pivot);
        assert_eq!(
            merged.column("record_id").collect::<Vec<_>>(),
            [&json!("r2"), &json!("r1")]
        );
        assert_eq!(merged.get(0, "relevance"), &Value::Null);
        assert_eq!(merged.get(1, "relevance"), &json!(0.5));
        assert_eq!(
            merged.columns(),
            ["record_id", "ts", "relevance", "relevance_calls"]
        );
    }

    #[test]
    fn nan_reals_read_as_missing() {
        assert_eq!(real_to_json(Some(f64::NAN)), Value::Null);
        assert_eq!(real_to_json(None), Value::Null);
        assert_eq!(real_to_json(Some(0.25)), json!(0.25));
    }
}
