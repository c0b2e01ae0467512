use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use trulens_store_core::{
    decode_json, from_unix_seconds, unix_seconds, unwrap_calls, App, Cost, FeedbackDefinition,
    FeedbackFilter, FeedbackResultStatus, FeedbackRow, Perf, Record, StatusFilter, TruError,
};

/// Conjunctive WHERE fragment and its positional parameters.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct WhereClause {
    pub(crate) predicates: Vec<String>,
    pub(crate) params: Vec<SqlValue>,
}

impl WhereClause {
    fn push(&mut self, predicate: impl Into<String>, param: SqlValue) {
        self.predicates.push(predicate.into());
        self.params.push(param);
    }

    pub(crate) fn to_sql(&self) -> String {
        if self.predicates.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.predicates.join(" AND "))
        }
    }
}

/// Only filters that are set contribute a predicate.
pub(crate) fn feedback_where_clause(filter: &FeedbackFilter) -> WhereClause {
    let mut clause = WhereClause::default();

    if let Some(record_id) = &filter.record_id {
        clause.push("f.record_id = ?", SqlValue::Text(record_id.to_string()));
    }
    if let Some(feedback_result_id) = &filter.feedback_result_id {
        clause.push(
            "f.feedback_result_id = ?",
            SqlValue::Text(feedback_result_id.to_string()),
        );
    }
    if let Some(feedback_definition_id) = &filter.feedback_definition_id {
        clause.push(
            "f.feedback_definition_id = ?",
            SqlValue::Text(feedback_definition_id.to_string()),
        );
    }
    match &filter.status {
        Some(StatusFilter::One(status)) => {
            clause.push("f.status = ?", SqlValue::Text(status.as_str().to_string()));
        }
        Some(StatusFilter::AnyOf(statuses)) if statuses.is_empty() => {
            clause.predicates.push("0".to_string());
        }
        Some(StatusFilter::AnyOf(statuses)) => {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            clause
                .predicates
                .push(format!("f.status IN ({placeholders})"));
            clause.params.extend(
                statuses
                    .iter()
                    .map(|status| SqlValue::Text(status.as_str().to_string())),
            );
        }
        None => {}
    }
    if let Some(bound) = filter.last_ts_before {
        clause.push("f.last_ts <= ?", SqlValue::Real(unix_seconds(bound)));
    }

    clause
}

struct RawFeedbackRow {
    record_id: String,
    feedback_result_id: String,
    feedback_definition_id: String,
    last_ts: f64,
    status: String,
    error: Option<String>,
    name: String,
    result: Option<f64>,
    cost_json: String,
    perf_json: String,
    calls_json: String,
    feedback_json: String,
    record_json: String,
    app_json: String,
}

/// Feedback results joined with their record, definition and app. The joins
/// are inner: a result whose record, definition or app row is gone is not
/// returned.
pub(crate) fn select_feedback(
    conn: &Connection,
    filter: &FeedbackFilter,
) -> Result<Vec<FeedbackRow>> {
    let clause = feedback_where_clause(filter);
    let sql = format!(
        "SELECT
            f.record_id, f.feedback_result_id, f.feedback_definition_id,
            f.last_ts, f.status, f.error, f.name, f.result,
            f.cost_json, r.perf_json, f.calls_json,
            fd.feedback_json, r.record_json, a.app_json
         FROM records r
            JOIN feedbacks f ON r.record_id = f.record_id
            JOIN feedback_defs fd ON f.feedback_definition_id = fd.feedback_definition_id
            JOIN apps a ON r.app_id = a.app_id
         {}
         ORDER BY f.last_ts ASC, f.feedback_result_id ASC",
        clause.to_sql()
    );

    let mut stmt = conn
        .prepare(&sql)
        .context("failed to prepare feedback query")?;
    let mut rows = stmt.query(params_from_iter(clause.params.iter()))?;
    let mut raw = Vec::new();
    while let Some(row) = rows.next()? {
        raw.push(RawFeedbackRow {
            record_id: row.get(0)?,
            feedback_result_id: row.get(1)?,
            feedback_definition_id: row.get(2)?,
            last_ts: row.get(3)?,
            status: row.get(4)?,
            error: row.get(5)?,
            name: row.get(6)?,
            result: row.get(7)?,
            cost_json: row.get(8)?,
            perf_json: row.get(9)?,
            calls_json: row.get(10)?,
            feedback_json: row.get(11)?,
            record_json: row.get(12)?,
            app_json: row.get(13)?,
        });
    }

    raw.into_iter().map(decode_feedback_row).collect()
}

fn decode_feedback_row(raw: RawFeedbackRow) -> Result<FeedbackRow> {
    let status = FeedbackResultStatus::parse(&raw.status).ok_or_else(|| TruError::Decode {
        column: "status",
        message: format!("unknown status `{}`", raw.status),
    })?;
    let cost: Cost = decode_json("cost_json", &raw.cost_json)?;
    let perf: Perf = decode_json("perf_json", &raw.perf_json)?;
    let calls = unwrap_calls(&raw.calls_json)?;
    let feedback_definition: FeedbackDefinition =
        decode_json("feedback_json", &raw.feedback_json)?;
    let record: Record = decode_json("record_json", &raw.record_json)?;
    let app: App = decode_json("app_json", &raw.app_json)?;
    let last_ts = from_unix_seconds(raw.last_ts)
        .map_err(|err| anyhow!("invalid last_ts for {}: {err}", raw.feedback_result_id))?;

    Ok(FeedbackRow {
        record_id: raw.record_id.into(),
        feedback_result_id: raw.feedback_result_id.into(),
        feedback_definition_id: raw.feedback_definition_id.into(),
        last_ts,
        status,
        error: raw.error,
        name: raw.name,
        result: raw.result,
        latency: perf.latency,
        total_tokens: cost.n_tokens,
        total_cost: cost.cost,
        app_type: app.root_class.clone(),
        cost,
        perf,
        calls,
        feedback_definition,
        record,
        app,
    })
}
