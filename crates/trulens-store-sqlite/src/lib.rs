#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use trulens_store_core::{
    decode_json, json_str_of_obj, unix_seconds, wrap_calls, App, AppId, DbMeta,
    FeedbackDefinition, FeedbackDefinitionId, FeedbackFilter, FeedbackResult, FeedbackResultId,
    FeedbackResultStatus, FeedbackRow, Record, RecordId, Table, TruDb,
};

mod aggregate;
mod query;
mod schema;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Where the database lives and how long a writer waits on a locked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

/// File-backed store. Every operation opens its own connection, runs in one
/// transaction and closes the connection again, so a `LocalSqlite` holds no
/// open handle between calls and can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct LocalSqlite {
    config: SqliteConfig,
}

impl LocalSqlite {
    /// Opens (creating if needed) the database at `config.path` and brings
    /// its schema up to date.
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let db = Self { config };
        db.ensure_schema()?;
        Ok(db)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.with_transaction("ensure schema", |tx| schema::ensure_schema(tx))
    }

    fn connect(&self) -> Result<Connection> {
        let path = &self.config.path;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(self.config.busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        Ok(conn)
    }

    /// Runs `op` inside a transaction on a fresh connection. The transaction
    /// commits when `op` succeeds and rolls back when it is dropped on error.
    fn with_transaction<T>(
        &self,
        operation: &str,
        op: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .with_context(|| format!("failed to start {operation} transaction"))?;
        let value = op(&tx)?;
        tx.commit()
            .with_context(|| format!("failed to commit {operation} transaction"))?;
        Ok(value)
    }
}

impl Display for LocalSqlite {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SQLite({})", self.config.path.display())
    }
}

impl TruDb for LocalSqlite {
    fn reset_database(&self) -> Result<()> {
        self.with_transaction("reset", |tx| {
            schema::drop_data_tables(tx)?;
            schema::ensure_schema(tx)
        })?;
        tracing::info!("reset {}", self);
        Ok(())
    }

    fn insert_record(&self, record: &Record) -> Result<RecordId> {
        let record_json = json_str_of_obj(record).context("failed to serialize record")?;
        let cost_json = json_str_of_obj(&record.cost).context("failed to serialize record cost")?;
        let perf_json = json_str_of_obj(&record.perf).context("failed to serialize record perf")?;

        self.with_transaction("record insert", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO records(
                    record_id, app_id, input, output, record_json,
                    tags, ts, cost_json, perf_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.record_id.as_str(),
                    record.app_id.as_str(),
                    record.main_input,
                    record.main_output,
                    record_json,
                    record.tags,
                    unix_seconds(record.ts),
                    cost_json,
                    perf_json,
                ],
            )
            .context("failed to insert record")?;
            Ok(())
        })?;

        tracing::info!(
            "✅ record {} from {} -> {}",
            record.record_id,
            record.app_id,
            self
        );
        Ok(record.record_id.clone())
    }

    fn insert_app(&self, app: &App) -> Result<AppId> {
        let app_json = json_str_of_obj(app).context("failed to serialize app")?;

        self.with_transaction("app insert", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO apps(app_id, app_json) VALUES (?1, ?2)",
                params![app.app_id.as_str(), app_json],
            )
            .context("failed to insert app")?;
            Ok(())
        })?;

        tracing::info!("✅ app {} -> {}", app.app_id, self);
        Ok(app.app_id.clone())
    }

    fn insert_feedback_definition(
        &self,
        feedback_definition: &FeedbackDefinition,
    ) -> Result<FeedbackDefinitionId> {
        let feedback_json = json_str_of_obj(feedback_definition)
            .context("failed to serialize feedback definition")?;
        let id = &feedback_definition.feedback_definition_id;

        self.with_transaction("feedback definition insert", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO feedback_defs(feedback_definition_id, feedback_json)
                 VALUES (?1, ?2)",
                params![id.as_str(), feedback_json],
            )
            .context("failed to insert feedback definition")?;
            Ok(())
        })?;

        tracing::info!("✅ feedback definition {} -> {}", id, self);
        Ok(id.clone())
    }

    fn insert_feedback(&self, feedback_result: &FeedbackResult) -> Result<FeedbackResultId> {
        let calls_json =
            wrap_calls(&feedback_result.calls).context("failed to serialize feedback calls")?;
        let cost_json =
            json_str_of_obj(&feedback_result.cost).context("failed to serialize feedback cost")?;

        self.with_transaction("feedback insert", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO feedbacks(
                    feedback_result_id, record_id, feedback_definition_id, last_ts,
                    status, error, calls_json, result, name, cost_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    feedback_result.feedback_result_id.as_str(),
                    feedback_result.record_id.as_str(),
                    feedback_result.feedback_definition_id.as_str(),
                    unix_seconds(feedback_result.last_ts),
                    feedback_result.status.as_str(),
                    feedback_result.error,
                    calls_json,
                    feedback_result.result,
                    feedback_result.name,
                    cost_json,
                ],
            )
            .context("failed to insert feedback result")?;
            Ok(())
        })?;

        let marker = if feedback_result.status == FeedbackResultStatus::Done {
            "✅"
        } else {
            "⚡"
        };
        tracing::info!(
            "{} feedback {} on {} -> {}",
            marker,
            feedback_result.feedback_result_id,
            feedback_result.record_id,
            self
        );
        Ok(feedback_result.feedback_result_id.clone())
    }

    fn get_feedback_defs(
        &self,
        feedback_definition_id: Option<&FeedbackDefinitionId>,
    ) -> Result<Vec<FeedbackDefinition>> {
        self.with_transaction("feedback definition read", |tx| {
            let mut stmt = tx
                .prepare(
                    "SELECT feedback_json
                     FROM feedback_defs
                     WHERE ?1 IS NULL OR feedback_definition_id = ?1
                     ORDER BY feedback_definition_id ASC",
                )
                .context("failed to prepare feedback definition query")?;
            let mut rows = stmt.query(params![feedback_definition_id.map(|id| id.as_str())])?;

            let mut definitions = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row.get(0)?;
                definitions.push(decode_json("feedback_json", &raw)?);
            }
            Ok(definitions)
        })
    }

    fn get_feedback(&self, filter: &FeedbackFilter) -> Result<Vec<FeedbackRow>> {
        self.with_transaction("feedback read", |tx| query::select_feedback(tx, filter))
    }

    fn get_app(&self, app_id: &AppId) -> Result<Option<Value>> {
        let raw = self.with_transaction("app read", |tx| {
            tx.query_row(
                "SELECT app_json FROM apps WHERE app_id = ?1",
                params![app_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read app")
        })?;

        match raw {
            Some(raw) => Ok(Some(decode_json("app_json", &raw)?)),
            None => Ok(None),
        }
    }

    fn get_records_and_feedback(&self, app_ids: &[AppId]) -> Result<(Table, Vec<String>)> {
        self.with_transaction("records and feedback read", |tx| {
            aggregate::records_and_feedback(tx, app_ids)
        })
    }

    fn get_meta(&self) -> Result<DbMeta> {
        self.with_transaction("meta read", |tx| schema::read_meta(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use time::OffsetDateTime;
    use trulens_store_core::{Cost, FeedbackCall, Perf};
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db(name: &str) -> LocalSqlite {
        let path = std::env::temp_dir().join(format!(
            "trulens-store-test-{name}-{}.sqlite",
            Ulid::new()
        ));
        must(LocalSqlite::open(SqliteConfig::new(path)))
    }

    fn cleanup(db: &LocalSqlite) {
        let path = db.path().to_path_buf();
        let _ = std::fs::remove_file(&path);
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(sidecar);
        }
    }

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(seconds).unwrap_or_else(|_| unreachable!())
    }

    fn app(app_id: &str) -> App {
        App {
            app_id: AppId::from(app_id),
            root_class: "RetrievalChain".to_string(),
            app: json!({"llm": "stub"}),
            feedback_definitions: Vec::new(),
        }
    }

    fn record(record_id: &str, app_id: &str, ts: i64) -> Record {
        Record {
            record_id: RecordId::from(record_id),
            app_id: AppId::from(app_id),
            main_input: Some("question".to_string()),
            main_output: Some("answer".to_string()),
            main_error: None,
            tags: "-".to_string(),
            ts: at(ts),
            cost: Cost {
                n_tokens: 12,
                cost: 0.002,
            },
            perf: Perf::between(at(ts), at(ts + 2)),
            calls: Vec::new(),
        }
    }

    fn definition(name: &str) -> FeedbackDefinition {
        match FeedbackDefinition::new(name, json!({"fn": name}), BTreeMap::new()) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn open_stamps_meta_and_display_names_the_file() {
        let db = temp_db("meta");
        let meta = must(db.get_meta());
        assert_eq!(meta.trulens_version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
        assert!(db.to_string().starts_with("SQLite("));
        cleanup(&db);
    }

    #[test]
    fn missing_app_reads_as_none() {
        let db = temp_db("missing-app");
        assert_eq!(must(db.get_app(&AppId::from("nope"))), None);

        must(db.insert_app(&app("a1")));
        let stored = must(db.get_app(&AppId::from("a1")));
        assert_eq!(
            stored.as_ref().and_then(|value| value.get("root_class")),
            Some(&json!("RetrievalChain"))
        );
        cleanup(&db);
    }

    #[test]
    fn inserts_are_upserts_keyed_by_id() {
        let db = temp_db("upsert");
        must(db.insert_app(&app("a1")));
        let mut replaced = app("a1");
        replaced.root_class = "Agent".to_string();
        must(db.insert_app(&replaced));

        let stored = must(db.get_app(&AppId::from("a1")));
        assert_eq!(
            stored.as_ref().and_then(|value| value.get("root_class")),
            Some(&json!("Agent"))
        );
        cleanup(&db);
    }

    #[test]
    fn feedback_defs_filter_by_id() {
        let db = temp_db("defs");
        let relevance = definition("relevance");
        let groundedness = definition("groundedness");
        must(db.insert_feedback_definition(&relevance));
        must(db.insert_feedback_definition(&groundedness));
        must(db.insert_feedback_definition(&relevance));

        assert_eq!(must(db.get_feedback_defs(None)).len(), 2);
        let only = must(db.get_feedback_defs(Some(&relevance.feedback_definition_id)));
        assert_eq!(only, vec![relevance]);
        assert!(must(db.get_feedback_defs(Some(&FeedbackDefinitionId::from("x")))).is_empty());
        cleanup(&db);
    }

    #[test]
    fn stored_calls_are_wrapped_on_disk() {
        let db = temp_db("calls");
        let def = definition("relevance");
        let result = FeedbackResult::pending(RecordId::from("r1"), &def).done(
            0.5,
            vec![FeedbackCall {
                args: BTreeMap::new(),
                ret: 0.5,
            }],
        );
        must(db.insert_feedback(&result));

        let conn = must(db.connect());
        let raw = match conn.query_row("SELECT calls_json FROM feedbacks", [], |row| {
            row.get::<_, String>(0)
        }) {
            Ok(value) => value,
            Err(err) => panic!("failed to read calls_json: {err}"),
        };
        let value: Value = serde_json::from_str(&raw).unwrap_or_else(|_| unreachable!());
        assert_eq!(value["calls"][0]["ret"], json!(0.5));
        cleanup(&db);
    }

    #[test]
    fn failed_insert_leaves_no_partial_state() {
        let db = temp_db("rollback");
        must(db.insert_app(&app("a1")));
        let err = match db.with_transaction("broken", |tx| {
            tx.execute("DELETE FROM apps", [])?;
            tx.execute("INSERT INTO no_such_table VALUES (1)", [])?;
            Ok(())
        }) {
            Ok(()) => panic!("expected failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("no_such_table"));
        assert!(must(db.get_app(&AppId::from("a1"))).is_some());
        cleanup(&db);
    }

    #[test]
    fn records_and_feedback_pivots_results() {
        let db = temp_db("pivot");
        must(db.insert_app(&app("a1")));
        must(db.insert_record(&record("r1", "a1", 100)));
        let def = definition("relevance");
        must(db.insert_feedback_definition(&def));
        must(db.insert_feedback(
            &FeedbackResult::pending(RecordId::from("r1"), &def).done(0.8, Vec::new()),
        ));

        let (table, names) = must(db.get_records_and_feedback(&[]));
        assert_eq!(names, vec!["relevance".to_string()]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0, "relevance"), &json!(0.8));
        assert_eq!(table.get(0, "type"), &json!("RetrievalChain"));
        assert_eq!(table.get(0, "total_tokens"), &json!(12));
        assert_eq!(table.get(0, "latency"), &json!(2.0));
        cleanup(&db);
    }
}
